//! # Relay CLI

use crate::spawn::try_spawn;
use clap::Parser;
use std::path::PathBuf;

/// The relay sponsors, bundles and indexes user operations for
/// smart-contract accounts, republishing chain activity over Nostr.
#[derive(Debug, Parser)]
#[command(author, about = "Relay", long_about = None)]
pub struct Args {
    /// The port to serve the legacy HTTP API on.
    #[arg(long, value_name = "PORT", default_value_t = 3001)]
    pub port: u16,
    /// Path to an env file loaded before reading configuration.
    #[arg(long, value_name = "PATH")]
    pub env: Option<PathBuf>,
    /// Poll the HTTP RPC for logs instead of subscribing over WebSocket.
    #[arg(long, default_value_t = false)]
    pub polling: bool,
    /// Disable the chain indexer.
    #[arg(long, default_value_t = false)]
    pub noindex: bool,
    /// Buffer size for the work queues.
    #[arg(long, value_name = "SIZE", default_value_t = 1000)]
    pub buffer: usize,
    /// Enable the operator webhook notifier.
    #[arg(long, default_value_t = false)]
    pub notify: bool,
}

impl Args {
    /// Runs the relay until shutdown.
    pub async fn run(self) -> eyre::Result<()> {
        try_spawn(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_expectations() {
        let args = Args::parse_from(["oprelay"]);
        assert_eq!(args.port, 3001);
        assert_eq!(args.buffer, 1000);
        assert!(!args.polling);
        assert!(!args.noindex);
        assert!(!args.notify);
    }

    #[test]
    fn flags_parse() {
        let args = Args::parse_from([
            "oprelay", "--port", "8080", "--polling", "--noindex", "--buffer", "50",
            "--notify", "--env", ".env.local",
        ]);
        assert_eq!(args.port, 8080);
        assert!(args.polling);
        assert!(args.noindex);
        assert_eq!(args.buffer, 50);
        assert!(args.notify);
        assert_eq!(args.env.unwrap().to_str().unwrap(), ".env.local");
    }
}
