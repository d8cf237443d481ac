//! # Relay
//!
//! A relay service that sponsors, bundles and indexes user operations for
//! smart-contract accounts, republishing chain activity over Nostr.

use clap::Parser;
use oprelay::cli::Args;
use tracing::{error, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if let Err(err) = Args::parse().run().await {
        error!(%err, "relay exited with an error");
        std::process::exit(1);
    }
}
