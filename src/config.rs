//! Relay configuration, read from the environment.

use crate::error::RelayError;
use url::Url;

fn required(name: &str) -> Result<String, RelayError> {
    std::env::var(name).map_err(|_| RelayError::Config(format!("missing env var {name}")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required_url(name: &str) -> Result<Url, RelayError> {
    required(name)?
        .parse()
        .map_err(|_| RelayError::Config(format!("env var {name} is not a valid URL")))
}

/// S3 settings for Blossom blob storage. All-or-nothing: partial AWS
/// configuration is a startup error.
#[derive(Debug, Clone)]
pub struct AwsConfig {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Region.
    pub region: String,
    /// Custom endpoint for S3-compatible stores.
    pub endpoint_url: Option<String>,
    /// Bucket name.
    pub bucket: String,
}

/// Deployment configuration. Every field without an `Option` is required;
/// a missing variable is fatal at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public URL of the Nostr relay.
    pub relay_url: String,
    /// Human-readable chain name, used to tag operator notifications.
    pub chain_name: String,
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: Url,
    /// WebSocket JSON-RPC endpoint.
    pub rpc_ws_url: Url,
    /// Database settings.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Writer host.
    pub db_host: String,
    /// Database port.
    pub db_port: String,
    /// Reader host.
    pub db_reader_host: String,
    /// Secret the sponsor keys are encrypted with.
    pub db_secret: String,
    /// Key the relay signs its own events with.
    pub relay_private_key: String,
    /// NIP-11 name.
    pub relay_info_name: String,
    /// NIP-11 description.
    pub relay_info_description: String,
    /// NIP-11 icon URL.
    pub relay_info_icon: String,
    /// Operator webhook URL.
    pub discord_url: Option<String>,
    /// Pinning service base URL; accepted but unused.
    pub pinata_base_url: Option<String>,
    /// Pinning service API key; accepted but unused.
    pub pinata_api_key: Option<String>,
    /// Pinning service API secret; accepted but unused.
    pub pinata_api_secret: Option<String>,
    /// Blob storage settings.
    pub aws: Option<AwsConfig>,
}

impl RelayConfig {
    /// Reads the configuration, collecting the §6 environment variables.
    pub fn from_env() -> Result<Self, RelayError> {
        let aws = match optional("AWS_ACCESS_KEY_ID") {
            Some(access_key_id) => Some(AwsConfig {
                access_key_id,
                secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
                region: required("AWS_DEFAULT_REGION")?,
                endpoint_url: optional("AWS_ENDPOINT_URL"),
                bucket: required("AWS_S3_BUCKET_NAME")?,
            }),
            None => None,
        };

        Ok(Self {
            relay_url: required("RELAY_URL")?,
            chain_name: required("CHAIN_NAME")?,
            rpc_url: required_url("RPC_URL")?,
            rpc_ws_url: required_url("RPC_WS_URL")?,
            db_user: required("DB_USER")?,
            db_password: required("DB_PASSWORD")?,
            db_name: required("DB_NAME")?,
            db_host: required("DB_HOST")?,
            db_port: required("DB_PORT")?,
            db_reader_host: required("DB_READER_HOST")?,
            db_secret: required("DB_SECRET")?,
            relay_private_key: required("RELAY_PRIVATE_KEY")?,
            relay_info_name: required("RELAY_INFO_NAME")?,
            relay_info_description: required("RELAY_INFO_DESCRIPTION")?,
            relay_info_icon: required("RELAY_INFO_ICON")?,
            discord_url: optional("DISCORD_URL"),
            pinata_base_url: optional("PINATA_BASE_URL"),
            pinata_api_key: optional("PINATA_API_KEY"),
            pinata_api_secret: optional("PINATA_API_SECRET"),
            aws,
        })
    }

    /// Connection string for the writer pool.
    pub fn database_url(&self) -> String {
        self.pg_url(&self.db_host)
    }

    /// Connection string for the reader pool.
    pub fn reader_database_url(&self) -> String {
        self.pg_url(&self.db_reader_host)
    }

    fn pg_url(&self, host: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, host, self.db_port, self.db_name
        )
    }
}
