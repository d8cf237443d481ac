//! Core relay types.

mod event;
pub use event::{Event, EventArg};

mod log;
pub use log::{ExtraData, Log, LogStatus};

mod topic;
pub use topic::{parse_topics_from_hashes, Topic, Topics};

mod userop;
pub use userop::{
    parse_destination, EntryPoint, SmartAccount, SponsorPaymaster, UserOpMessage, UserOperation,
    SELECTOR_EXECUTE, SELECTOR_EXECUTE_BATCH, SELECTOR_EXEC_FROM_MODULE,
};

/// A sponsor record: the paymaster contract it serves and its encrypted
/// signing key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Sponsor {
    /// Paymaster contract address, hex.
    pub contract: String,
    /// Signing key; encrypted at rest, decrypted only inside the key store.
    pub private_key: String,
    /// Creation time.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last rotation time.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
