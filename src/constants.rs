//! Relay constants.

use std::time::Duration;

/// Base fee threshold below which a chain is treated as a low-cost rollup,
/// in wei (0.01 Gwei).
pub const LOW_COST_BASE_FEE_THRESHOLD: u128 = 10_000_000;

/// Priority fee floor on low-cost chains, in wei (0.001 Gwei).
pub const LOW_COST_MIN_PRIORITY_FEE: u128 = 1_000_000;

/// Priority fee floor everywhere else, in wei (1 Gwei).
pub const DEFAULT_MIN_PRIORITY_FEE: u128 = 1_000_000_000;

/// Minimum absolute gas buffer added to estimates on low-cost chains.
pub const MIN_GAS_BUFFER: u64 = 20_000;

/// How long the bundler waits for a submitted bundle to be mined.
pub const TX_WAIT_TIMEOUT: Duration = Duration::from_secs(16);

/// How long a queued message waits for the processor before the caller
/// sees a timeout.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(12);

/// Delay between log subscription attempts after a transport error.
pub const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long a cached block timestamp outlives its block.
pub const BLOCK_CACHE_TTL_SECS: u64 = 60;

/// Maximum number of fee bumps before a replacement loop is abandoned.
pub const MAX_GAS_BUMPS: u8 = 5;

/// Maximum retries for a user operation message before it is dropped.
pub const USEROP_QUEUE_RETRIES: u32 = 3;

/// Sponsorship signature validity window.
pub const SPONSOR_VALID_FOR: Duration = Duration::from_secs(60);

/// Slack subtracted from `validAfter` to tolerate clock skew.
pub const SPONSOR_VALID_SLACK: Duration = Duration::from_secs(10);

/// Validity window for offline (pre-cached) sponsorship signatures.
pub const OO_SPONSOR_VALID_FOR: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Default number of signed operations returned by offline sponsorship.
pub const OO_SPONSOR_DEFAULT_AMOUNT: usize = 10;

/// A sponsored op carries at least paymaster address, packed validity window
/// and a 65-byte signature in `paymasterAndData`.
pub const MIN_PAYMASTER_AND_DATA_LEN: usize = 20 + 64 + 65;

/// Maximum allowed media upload size (50 MiB).
pub const MAX_BLOB_SIZE: usize = 50 * 1024 * 1024;

/// Maximum request body accepted by the legacy HTTP API (10 MiB).
pub const MAX_API_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Nostr event kind carrying a decoded chain log as content.
pub const KIND_TX_LOG: u16 = 30_340;

/// Nostr event kind carrying a submitted user operation as content.
pub const KIND_USER_OP: u16 = 30_341;

/// Blossom upload authorization event kind (BUD-02).
pub const KIND_BLOB_AUTH: u16 = 24_242;

/// Port the Nostr relay and Blossom endpoints listen on.
pub const RELAY_PORT: u16 = 3334;
