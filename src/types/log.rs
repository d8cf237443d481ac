//! Semantic records of decoded on-chain events.

use alloy::primitives::{keccak256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Lifecycle of a log as it moves from speculative submission to an
/// observed on-chain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    /// Submitted to the node, not yet accepted.
    Sending,
    /// Accepted by the node, not yet mined.
    Pending,
    /// Observed on chain.
    Success,
    /// Dropped or reverted.
    Fail,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A decoded on-chain event, content-addressed by [`Log::generate_unique_hash`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    /// Content hash identifying this log across status transitions.
    pub hash: String,
    /// Hash of the carrying transaction.
    pub tx_hash: String,
    /// Decimal chain id.
    pub chain_id: String,
    /// topic0 of the decoded event, hex.
    pub topic: String,
    /// Block timestamp for indexed logs, submission time for speculative
    /// ones.
    pub created_at: DateTime<Utc>,
    /// Last status transition time.
    pub updated_at: DateTime<Utc>,
    /// Sender-side nonce, when known.
    pub nonce: i64,
    /// Originating account, hex.
    pub sender: String,
    /// Emitting contract, hex.
    pub to: String,
    /// Native value carried, decimal string.
    #[serde(with = "u256_decimal")]
    pub value: U256,
    /// The decoded topic bundle as a JSON object.
    pub data: Option<Value>,
    /// Optional description attached through the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Value>,
    /// Lifecycle status.
    pub status: LogStatus,
}

/// Description payload carried in `extra_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraData {
    /// Human-readable description of the operation.
    pub description: String,
}

impl Log {
    /// Computes the content-addressed identity of this log.
    ///
    /// Keccak-256 over the left-padded 32-byte value, the sorted-key JSON
    /// rendering of `data`, the raw transaction hash bytes and the raw
    /// chain id bytes. Stable under upstream field reordering.
    pub fn generate_unique_hash(&self) -> String {
        let mut buf = Vec::new();

        let value_bytes = self.value.to_be_bytes::<32>();
        buf.extend_from_slice(&value_bytes);

        if let Some(data) = &self.data {
            buf.extend_from_slice(&sorted_json_bytes(data));
        }

        buf.extend_from_slice(&from_hex_lenient(&self.tx_hash));
        buf.extend_from_slice(&from_hex_lenient(&self.chain_id));

        keccak256(&buf).to_string()
    }

    /// The broadcast pool this log belongs to: `{contract}/{topic0}`,
    /// lowercased. `None` when the log carries no decoded topic.
    pub fn pool_topic(&self) -> Option<String> {
        let topic = self.data.as_ref()?.get("topic")?.as_str()?;
        Some(format!("{}/{}", self.to, topic).to_lowercase())
    }

    /// Matches a subscriber query of the form `data.k1=v1&data.k2=v2&...`.
    ///
    /// Only `data.`-prefixed keys are considered; a single matching pair is
    /// enough (the pairs are a disjunction). An empty query matches
    /// everything.
    pub fn matches_query(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }

        let Some(Value::Object(data)) = &self.data else {
            return false;
        };

        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Some(field) = key.strip_prefix("data.") else {
                continue;
            };
            if let Some(found) = data.get(field) {
                if format_value(found) == value {
                    return true;
                }
            }
        }

        false
    }
}

/// Renders a JSON value the way subscribers type it in queries: strings
/// bare, everything else in its display form.
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Serializes a JSON object with its top-level keys in lexicographic order,
/// concatenating `json(key) json(value)` pairs. Non-objects contribute
/// their plain serialization.
fn sorted_json_bytes(data: &Value) -> Vec<u8> {
    let Value::Object(map) = data else {
        return serde_json::to_vec(data).unwrap_or_default();
    };

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut buf = Vec::new();
    for key in keys {
        if let (Ok(k), Ok(v)) = (serde_json::to_vec(key), serde_json::to_vec(&map[key])) {
            buf.extend_from_slice(&k);
            buf.extend_from_slice(&v);
        }
    }
    buf
}

/// Decodes a possibly odd-length, possibly `0x`-prefixed hex string,
/// yielding nothing when the input is not hex at all.
fn from_hex_lenient(s: &str) -> Vec<u8> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let padded = if s.len() % 2 == 1 { format!("0{s}") } else { s.to_string() };
    alloy::hex::decode(padded).unwrap_or_default()
}

mod u256_decimal {
    use alloy::primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_log() -> Log {
        Log {
            hash: String::new(),
            tx_hash: "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef"
                .into(),
            chain_id: "1".into(),
            topic: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: "0x01".into(),
            to: "0x5566D6D4Df27a6fD7856b7564F81266863Ba3ee8".into(),
            value: U256::from(10u64).pow(U256::from(18u64)),
            data: Some(json!({"method": "transfer"})),
            extra_data: None,
            status: LogStatus::Sending,
        }
    }

    #[test]
    fn unique_hash_is_deterministic() {
        let log = sample_log();
        let hash = log.generate_unique_hash();

        assert_eq!(hash.len(), 66);
        assert!(hash.starts_with("0x"));
        assert_eq!(hash, log.generate_unique_hash());
    }

    #[test]
    fn unique_hash_tracks_fields() {
        let log = sample_log();
        let base = log.generate_unique_hash();

        let mut doubled = log.clone();
        doubled.value = log.value * U256::from(2u64);
        assert_ne!(base, doubled.generate_unique_hash());

        let mut other_tx = log.clone();
        other_tx.tx_hash =
            "0xffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff".into();
        assert_ne!(base, other_tx.generate_unique_hash());

        let mut other_chain = log.clone();
        other_chain.chain_id = "137".into();
        assert_ne!(base, other_chain.generate_unique_hash());

        let mut other_data = log.clone();
        other_data.data = Some(json!({"method": "mint"}));
        assert_ne!(base, other_data.generate_unique_hash());
    }

    #[test]
    fn unique_hash_ignores_key_order() {
        let mut a = sample_log();
        a.data = Some(json!({"from": "0x01", "to": "0x02", "value": "10"}));

        // Same entries, different construction order.
        let mut b = sample_log();
        let mut map = serde_json::Map::new();
        map.insert("value".into(), json!("10"));
        map.insert("to".into(), json!("0x02"));
        map.insert("from".into(), json!("0x01"));
        b.data = Some(Value::Object(map));

        assert_eq!(a.generate_unique_hash(), b.generate_unique_hash());
    }

    #[test]
    fn pool_topic_lowercases() {
        let mut log = sample_log();
        log.data = Some(json!({"topic": "0xDDF252AD", "value": "1"}));
        assert_eq!(
            log.pool_topic().unwrap(),
            "0x5566d6d4df27a6fd7856b7564f81266863ba3ee8/0xddf252ad"
        );

        log.data = Some(json!({"value": "1"}));
        assert!(log.pool_topic().is_none());
    }

    #[test]
    fn query_matching_is_disjunctive() {
        let mut log = sample_log();
        log.data = Some(json!({"from": "0xaa", "to": "0xbb", "value": "10"}));

        assert!(log.matches_query(""));
        assert!(log.matches_query("data.from=0xaa"));
        // One matching pair is enough even if the other misses.
        assert!(log.matches_query("data.from=0xaa&data.to=0xzz"));
        assert!(!log.matches_query("data.from=0xzz&data.to=0xzz"));
        // Keys without the data. prefix never match.
        assert!(!log.matches_query("from=0xaa"));
        assert!(!log.matches_query("data.missing=1"));
    }

    #[test]
    fn value_serializes_as_decimal_string() {
        let log = sample_log();
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["value"], json!("1000000000000000000"));
        assert_eq!(json["status"], json!("sending"));
    }
}
