//! Registry events and human-readable event signature parsing.

use crate::error::RelayError;
use alloy::primitives::{keccak256, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A registered indexed event: which contract on which chain emits it, and
/// the human-readable signature describing how to decode it.
///
/// `(chain_id, contract, topic)` is unique; `alias` is the human-facing key
/// subscribers use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Decimal chain id.
    pub chain_id: String,
    /// Emitting contract address, hex.
    pub contract: String,
    /// topic0 of the event, hex.
    pub topic: String,
    /// Human-facing subscription key.
    pub alias: String,
    /// Solidity-style declaration, e.g. `Transfer(address indexed from, ...)`.
    pub event_signature: String,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// A parsed event argument: its ABI type and whether it is indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventArg {
    /// ABI type string, e.g. `uint256`.
    pub ty: String,
    /// Whether the argument is an indexed topic.
    pub indexed: bool,
}

impl Event {
    /// Parses the human-readable event signature into
    /// `(name, arg_names, arg_types)`.
    ///
    /// Accepted forms:
    /// - `Transfer(address from, address to, uint256 value)`
    /// - `Transfer(address,address,uint256)` (names become `"0"`, `"1"`, ...)
    /// - `Transfer(address indexed from, address indexed to, uint256 value)`
    /// - `Transfer (index_topic_1 address from, index_topic_2 address to, uint256 value)`
    ///
    /// Malformed arguments are skipped rather than failing the whole parse.
    pub fn parse_event_signature(&self) -> (String, Vec<String>, Vec<EventArg>) {
        let sig = self.event_signature.as_str();
        if sig.is_empty() {
            return (String::new(), vec![], vec![]);
        }

        let Some((raw_name, raw_args)) = sig.split_once('(') else {
            return (String::new(), vec![], vec![]);
        };

        let name = raw_name.trim();
        if name.is_empty() {
            return (String::new(), vec![], vec![]);
        }

        let raw_args = raw_args.strip_suffix(')').unwrap_or(raw_args);

        let mut arg_names = Vec::new();
        let mut arg_types = Vec::new();

        for (i, arg) in raw_args.split(',').enumerate() {
            let arg = arg.trim();
            if arg.is_empty() {
                continue;
            }

            let mut fields: Vec<&str> = arg.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }

            let mut indexed = false;

            if fields[0].starts_with("index_topic_") {
                indexed = true;
                fields.remove(0);
            }

            if fields.len() >= 2 && (fields[0] == "indexed" || fields[1] == "indexed") {
                indexed = true;
                if fields[0] == "indexed" {
                    fields.remove(0);
                } else {
                    fields.remove(1);
                }
            }

            let (ty, arg_name) = match fields.len() {
                2 => (fields[0], fields[1].to_string()),
                1 => (fields[0], i.to_string()),
                _ => continue,
            };

            if !ty.is_empty() {
                arg_names.push(arg_name);
                arg_types.push(EventArg { ty: ty.to_string(), indexed });
            }
        }

        (name.to_string(), arg_names, arg_types)
    }

    /// Computes topic0 from the canonical `Name(type1,type2,...)` form.
    ///
    /// Returns the zero hash when the signature has no name or no argument
    /// types: such registrations never match a real log.
    pub fn topic0(&self) -> B256 {
        let (name, _, arg_types) = self.parse_event_signature();
        if name.is_empty() || arg_types.is_empty() {
            return B256::ZERO;
        }

        let types: Vec<&str> = arg_types.iter().map(|a| a.ty.as_str()).collect();
        keccak256(format!("{}({})", name, types.join(",")))
    }

    /// Emits a minimal JSON ABI describing just this event, suitable for
    /// feeding to an ABI decoder.
    pub fn construct_abi(&self) -> Result<String, RelayError> {
        let (name, arg_names, arg_types) = self.parse_event_signature();
        if name.is_empty() || arg_names.is_empty() || arg_types.is_empty() {
            return Err(RelayError::validation("event name is required"));
        }

        for (i, arg) in arg_types.iter().enumerate() {
            if arg.ty.is_empty() {
                return Err(RelayError::Validation(format!(
                    "argument type at index {i} is empty"
                )));
            }
        }

        let inputs: Vec<serde_json::Value> = arg_names
            .iter()
            .zip(&arg_types)
            .map(|(n, a)| json!({"name": n, "type": a.ty, "indexed": a.indexed}))
            .collect();

        Ok(json!([{"name": name, "type": "event", "inputs": inputs}]).to_string())
    }

    /// Whether `data`'s key set is exactly `{"topic"}` plus the parsed
    /// argument names: no keys missing, none extra.
    pub fn is_valid_data(&self, data: &serde_json::Map<String, serde_json::Value>) -> bool {
        let (_, arg_names, _) = self.parse_event_signature();

        if data.len() != arg_names.len() + 1 {
            return false;
        }

        if !data.contains_key("topic") {
            return false;
        }

        arg_names.iter().all(|name| data.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;

    fn event(sig: &str) -> Event {
        Event {
            chain_id: "1".into(),
            contract: "0x0000000000000000000000000000000000000000".into(),
            topic: String::new(),
            alias: "test".into(),
            event_signature: sig.into(),
            name: "Test".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    const TRANSFER_TOPIC0: B256 =
        b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

    #[test]
    fn parses_compact_signature() {
        let ev = event("Transfer(address,address,uint256)");
        let (name, arg_names, arg_types) = ev.parse_event_signature();

        assert_eq!(name, "Transfer");
        assert_eq!(arg_names, vec!["0", "1", "2"]);
        assert_eq!(
            arg_types,
            vec![
                EventArg { ty: "address".into(), indexed: false },
                EventArg { ty: "address".into(), indexed: false },
                EventArg { ty: "uint256".into(), indexed: false },
            ]
        );
        assert_eq!(ev.topic0(), TRANSFER_TOPIC0);
    }

    #[test]
    fn parses_index_topic_form() {
        let ev = event(
            "Transfer (index_topic_1 address from, index_topic_2 address to, uint256 value)",
        );
        let (name, arg_names, arg_types) = ev.parse_event_signature();

        assert_eq!(name, "Transfer");
        assert_eq!(arg_names, vec!["from", "to", "value"]);
        assert!(arg_types[0].indexed);
        assert!(arg_types[1].indexed);
        assert!(!arg_types[2].indexed);
        assert_eq!(ev.topic0(), TRANSFER_TOPIC0);
    }

    #[test]
    fn parses_indexed_keyword_forms() {
        let named = event("Transfer(address indexed from, address indexed to, uint256 value)");
        let (_, arg_names, arg_types) = named.parse_event_signature();
        assert_eq!(arg_names, vec!["from", "to", "value"]);
        assert!(arg_types[0].indexed && arg_types[1].indexed && !arg_types[2].indexed);

        let unnamed = event("Transfer(address indexed, address indexed, uint256)");
        let (_, arg_names, arg_types) = unnamed.parse_event_signature();
        assert_eq!(arg_names, vec!["0", "1", "2"]);
        assert!(arg_types[0].indexed && arg_types[1].indexed && !arg_types[2].indexed);
    }

    #[test]
    fn topic0_ignores_decoration() {
        let compact = event("Transfer(address,address,uint256)");
        let decorated =
            event("Transfer( address indexed from ,  address indexed to , uint256 value )");
        let topic_form = event(
            "Transfer (index_topic_1 address from, index_topic_2 address to, uint256 value)",
        );

        assert_eq!(compact.topic0(), decorated.topic0());
        assert_eq!(compact.topic0(), topic_form.topic0());
    }

    #[test]
    fn empty_signatures_yield_nothing() {
        let ev = event("");
        assert_eq!(ev.parse_event_signature(), (String::new(), vec![], vec![]));
        assert_eq!(ev.topic0(), B256::ZERO);

        let no_parens = event("Transfer");
        assert_eq!(no_parens.parse_event_signature().0, "");

        let empty_args = event("Transfer()");
        let (name, arg_names, _) = empty_args.parse_event_signature();
        assert_eq!(name, "Transfer");
        assert!(arg_names.is_empty());
        assert_eq!(empty_args.topic0(), B256::ZERO);
    }

    #[test]
    fn abi_emission_roundtrips() {
        let ev = event("Transfer(address indexed from, address indexed to, uint256 value)");
        let abi = ev.construct_abi().unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&abi).unwrap();
        let decl = &parsed[0];
        assert_eq!(decl["name"], "Transfer");
        assert_eq!(decl["type"], "event");

        // Rebuild a signature from the emitted ABI and check it parses to
        // the same triple.
        let inputs = decl["inputs"].as_array().unwrap();
        let args: Vec<String> = inputs
            .iter()
            .map(|i| {
                let indexed = if i["indexed"].as_bool().unwrap() { " indexed" } else { "" };
                format!("{}{} {}", i["type"].as_str().unwrap(), indexed, i["name"].as_str().unwrap())
            })
            .collect();
        let rebuilt = event(&format!("Transfer({})", args.join(", ")));

        assert_eq!(rebuilt.parse_event_signature(), ev.parse_event_signature());
        assert_eq!(rebuilt.topic0(), ev.topic0());
    }

    #[test]
    fn abi_emission_requires_name_and_args() {
        assert!(event("").construct_abi().is_err());
        assert!(event("Transfer()").construct_abi().is_err());
    }

    #[test]
    fn validates_data_shape() {
        let ev = event("Transfer(address from, address to, uint256 value)");

        let valid = serde_json::from_str(
            r#"{"topic":"0x00","from":"0x01","to":"0x02","value":"10"}"#,
        )
        .unwrap();
        assert!(ev.is_valid_data(&valid));

        let missing: serde_json::Map<_, _> =
            serde_json::from_str(r#"{"topic":"0x00","from":"0x01","to":"0x02"}"#).unwrap();
        assert!(!ev.is_valid_data(&missing));

        let extra: serde_json::Map<_, _> = serde_json::from_str(
            r#"{"topic":"0x00","from":"0x01","to":"0x02","value":"10","memo":"hi"}"#,
        )
        .unwrap();
        assert!(!ev.is_valid_data(&extra));

        let no_topic: serde_json::Map<_, _> = serde_json::from_str(
            r#"{"t":"0x00","from":"0x01","to":"0x02","value":"10"}"#,
        )
        .unwrap();
        assert!(!ev.is_valid_data(&no_topic));
    }
}
