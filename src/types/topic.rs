//! Decoded log topics.
//!
//! A [`Topics`] sequence is the decoded representation of one indexed log:
//! the raw topic0 first, then every declared argument in order, indexed
//! arguments converted from their 32-byte topic hashes and the rest
//! ABI-decoded from the log data.

use crate::{error::RelayError, types::Event};
use alloy::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, B256, I256, U256},
};
use serde_json::{json, Map, Value};

/// One decoded log field.
#[derive(Debug, Clone)]
pub struct Topic {
    /// Argument name, or `""` for synthetic entries.
    pub name: String,
    /// ABI type string.
    pub ty: String,
    /// Decoded value.
    pub value: DynSolValue,
}

/// An ordered sequence of decoded log fields.
#[derive(Debug, Clone, Default)]
pub struct Topics(pub Vec<Topic>);

/// Decodes a raw log against a registered [`Event`].
///
/// The first entry is always `{name: "topic", type: "bytes32"}` holding
/// topic0. Fails when the event signature is unparseable, when an indexed
/// type is unsupported, or when the data bytes do not decode against the
/// non-indexed arguments.
pub fn parse_topics_from_hashes(
    event: &Event,
    topic_hashes: &[B256],
    data: &[u8],
) -> Result<Topics, RelayError> {
    if topic_hashes.is_empty() {
        return Err(RelayError::validation("no topic hashes provided"));
    }

    let (name, arg_names, arg_types) = event.parse_event_signature();
    if name.is_empty() || arg_names.is_empty() || arg_types.is_empty() {
        return Err(RelayError::validation("event name is required"));
    }

    let mut topics = Topics(vec![Topic {
        name: "topic".to_string(),
        ty: "bytes32".to_string(),
        value: DynSolValue::FixedBytes(topic_hashes[0], 32),
    }]);

    // Decode the non-indexed arguments out of the data bytes in one pass.
    let non_indexed: Vec<DynSolType> = arg_types
        .iter()
        .filter(|a| !a.indexed)
        .map(|a| {
            a.ty.parse::<DynSolType>()
                .map_err(|err| RelayError::Validation(format!("invalid type {}: {err}", a.ty)))
        })
        .collect::<Result<_, _>>()?;

    let mut decoded = DynSolType::Tuple(non_indexed)
        .abi_decode_sequence(data)
        .map_err(|err| RelayError::Validation(format!("failed to decode log data: {err}")))?
        .as_tuple()
        .map(<[DynSolValue]>::to_vec)
        .unwrap_or_default()
        .into_iter();

    let mut indexed_topics = topic_hashes.iter().skip(1);

    for (arg_name, arg) in arg_names.iter().zip(&arg_types) {
        let value = if arg.indexed {
            let hash = indexed_topics
                .next()
                .ok_or_else(|| RelayError::validation("missing indexed topic hash"))?;
            convert_hash_to_value(&arg.ty, *hash)?
        } else {
            decoded
                .next()
                .ok_or_else(|| RelayError::validation("missing decoded log value"))?
        };

        topics.0.push(Topic { name: arg_name.clone(), ty: arg.ty.clone(), value });
    }

    Ok(topics)
}

/// Converts an indexed 32-byte topic hash into a value of the declared type.
///
/// Dynamic types (`string`, `bytes`) keep the hash hex: the actual value is
/// not recoverable from topics alone.
fn convert_hash_to_value(ty: &str, hash: B256) -> Result<DynSolValue, RelayError> {
    let bytes = hash.as_slice();

    match ty {
        "bool" => return Ok(DynSolValue::Bool(bytes[31] != 0)),
        "address" => return Ok(DynSolValue::Address(Address::from_word(hash))),
        "string" | "bytes" => return Ok(DynSolValue::String(hash.to_string())),
        _ => {}
    }

    if let Some(suffix) = ty.strip_prefix("uint") {
        let bits = suffix.parse::<usize>().unwrap_or(256);
        return Ok(DynSolValue::Uint(U256::from_be_slice(bytes), bits));
    }

    if let Some(suffix) = ty.strip_prefix("int") {
        let bits = suffix.parse::<usize>().unwrap_or(256);
        let raw = U256::from_be_slice(bytes);
        // Two's-complement extension for smaller signed integers: the topic
        // word arrives sign-extended to 32 bytes, so mask down to the
        // declared width before interpreting the sign bit.
        let value = if bits < 256 {
            let low = raw & ((U256::from(1u8) << bits) - U256::from(1u8));
            if low.bit(bits - 1) {
                I256::from_raw(low) - I256::from_raw(U256::from(1u8) << bits)
            } else {
                I256::from_raw(low)
            }
        } else {
            I256::from_raw(raw)
        };
        return Ok(DynSolValue::Int(value, bits));
    }

    if let Some(suffix) = ty.strip_prefix("bytes") {
        let size = suffix
            .parse::<usize>()
            .map_err(|_| RelayError::Validation(format!("invalid bytes type: {ty}")))?;
        if size == 0 || size > 32 {
            return Err(RelayError::Validation(format!("invalid bytes type: {ty}")));
        }
        return Ok(DynSolValue::FixedBytes(hash, size));
    }

    Err(RelayError::Validation(format!("unsupported type: {ty}")))
}

impl Topics {
    /// Serializes the sequence as a `name -> value` JSON object.
    ///
    /// Addresses and hashes become hex strings, integers become decimal
    /// strings, fixed bytes become `0x`-prefixed hex. Entries with an empty
    /// name are dropped.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for topic in &self.0 {
            if topic.name.is_empty() {
                continue;
            }
            map.insert(topic.name.clone(), value_to_json(&topic.value));
        }
        map
    }

    /// The JSON object form as a [`Value`].
    pub fn to_json(&self) -> Value {
        Value::Object(self.to_json_map())
    }
}

fn value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Uint(v, _) => json!(v.to_string()),
        DynSolValue::Int(v, _) => json!(v.to_string()),
        DynSolValue::Address(a) => json!(a.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", alloy::hex::encode(&word.as_slice()[..*size])))
        }
        DynSolValue::Bytes(b) => json!(format!("0x{}", alloy::hex::encode(b))),
        DynSolValue::Function(f) => json!(f.to_string()),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
            Value::Array(values.iter().map(value_to_json).collect())
        }
        DynSolValue::Tuple(values) => Value::Array(values.iter().map(value_to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;
    use chrono::Utc;

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

    #[test]
    fn converts_uint_hash() {
        let hash = b256!("000000000000000000000000000000000000000000000000000000000000000a");
        let value = convert_hash_to_value("uint256", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("10"));
    }

    #[test]
    fn converts_bool_hash() {
        let hash = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let value = convert_hash_to_value("bool", hash).unwrap();
        assert_eq!(value_to_json(&value), json!(true));
    }

    #[test]
    fn converts_address_hash() {
        let hash = b256!("0000000000000000000000005566d6d4df27a6fd7856b7564f81266863ba3ee8");
        let value = convert_hash_to_value("address", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("0x5566D6D4Df27a6fD7856b7564F81266863Ba3ee8"));
    }

    #[test]
    fn sign_extends_small_ints() {
        // -1 as int8: low byte 0xff.
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000ff");
        let value = convert_hash_to_value("int8", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("-1"));

        // 127 as int8 stays positive.
        let hash = b256!("000000000000000000000000000000000000000000000000000000000000007f");
        let value = convert_hash_to_value("int8", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("127"));
    }

    #[test]
    fn handles_sign_extended_topic_words() {
        // The EVM sign-extends indexed int<N> values to the full word:
        // int8(-1) arrives as 32 bytes of 0xff.
        let hash = b256!("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff");
        let value = convert_hash_to_value("int8", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("-1"));

        // int16(-123) = 0xff85, upper bytes all 0xff.
        let hash = b256!("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff85");
        let value = convert_hash_to_value("int16", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("-123"));

        // int256 keeps the raw word as-is.
        let value = convert_hash_to_value("int256", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("-123"));
    }

    #[test]
    fn keeps_hash_for_dynamic_types() {
        let hash = b256!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let value = convert_hash_to_value("string", hash).unwrap();
        assert_eq!(value_to_json(&value), json!(hash.to_string()));
    }

    #[test]
    fn truncates_fixed_bytes() {
        let hash = b256!("deadbeef00000000000000000000000000000000000000000000000000000000");
        let value = convert_hash_to_value("bytes4", hash).unwrap();
        assert_eq!(value_to_json(&value), json!("0xdeadbeef"));
    }

    #[test]
    fn rejects_unsupported_types() {
        assert!(convert_hash_to_value("tuple", B256::ZERO).is_err());
        assert!(convert_hash_to_value("bytesX", B256::ZERO).is_err());
    }

    #[test]
    fn decodes_transfer_log() {
        let ev = event("Transfer(address indexed from, address indexed to, uint256 value)");
        let topic0 = ev.topic0();
        let from = b256!("0000000000000000000000005566d6d4df27a6fd7856b7564f81266863ba3ee8");
        let to = b256!("000000000000000000000000000000000000000000000000000000000000beef");
        let data = U256::from(1_000u64).to_be_bytes::<32>();

        let topics = parse_topics_from_hashes(&ev, &[topic0, from, to], &data).unwrap();
        let map = topics.to_json_map();

        assert_eq!(map["topic"], json!(topic0.to_string()));
        assert_eq!(map["from"], json!("0x5566D6D4Df27a6fD7856b7564F81266863Ba3ee8"));
        assert_eq!(map["value"], json!("1000"));
        assert!(ev.is_valid_data(&map));
    }

    #[test]
    fn decoded_data_always_validates() {
        let ev = event("Approval(address indexed owner, address spender, uint256 value)");
        let topic0 = ev.topic0();
        let owner = b256!("000000000000000000000000000000000000000000000000000000000000cafe");

        let mut data = Vec::new();
        data.extend_from_slice(&B256::left_padding_from(&[0xbe, 0xef])[..]);
        data.extend_from_slice(&U256::from(7u64).to_be_bytes::<32>());

        let topics = parse_topics_from_hashes(&ev, &[topic0, owner], &data).unwrap();
        assert!(ev.is_valid_data(&topics.to_json_map()));
    }

    #[test]
    fn fails_on_unparseable_signature() {
        let ev = event("");
        assert!(parse_topics_from_hashes(&ev, &[B256::ZERO], &[]).is_err());

        let ev = event("Transfer(address,address,uint256)");
        assert!(parse_topics_from_hashes(&ev, &[], &[]).is_err());
    }
}
