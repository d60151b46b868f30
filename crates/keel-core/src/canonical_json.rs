//! Canonical JSON encoding for identity hashing.
//!
//! Canonical JSON has object keys sorted by UTF-8 byte order and no
//! whitespace. Release identities and workqueue payload keys are SHA-256
//! digests of this encoding, so two structurally equal values always hash the
//! same regardless of map insertion order.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON or contains a
/// non-finite float.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Normalizes a serializable value into a JSON value (JSON round-trip).
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn normalize<T: Serialize>(value: &T) -> Result<Value> {
    let bytes = to_canonical_bytes(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Returns the lowercase hex SHA-256 of the canonical encoding of `value`.
///
/// # Errors
///
/// Returns an error if the value cannot be canonically encoded.
pub fn sha256_hex<T: Serialize>(value: &T) -> Result<String> {
    let bytes = to_canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn write_value(v: &Value, out: &mut Vec<u8>) -> Result<()> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(Error::serialization(format!("non-finite number: {n}")));
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => serde_json::to_writer(&mut *out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<()> {
    out.push(b'{');
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, *k)?;
        out.push(b':');
        if let Some(val) = map.get(*k) {
            write_value(val, out)?;
        }
    }
    out.push(b'}');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn keys_are_sorted_without_whitespace() {
        let bytes = to_canonical_bytes(&json!({"b": 1, "a": {"d": true, "c": null}})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":null,"d":true},"b":1}"#
        );
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut first = HashMap::new();
        first.insert("x", 1);
        first.insert("y", 2);
        let mut second = HashMap::new();
        second.insert("y", 2);
        second.insert("x", 1);
        assert_eq!(sha256_hex(&first).unwrap(), sha256_hex(&second).unwrap());
    }

    #[test]
    fn floats_are_encoded() {
        let bytes = to_canonical_bytes(&json!({"f": 1.5})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"f":1.5}"#);
    }

    proptest::proptest! {
        #[test]
        fn canonical_bytes_are_a_fixed_point(entries in proptest::collection::hash_map("[a-z]{1,6}", proptest::num::i64::ANY, 0..12)) {
            let once = to_canonical_bytes(&entries).unwrap();
            let value: serde_json::Value = serde_json::from_slice(&once).unwrap();
            proptest::prop_assert_eq!(to_canonical_bytes(&value).unwrap(), once);
        }
    }
}
