//! Canonical CBOR encoding and content hashing.
//!
//! Every value agora persists, and every value it hashes, goes through this
//! module. Encoding first lifts the value into a [`ciborium::value::Value`]
//! tree, then sorts every map by the encoded bytes of its keys (the RFC 8949
//! deterministic ordering) before writing. Two values that serialize to the
//! same tree therefore always produce the same bytes, regardless of the
//! iteration order of the container they came from.
//!
//! # Examples
//!
//! ```rust
//! use agora::serializer;
//! use std::collections::HashMap;
//!
//! let mut a = HashMap::new();
//! a.insert("x", 1);
//! a.insert("y", 2);
//! let mut b = HashMap::new();
//! b.insert("y", 2);
//! b.insert("x", 1);
//!
//! assert_eq!(serializer::to_bytes(&a).unwrap(), serializer::to_bytes(&b).unwrap());
//! ```
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::error::{Error, Result};

/// Lifts a serializable value into a CBOR value tree.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(Value::serialized(value)?)
}

/// Lowers a CBOR value tree into a concrete type.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    value.deserialized().map_err(|e| Error::Decode(e.to_string()))
}

/// Serializes a value into canonical CBOR bytes.
#[instrument(skip(value), level = "trace")]
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    encode_canonical(canonicalize(to_value(value)?)?)
}

/// Serializes an already lifted value into canonical CBOR bytes.
pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>> {
    encode_canonical(canonicalize(value.clone())?)
}

/// Deserializes CBOR bytes.
#[instrument(skip(bytes), level = "trace")]
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

fn encode_canonical(value: Value) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    ciborium::into_writer(&value, &mut result)?;
    Ok(result)
}

/// Rewrites a value tree so that every map is ordered by its encoded keys.
pub fn canonicalize(value: Value) -> Result<Value> {
    Ok(match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(canonicalize)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Map(entries) => {
            let mut keyed = entries
                .into_iter()
                .map(|(k, v)| {
                    let k = canonicalize(k)?;
                    let v = canonicalize(v)?;
                    Ok((encode_canonical(k.clone())?, k, v))
                })
                .collect::<Result<Vec<_>>>()?;
            keyed.sort_by(|(a, _, _), (b, _, _)| a.cmp(b));
            Value::Map(keyed.into_iter().map(|(_, k, v)| (k, v)).collect())
        }
        Value::Tag(tag, inner) => Value::Tag(tag, Box::new(canonicalize(*inner)?)),
        other => other,
    })
}

/// SHA-256 of `bytes`, hex encoded.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A short structural descriptor of a value, prepended to its hash.
///
/// Sequences, maps, strings and byte strings are described by their length
/// (`len_3_`); every other value has an empty descriptor.
pub fn descriptor(value: &Value) -> String {
    let len = match value {
        Value::Array(items) => items.len(),
        Value::Map(entries) => entries.len(),
        Value::Text(text) => text.len(),
        Value::Bytes(bytes) => bytes.len(),
        _ => return String::new(),
    };
    format!("len_{len}_")
}

/// The kind of a value, used as the default prefix of its address.
pub fn kind(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "bytes",
        Value::Float(_) => "float",
        Value::Text(_) => "text",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tag(_, _) => "tagged",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        _ => "value",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[test]
    fn map_order_does_not_change_bytes() {
        let a = Value::Map(vec![
            (Value::Text("b".into()), Value::Integer(2.into())),
            (Value::Text("a".into()), Value::Integer(1.into())),
        ]);
        let b = Value::Map(vec![
            (Value::Text("a".into()), Value::Integer(1.into())),
            (Value::Text("b".into()), Value::Integer(2.into())),
        ]);
        assert_eq!(value_to_bytes(&a).unwrap(), value_to_bytes(&b).unwrap());
    }

    #[test]
    fn nested_maps_are_sorted() {
        let inner_a = Value::Map(vec![
            (Value::Integer(10.into()), Value::Null),
            (Value::Integer(1.into()), Value::Null),
        ]);
        let inner_b = Value::Map(vec![
            (Value::Integer(1.into()), Value::Null),
            (Value::Integer(10.into()), Value::Null),
        ]);
        let a = Value::Array(vec![inner_a]);
        let b = Value::Array(vec![inner_b]);
        assert_eq!(value_to_bytes(&a).unwrap(), value_to_bytes(&b).unwrap());
    }

    #[test]
    fn typed_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Sample {
            name: String,
            values: BTreeMap<String, u64>,
        }

        let sample = Sample {
            name: "fibonacci".to_string(),
            values: [("n".to_string(), 10)].into_iter().collect(),
        };
        let bytes = to_bytes(&sample).unwrap();
        let back: Sample = from_bytes(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn descriptors() {
        assert_eq!(descriptor(&Value::Text("abc".into())), "len_3_");
        assert_eq!(descriptor(&Value::Array(vec![])), "len_0_");
        assert_eq!(descriptor(&Value::Integer(7.into())), "");
        assert_eq!(kind(&Value::Bool(true)), "bool");
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
