//! Deterministic content hashing over a canonical serialisation.
//!
//! Two values hash equal iff their canonical forms are byte-identical:
//! object keys are sorted, integral floats are written as integers and no
//! insignificant whitespace is emitted. Used both for idempotency keys
//! (duplicate submissions) and output hashes (duplicate deliveries).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Largest integer an `f64` represents exactly (2^53).
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

/// Hex-encoded SHA-256 digest of a canonicalised value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub const HEX_LEN: usize = 64;

    /// Rehydrate a stored hash, validating its shape.
    pub fn from_hex(hex_digest: impl Into<String>) -> Result<Self, HashError> {
        let hex_digest = hex_digest.into().to_ascii_lowercase();
        if hex_digest.len() != Self::HEX_LEN || !hex_digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidDigest(hex_digest));
        }
        Ok(Self(hex_digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("value cannot be serialized for hashing: {0}")]
    Serialize(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}

/// Hash any serialisable value in canonical form.
pub fn compute_content_hash<T>(value: &T) -> Result<ContentHash, HashError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value).map_err(|e| HashError::Serialize(e.to_string()))?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(ContentHash(hex::encode(digest)))
}

/// Idempotency key for a submission: `hash(kind, targets, normalized content)`.
pub fn compute_unique_key<T, C>(kind: &str, targets: &T, content: &C) -> Result<ContentHash, HashError>
where
    T: Serialize + ?Sized,
    C: Serialize + ?Sized,
{
    #[derive(Serialize)]
    struct KeyMaterial<'a, T: ?Sized, C: ?Sized> {
        kind: &'a str,
        targets: &'a T,
        content: &'a C,
    }

    compute_content_hash(&KeyMaterial {
        kind,
        targets,
        content,
    })
}

fn write_canonical(value: &JsonValue, out: &mut String) -> Result<(), HashError> {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => write_number(n, out)?,
        JsonValue::String(s) => write_string(s, out)?,
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out)?;
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(n: &serde_json::Number, out: &mut String) -> Result<(), HashError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(HashError::Serialize(format!("non-finite number: {f}")));
        }
        // 1.0 and 1 are the same value on the wire; make them the same bytes.
        if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_INT {
            out.push_str(&(f as i64).to_string());
        } else {
            out.push_str(&n.to_string());
        }
    } else {
        out.push_str(&n.to_string());
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) -> Result<(), HashError> {
    let escaped = serde_json::to_string(s).map_err(|e| HashError::Serialize(e.to_string()))?;
    out.push_str(&escaped);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_hash() {
        let a: JsonValue = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": null}}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"a": {"x": null, "y": [1, 2]}, "b": 1}"#).unwrap();

        assert_eq!(compute_content_hash(&a).unwrap(), compute_content_hash(&b).unwrap());
    }

    #[test]
    fn integral_floats_hash_like_integers() {
        let a = json!({"score": 1.0});
        let b = json!({"score": 1});
        assert_eq!(compute_content_hash(&a).unwrap(), compute_content_hash(&b).unwrap());

        let c = json!({"score": 1.5});
        assert_ne!(compute_content_hash(&a).unwrap(), compute_content_hash(&c).unwrap());
    }

    #[test]
    fn array_order_matters() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(compute_content_hash(&a).unwrap(), compute_content_hash(&b).unwrap());
    }

    #[test]
    fn hash_format_is_fixed_length_hex() {
        let hash = compute_content_hash(&json!({"label": "cat"})).unwrap();
        assert_eq!(hash.as_str().len(), ContentHash::HEX_LEN);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let empty = compute_content_hash(&json!(null)).unwrap();
        assert_eq!(empty.as_str().len(), ContentHash::HEX_LEN);
    }

    #[test]
    fn unique_key_separates_kind_and_target() {
        let content = json!({"text": "hello"});
        let k1 = compute_unique_key("analysis", &["doc-1"], &content).unwrap();
        let k2 = compute_unique_key("analysis", &["doc-2"], &content).unwrap();
        let k3 = compute_unique_key("summary", &["doc-1"], &content).unwrap();
        let k1_again = compute_unique_key("analysis", &["doc-1"], &content).unwrap();

        assert_eq!(k1, k1_again);
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn from_hex_validates_shape() {
        let hash = compute_content_hash(&json!("x")).unwrap();
        assert_eq!(ContentHash::from_hex(hash.as_str().to_uppercase()).unwrap(), hash);
        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex("z".repeat(64)).is_err());
    }

    proptest! {
        #[test]
        fn hash_is_independent_of_insertion_order(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
        ) {
            let forward: serde_json::Map<String, JsonValue> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reverse: serde_json::Map<String, JsonValue> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();

            prop_assert_eq!(
                compute_content_hash(&JsonValue::Object(forward)).unwrap(),
                compute_content_hash(&JsonValue::Object(reverse)).unwrap()
            );
        }
    }
}
