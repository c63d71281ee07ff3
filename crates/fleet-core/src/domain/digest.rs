//! Canonical JSON and SHA-256 fingerprints of desired state.
//!
//! Desired-state fingerprints must not depend on key order in the control
//! plane's document or on how a number happened to be spelled, so payloads
//! are canonicalised before hashing: object keys sorted by UTF-16 code
//! units, integer-valued floats written as integers, compact output.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use fleet_state::Fingerprint;

use crate::domain::error::{AgentError, Result};

fn canonicalize(value: &Value) -> Result<Value> {
    Ok(match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()])?);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(canonicalize)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => {
                return Err(AgentError::Parse("non-finite number in payload".into()))
            }
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n.clone()),
        },
        other => other.clone(),
    })
}

/// Canonical compact JSON rendering of `value`.
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&canonicalize(value)?)?)
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Fingerprint of any serializable desired-state description.
pub fn fingerprint_of<T: Serialize>(desired: &T) -> Result<Fingerprint> {
    let value = serde_json::to_value(desired)?;
    Ok(Fingerprint::from_bytes(canonical_json(&value)?.as_bytes()))
}

/// Canonical JSON itself used as a readable fingerprint.
pub fn canonical_fingerprint<T: Serialize>(desired: &T) -> Result<Fingerprint> {
    let value = serde_json::to_value(desired)?;
    Ok(Fingerprint::from_raw(canonical_json(&value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"image": "nginx", "ports": ["80:80"], "env": {"B": "2", "A": "1"}});
        let b = json!({"env": {"A": "1", "B": "2"}, "ports": ["80:80"], "image": "nginx"});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(fingerprint_of(&a).unwrap(), fingerprint_of(&b).unwrap());
    }

    #[test]
    fn array_order_matters() {
        let a = json!({"rules": [1, 2]});
        let b = json!({"rules": [2, 1]});
        assert_ne!(fingerprint_of(&a).unwrap(), fingerprint_of(&b).unwrap());
    }

    #[test]
    fn integer_valued_floats_normalise() {
        assert_eq!(canonical_json(&json!({"uid": 1000.0})).unwrap(), r#"{"uid":1000}"#);
        assert_eq!(canonical_json(&json!({"ratio": 0.5})).unwrap(), r#"{"ratio":0.5}"#);
    }

    #[test]
    fn canonical_fingerprint_is_readable() {
        let fp = canonical_fingerprint(&json!({"state": "running", "enabled": true})).unwrap();
        assert_eq!(fp.as_str(), r#"{"enabled":true,"state":"running"}"#);
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
