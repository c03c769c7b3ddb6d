//! Canonical JSON normalization and digest computation.
//!
//! - Object keys sorted by UTF-16 code units
//! - Integer-valued floats collapsed to integers; NaN/Infinity rejected
//! - SHA-256 hex digest over the compact canonical form

use crate::domain::error::{AclError, Result};
use sha2::{Digest, Sha256};

fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

fn normalize_value(value: &serde_json::Value) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (k, v) in map.iter() {
                normalized.insert(k.clone(), normalize_value(v)?);
            }
            Ok(serde_json::Value::Object(normalized))
        }
        serde_json::Value::Array(arr) => Ok(serde_json::Value::Array(
            arr.iter().map(normalize_value).collect::<Result<Vec<_>>>()?,
        )),
        serde_json::Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(AclError::InvalidPolicy(
                "NaN/Infinity not permitted in canonical JSON".to_string(),
            )),
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(serde_json::Value::Number(serde_json::Number::from(f as i64)))
            }
            _ => Ok(serde_json::Value::Number(n.clone())),
        },
        other => Ok(other.clone()),
    }
}

/// Convert a JSON value to canonical form: normalize numbers, sort keys, compact.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    let normalized = normalize_value(value)?;
    let sorted = sort_keys_utf16(&normalized);
    Ok(serde_json::to_string(&sorted)?)
}

/// SHA-256 hex digest of the canonical JSON form.
pub fn compute_digest(value: &serde_json::Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
