//! Mapping from the inference service's raw result to what we persist.

use serde_json::Value as JsonValue;
use thiserror::Error;

use inferlink_jobs::Job;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("result is empty")]
    Empty,

    #[error("unexpected result shape: {0}")]
    Shape(String),
}

/// Pure mapping; must not touch storage.
pub trait ResultNormalizer: Send + Sync {
    fn normalize(&self, job: &Job, raw: JsonValue) -> Result<JsonValue, NormalizeError>;
}

/// Accepts any non-empty object or array, unwrapping a top-level
/// `{"result": ...}` or `{"data": ...}` envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughNormalizer;

impl ResultNormalizer for PassthroughNormalizer {
    fn normalize(&self, _job: &Job, raw: JsonValue) -> Result<JsonValue, NormalizeError> {
        let value = match raw {
            JsonValue::Object(mut map) if map.len() == 1 && (map.contains_key("result") || map.contains_key("data")) => {
                map.remove("result").or_else(|| map.remove("data")).unwrap_or(JsonValue::Null)
            }
            other => other,
        };

        match &value {
            JsonValue::Null => Err(NormalizeError::Empty),
            JsonValue::Object(map) if map.is_empty() => Err(NormalizeError::Empty),
            JsonValue::Array(items) if items.is_empty() => Err(NormalizeError::Empty),
            JsonValue::Object(_) | JsonValue::Array(_) => Ok(value),
            other => Err(NormalizeError::Shape(format!("expected object or array, got {other}"))),
        }
    }
}
