//! Opaque job payload with typed accessors.
//!
//! The runtime never interprets payload keys; each pipeline defines which keys
//! it requires and reads them through these accessors. A missing or ill-formed
//! key surfaces as a `PayloadError`, which handlers report at their `validate`
//! stage.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload key missing: {0}")]
    Missing(String),

    #[error("payload key {key} is not a valid {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// Key → value mapping understood only by the matching handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, JsonValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: JsonValue) -> Result<Self, PayloadError> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            JsonValue::Null => Ok(Self::default()),
            _ => Err(PayloadError::NotAnObject),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Raw lookup; explicit JSON `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn require(&self, key: &str) -> Result<&JsonValue, PayloadError> {
        self.get(key).ok_or_else(|| PayloadError::Missing(key.to_string()))
    }

    fn wrong(key: &str, expected: &'static str) -> PayloadError {
        PayloadError::WrongType {
            key: key.to_string(),
            expected,
        }
    }

    pub fn uuid(&self, key: &str) -> Result<Uuid, PayloadError> {
        self.require(key)?
            .as_str()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| Self::wrong(key, "uuid"))
    }

    /// Non-blank string.
    pub fn str(&self, key: &str) -> Result<&str, PayloadError> {
        match self.require(key)?.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(s),
            Some(_) => Err(PayloadError::Missing(key.to_string())),
            None => Err(Self::wrong(key, "string")),
        }
    }

    /// Integer; integral floats (as produced by some JSON encoders) are accepted.
    pub fn int(&self, key: &str) -> Result<i64, PayloadError> {
        let value = self.require(key)?;
        if let Some(i) = value.as_i64() {
            return Ok(i);
        }
        match value.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
            _ => Err(Self::wrong(key, "integer")),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool, PayloadError> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| Self::wrong(key, "bool"))
    }

    pub fn map(&self, key: &str) -> Result<&Map<String, JsonValue>, PayloadError> {
        self.require(key)?
            .as_object()
            .ok_or_else(|| Self::wrong(key, "object"))
    }

    pub fn opt_uuid(&self, key: &str) -> Result<Option<Uuid>, PayloadError> {
        optional(self.uuid(key))
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, PayloadError> {
        optional(self.str(key))
    }

    pub fn opt_int(&self, key: &str) -> Result<Option<i64>, PayloadError> {
        optional(self.int(key))
    }

    pub fn opt_bool(&self, key: &str) -> Result<Option<bool>, PayloadError> {
        optional(self.bool(key))
    }
}

fn optional<T>(res: Result<T, PayloadError>) -> Result<Option<T>, PayloadError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(PayloadError::Missing(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl From<Map<String, JsonValue>> for Payload {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}
