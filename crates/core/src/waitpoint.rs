//! Waitpoint envelope: the serialised continuation marker stored in `result`
//! while a job sits in `waiting_user`.
//!
//! Wire form:
//!
//! ```json
//! { "spec":  { "version": 1, "kind": "...", "step": "...",
//!              "blocking": false, "thread_id": "...", "min_seq": 7 },
//!   "state": { "version": 1, "phase": "awaiting_choice" },
//!   "data":  { } }
//! ```
//!
//! Handler in-memory state is never preserved across a suspend, so anything
//! a resumed attempt needs must be carried in `data` and routed by `step`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Only envelope version understood by this runtime.
pub const WAITPOINT_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitpointError {
    #[error("malformed waitpoint envelope: {0}")]
    Malformed(String),

    #[error("unsupported waitpoint version: {0}")]
    UnsupportedVersion(u32),

    #[error("waitpoint field must not be empty: {0}")]
    EmptyField(&'static str),
}

fn version_one() -> u32 {
    WAITPOINT_VERSION
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Map::new())
}

/// What the job waits for and how a resume is recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitpointSpec {
    #[serde(default = "version_one")]
    pub version: u32,
    /// Schema tag, e.g. `yaml_intent_v1`.
    pub kind: String,
    /// Handler-defined resumption label.
    pub step: String,
    /// Forbids any non-resume mutation while suspended.
    #[serde(default)]
    pub blocking: bool,
    /// Correlation handle consulted by the resume gate.
    #[serde(default)]
    pub thread_id: String,
    /// A resume requires an event with sequence strictly greater than this.
    #[serde(default)]
    pub min_seq: i64,
}

impl WaitpointSpec {
    pub fn new(kind: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            version: WAITPOINT_VERSION,
            kind: kind.into(),
            step: step.into(),
            blocking: false,
            thread_id: String::new(),
            min_seq: 0,
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn correlated(mut self, thread_id: impl Into<String>, min_seq: i64) -> Self {
        self.thread_id = thread_id.into();
        self.min_seq = min_seq;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitpointState {
    #[serde(default = "version_one")]
    pub version: u32,
    /// e.g. `awaiting_choice`, `awaiting_input`.
    pub phase: String,
}

impl WaitpointState {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            version: WAITPOINT_VERSION,
            phase: phase.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitpointEnvelope {
    pub spec: WaitpointSpec,
    pub state: WaitpointState,
    #[serde(default = "empty_object")]
    pub data: JsonValue,
}

impl WaitpointEnvelope {
    pub fn new(spec: WaitpointSpec, state: WaitpointState, data: JsonValue) -> Self {
        Self { spec, state, data }
    }

    pub fn validate(&self) -> Result<(), WaitpointError> {
        if self.spec.version != WAITPOINT_VERSION {
            return Err(WaitpointError::UnsupportedVersion(self.spec.version));
        }
        if self.state.version != WAITPOINT_VERSION {
            return Err(WaitpointError::UnsupportedVersion(self.state.version));
        }
        if self.spec.kind.trim().is_empty() {
            return Err(WaitpointError::EmptyField("spec.kind"));
        }
        if self.spec.step.trim().is_empty() {
            return Err(WaitpointError::EmptyField("spec.step"));
        }
        if self.state.phase.trim().is_empty() {
            return Err(WaitpointError::EmptyField("state.phase"));
        }
        if !(self.data.is_object() || self.data.is_null()) {
            return Err(WaitpointError::Malformed("data must be an object".into()));
        }
        Ok(())
    }

    /// JSON form written into `result`.
    pub fn encode(&self) -> Result<JsonValue, WaitpointError> {
        self.validate()?;
        serde_json::to_value(self).map_err(|e| WaitpointError::Malformed(e.to_string()))
    }

    pub fn decode(value: &JsonValue) -> Result<Self, WaitpointError> {
        let envelope: WaitpointEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| WaitpointError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Resume condition: same correlation handle and a strictly newer sequence.
    pub fn is_satisfied_by(&self, thread_id: &str, observed_seq: i64) -> bool {
        self.spec.thread_id == thread_id && observed_seq > self.spec.min_seq
    }
}
