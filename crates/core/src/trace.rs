//! Structural trace entries: append-only decision records for audit/replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OwnerId, TraceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPhase {
    Build,
    Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    Deterministic,
    Policy,
}

impl DecisionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPhase::Build => "build",
            DecisionPhase::Runtime => "runtime",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "build" => Ok(DecisionPhase::Build),
            "runtime" => Ok(DecisionPhase::Runtime),
            other => Err(DomainError::validation(format!("unknown decision phase: {other}"))),
        }
    }
}

impl DecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMode::Deterministic => "deterministic",
            DecisionMode::Policy => "policy",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "deterministic" => Ok(DecisionMode::Deterministic),
            "policy" => Ok(DecisionMode::Policy),
            other => Err(DomainError::validation(format!("unknown decision mode: {other}"))),
        }
    }
}

/// One decision a pipeline made during an attempt.
///
/// `job_id` and `owner_user_id` are stamped by the context when the entry
/// is recorded; handlers build entries with [`TraceEntry::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub id: TraceId,
    pub job_id: JobId,
    pub owner_user_id: OwnerId,
    pub decision_type: String,
    pub phase: DecisionPhase,
    pub mode: DecisionMode,
    pub actor_ids: Vec<Uuid>,
    pub inputs: JsonValue,
    pub chosen: JsonValue,
    pub graph_version: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TraceEntry {
    pub fn new(
        job_id: JobId,
        owner_user_id: OwnerId,
        decision_type: impl Into<String>,
        phase: DecisionPhase,
        mode: DecisionMode,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TraceId::new(),
            job_id,
            owner_user_id,
            decision_type: decision_type.into(),
            phase,
            mode,
            actor_ids: Vec::new(),
            inputs: JsonValue::Object(Default::default()),
            chosen: JsonValue::Object(Default::default()),
            graph_version: String::new(),
            occurred_at,
            created_at: occurred_at,
        }
    }

    pub fn with_actors(mut self, actor_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.actor_ids = actor_ids.into_iter().collect();
        self
    }

    pub fn with_inputs(mut self, inputs: JsonValue) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_chosen(mut self, chosen: JsonValue) -> Self {
        self.chosen = chosen;
        self
    }

    pub fn with_graph_version(mut self, version: impl Into<String>) -> Self {
        self.graph_version = version.into();
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.decision_type.trim().is_empty() {
            return Err(DomainError::invariant("decision_type is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phase_and_mode_parse_their_text_form() {
        for phase in [DecisionPhase::Build, DecisionPhase::Runtime] {
            assert_eq!(DecisionPhase::parse(phase.as_str()).unwrap(), phase);
        }
        for mode in [DecisionMode::Deterministic, DecisionMode::Policy] {
            assert_eq!(DecisionMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(DecisionMode::parse("random").is_err());
    }

    #[test]
    fn builder_fills_structured_fields() {
        let actor = Uuid::now_v7();
        let entry = TraceEntry::new(
            JobId::new(),
            OwnerId::new(),
            "concept_order",
            DecisionPhase::Build,
            DecisionMode::Policy,
            Utc::now(),
        )
        .with_actors([actor])
        .with_inputs(json!({"candidates": 4}))
        .with_chosen(json!({"index": 2}))
        .with_graph_version("g7");

        assert_eq!(entry.actor_ids, vec![actor]);
        assert_eq!(entry.chosen["index"], 2);
        assert_eq!(entry.graph_version, "g7");
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn blank_decision_type_is_rejected() {
        let entry = TraceEntry::new(
            JobId::new(),
            OwnerId::new(),
            " ",
            DecisionPhase::Runtime,
            DecisionMode::Deterministic,
            Utc::now(),
        );
        assert!(entry.validate().is_err());
    }
}
