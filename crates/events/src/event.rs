use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stagehand_core::WaitpointSpec;

/// State-change notification emitted after a successful job write.
///
/// Events are facts about the row at the time of the write; observers that
/// need the authoritative state re-read the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        stage: String,
        progress: u8,
        message: String,
    },
    Done {
        result: JsonValue,
    },
    Failed {
        stage: String,
        message: String,
    },
    Waiting {
        stage: String,
        spec: WaitpointSpec,
    },
    Canceled {
        reason: String,
    },
}

impl JobEvent {
    /// Stable event name (e.g. `job.progress`).
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "job.progress",
            JobEvent::Done { .. } => "job.done",
            JobEvent::Failed { .. } => "job.failed",
            JobEvent::Waiting { .. } => "job.waiting",
            JobEvent::Canceled { .. } => "job.canceled",
        }
    }
}
