use serde::{Deserialize, Serialize};
use serde_json::Value;

use lupa_core::current_unix_timestamp_ms;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Investigation lifecycle. Transitions form a DAG:
/// pending -> running -> (completed | failed | cancelled).
pub enum InvestigationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InvestigationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions only move forward through the DAG.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Phase within `running`, with its fixed progress checkpoint.
pub enum InvestigationPhase {
    Planning,
    Collecting,
    Analyzing,
    Synthesizing,
    Done,
}

impl InvestigationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "planning" => Some(Self::Planning),
            "collecting" => Some(Self::Collecting),
            "analyzing" => Some(Self::Analyzing),
            "synthesizing" => Some(Self::Synthesizing),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// Progress checkpoint reached when this phase COMPLETES.
    pub fn checkpoint(self) -> f64 {
        match self {
            Self::Planning => 0.1,
            Self::Collecting => 0.4,
            Self::Analyzing => 0.8,
            Self::Synthesizing | Self::Done => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One end-to-end pipeline execution, durable and progress-tracked.
pub struct Investigation {
    pub id: String,
    pub status: InvestigationStatus,
    /// Monotonically non-decreasing until terminal.
    pub progress: f64,
    pub current_phase: InvestigationPhase,
    pub created_at_unix_ms: u64,
    pub started_at_unix_ms: Option<u64>,
    /// Set iff `status` is terminal.
    pub completed_at_unix_ms: Option<u64>,
    pub total_records_analyzed: u64,
    pub anomalies_found: u64,
    pub summary: Option<String>,
    pub result_blob: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl Investigation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: InvestigationStatus::Pending,
            progress: 0.0,
            current_phase: InvestigationPhase::Planning,
            created_at_unix_ms: current_unix_timestamp_ms(),
            started_at_unix_ms: None,
            completed_at_unix_ms: None,
            total_records_analyzed: 0,
            anomalies_found: 0,
            summary: None,
            result_blob: None,
            metadata: Value::Null,
        }
    }

    /// Raises progress to `checkpoint`, never lowering it.
    pub fn advance_progress(&mut self, checkpoint: f64) {
        if checkpoint > self.progress {
            self.progress = checkpoint.clamp(0.0, 1.0);
        }
    }

    /// Projection safe for the unauthenticated results endpoint: strips
    /// user identifiers out of the metadata.
    pub fn public_projection(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "progress": self.progress,
            "current_phase": self.current_phase,
            "created_at_unix_ms": self.created_at_unix_ms,
            "completed_at_unix_ms": self.completed_at_unix_ms,
            "total_records_analyzed": self.total_records_analyzed,
            "anomalies_found": self.anomalies_found,
            "summary": self.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Investigation, InvestigationPhase, InvestigationStatus};

    #[test]
    fn unit_status_transition_dag() {
        use InvestigationStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn unit_progress_is_monotone() {
        let mut investigation = Investigation::new("inv-1");
        investigation.advance_progress(0.4);
        investigation.advance_progress(0.1);
        assert!((investigation.progress - 0.4).abs() < 1e-9);
        investigation.advance_progress(1.0);
        assert!((investigation.progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unit_phase_checkpoints_match_contract() {
        assert_eq!(InvestigationPhase::Planning.checkpoint(), 0.1);
        assert_eq!(InvestigationPhase::Collecting.checkpoint(), 0.4);
        assert_eq!(InvestigationPhase::Analyzing.checkpoint(), 0.8);
        assert_eq!(InvestigationPhase::Synthesizing.checkpoint(), 1.0);
    }

    #[test]
    fn unit_public_projection_omits_user_identifiers() {
        let mut investigation = Investigation::new("inv-1");
        investigation.metadata = serde_json::json!({ "user_id": "u-42", "partial": true });
        let projection = investigation.public_projection();
        assert!(projection.get("metadata").is_none());
        assert_eq!(projection["id"], "inv-1");
    }
}
