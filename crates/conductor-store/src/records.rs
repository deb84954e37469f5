use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::ids::RunId;
use conductor_core::status::{OrchestratorStatus, RunStatus};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// The run finished but its result has not reached the parent yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forward_pending: bool,
}

impl RunRecord {
    /// A freshly registered, running record.
    pub fn new(id: RunId, orchestrator_id: Option<RunId>, metadata: Metadata) -> Self {
        Self {
            id,
            orchestrator_id,
            created_at: Utc::now(),
            updated_at: None,
            status: RunStatus::Running,
            result: None,
            metadata,
            forward_pending: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorRecord {
    pub id: RunId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: OrchestratorStatus,
    /// Insertion-ordered, never contains duplicates.
    #[serde(default)]
    pub child_runs: Vec<RunId>,
}

impl OrchestratorRecord {
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            updated_at: None,
            status: OrchestratorStatus::Running,
            child_runs: Vec::new(),
        }
    }

    /// Append `child` unless already present. Returns whether it was added.
    pub fn add_child(&mut self, child: &RunId) -> bool {
        if self.child_runs.contains(child) {
            return false;
        }
        self.child_runs.push(child.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_child_deduplicates() {
        let mut orch = OrchestratorRecord::new(RunId::from(1u64));
        assert!(orch.add_child(&RunId::from("2")));
        assert!(!orch.add_child(&RunId::from(2u64)));
        assert_eq!(orch.child_runs, vec![RunId::from("2")]);
    }

    #[test]
    fn record_accepts_numeric_ids_and_missing_optionals() {
        let raw = serde_json::json!({
            "id": 17,
            "orchestrator_id": "3",
            "created_at": "2024-05-01T10:00:00Z",
            "status": "completed",
        });
        let record: RunRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.id.as_str(), "17");
        assert_eq!(record.orchestrator_id, Some(RunId::from(3u64)));
        assert!(record.is_terminal());
        assert!(record.metadata.is_empty());
        assert!(!record.forward_pending);
    }

    #[test]
    fn forward_pending_only_written_when_set() {
        let mut record = RunRecord::new(RunId::from(4u64), None, Metadata::new());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("forward_pending").is_none());

        record.forward_pending = true;
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["forward_pending"], true);
        let back: RunRecord = serde_json::from_value(json).unwrap();
        assert!(back.forward_pending);
    }
}
