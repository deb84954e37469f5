use std::collections::{BTreeMap, BTreeSet, HashMap};

use conductor_core::ids::RunId;
use conductor_store::{OrchestratorRecord, RunRecord};

/// Parent/child edges plus the active/completed partition of known runs.
///
/// Every registered run is in exactly one of the two sets. The whole structure
/// is derived state: [`RelationshipTracker::rebuild`] reconstructs it from the
/// store's records.
#[derive(Debug, Default)]
pub struct RelationshipTracker {
    parents: HashMap<RunId, RunId>,
    children: HashMap<RunId, Vec<RunId>>,
    active: BTreeSet<RunId>,
    completed: BTreeSet<RunId>,
}

impl RelationshipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(
        runs: &BTreeMap<RunId, RunRecord>,
        orchestrators: &BTreeMap<RunId, OrchestratorRecord>,
    ) -> Self {
        let mut tracker = Self::new();
        for orchestrator in orchestrators.values() {
            for child in &orchestrator.child_runs {
                tracker.link(&orchestrator.id, child);
            }
        }
        for record in runs.values() {
            if let Some(parent) = &record.orchestrator_id {
                tracker.link(parent, &record.id);
            }
            if record.is_terminal() {
                let _ = tracker.completed.insert(record.id.clone());
            } else {
                let _ = tracker.active.insert(record.id.clone());
            }
        }
        tracker
    }

    fn link(&mut self, parent: &RunId, child: &RunId) {
        if let Some(previous) = self.parents.insert(child.clone(), parent.clone()) {
            if &previous != parent {
                if let Some(siblings) = self.children.get_mut(&previous) {
                    siblings.retain(|c| c != child);
                }
            }
        }
        let siblings = self.children.entry(parent.clone()).or_default();
        if !siblings.contains(child) {
            siblings.push(child.clone());
        }
    }

    /// Record `child` under `parent` and mark the child active.
    pub fn register_parent_child(&mut self, parent: &RunId, child: &RunId) {
        self.link(parent, child);
        let _ = self.completed.remove(child);
        let _ = self.active.insert(child.clone());
    }

    /// Mark `run` active unless it is already known. Returns whether it was new.
    pub fn register_run(&mut self, run: &RunId) -> bool {
        if self.is_known(run) {
            return false;
        }
        self.active.insert(run.clone())
    }

    /// Move `run` to the completed set. Returns whether it was not completed before.
    pub fn mark_run_completed(&mut self, run: &RunId) -> bool {
        let _ = self.active.remove(run);
        self.completed.insert(run.clone())
    }

    /// Drop every trace of `run`: both sets and all edges touching it.
    pub fn forget(&mut self, run: &RunId) {
        let _ = self.active.remove(run);
        let _ = self.completed.remove(run);
        if let Some(parent) = self.parents.remove(run) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| c != run);
                if siblings.is_empty() {
                    let _ = self.children.remove(&parent);
                }
            }
        }
        if let Some(children) = self.children.remove(run) {
            for child in children {
                let _ = self.parents.remove(&child);
            }
        }
    }

    pub fn parent_of(&self, run: &RunId) -> Option<&RunId> {
        self.parents.get(run)
    }

    pub fn children_of(&self, run: &RunId) -> &[RunId] {
        self.children.get(run).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_known(&self, run: &RunId) -> bool {
        self.active.contains(run) || self.completed.contains(run)
    }

    pub fn is_active(&self, run: &RunId) -> bool {
        self.active.contains(run)
    }

    pub fn is_completed(&self, run: &RunId) -> bool {
        self.completed.contains(run)
    }

    pub fn active_snapshot(&self) -> Vec<RunId> {
        self.active.iter().cloned().collect()
    }

    pub fn completed_snapshot(&self) -> Vec<RunId> {
        self.completed.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_store::records::Metadata;

    fn id(raw: impl Into<RunId>) -> RunId {
        raw.into()
    }

    fn in_exactly_one_set(tracker: &RelationshipTracker, run: &RunId) -> bool {
        tracker.is_active(run) ^ tracker.is_completed(run)
    }

    #[test]
    fn parent_child_edges_both_ways() {
        let mut tracker = RelationshipTracker::new();
        tracker.register_parent_child(&id(1u64), &id(2u64));
        tracker.register_parent_child(&id(1u64), &id(3u64));
        tracker.register_parent_child(&id("1"), &id("2"));

        assert_eq!(tracker.parent_of(&id(2u64)), Some(&id(1u64)));
        assert_eq!(tracker.children_of(&id(1u64)), &[id(2u64), id(3u64)]);
        assert!(tracker.children_of(&id(9u64)).is_empty());
    }

    #[test]
    fn registered_runs_are_in_exactly_one_set() {
        let mut tracker = RelationshipTracker::new();
        tracker.register_run(&id(1u64));
        tracker.register_parent_child(&id(1u64), &id(2u64));
        tracker.mark_run_completed(&id(2u64));
        tracker.register_run(&id(2u64));

        for run in [id(1u64), id(2u64)] {
            assert!(in_exactly_one_set(&tracker, &run), "{run}");
        }
        assert!(tracker.is_completed(&id(2u64)));
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let mut tracker = RelationshipTracker::new();
        tracker.register_run(&id(5u64));
        assert!(tracker.mark_run_completed(&id(5u64)));
        let once = (tracker.active_snapshot(), tracker.completed_snapshot());
        assert!(!tracker.mark_run_completed(&id(5u64)));
        assert_eq!((tracker.active_snapshot(), tracker.completed_snapshot()), once);
    }

    #[test]
    fn reparenting_reactivates_stale_completion() {
        let mut tracker = RelationshipTracker::new();
        tracker.register_run(&id(2u64));
        tracker.mark_run_completed(&id(2u64));
        tracker.register_parent_child(&id(1u64), &id(2u64));
        assert!(tracker.is_active(&id(2u64)));
        assert!(!tracker.is_completed(&id(2u64)));
    }

    #[test]
    fn forget_removes_edges() {
        let mut tracker = RelationshipTracker::new();
        tracker.register_parent_child(&id(1u64), &id(2u64));
        tracker.forget(&id(2u64));
        assert!(!tracker.is_known(&id(2u64)));
        assert!(tracker.parent_of(&id(2u64)).is_none());
        assert!(tracker.children_of(&id(1u64)).is_empty());
    }

    #[test]
    fn rebuild_from_records() {
        let mut runs = BTreeMap::new();
        let child = RunRecord::new(id(2u64), Some(id(1u64)), Metadata::new());
        let mut done = RunRecord::new(id(3u64), None, Metadata::new());
        done.status = conductor_core::status::RunStatus::Failed;
        runs.insert(child.id.clone(), child);
        runs.insert(done.id.clone(), done);

        let mut orchestrators = BTreeMap::new();
        let mut orchestrator = OrchestratorRecord::new(id(1u64));
        orchestrator.add_child(&id(2u64));
        orchestrator.add_child(&id(4u64));
        orchestrators.insert(orchestrator.id.clone(), orchestrator);

        let tracker = RelationshipTracker::rebuild(&runs, &orchestrators);
        assert_eq!(tracker.active_snapshot(), vec![id(2u64)]);
        assert_eq!(tracker.completed_snapshot(), vec![id(3u64)]);
        assert_eq!(tracker.children_of(&id(1u64)), &[id(2u64), id(4u64)]);
        assert_eq!(tracker.parent_of(&id(4u64)), Some(&id(1u64)));
    }
}
