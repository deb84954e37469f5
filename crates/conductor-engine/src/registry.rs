use parking_lot::RwLock;
use tracing::{debug, info, warn};

use conductor_core::ids::RunId;
use conductor_core::status::RunStatus;
use conductor_store::records::Metadata;
use conductor_store::state::Cleanup;
use conductor_store::{OrchestratorRecord, RunRecord, StateStore, StoreError};

use crate::tracker::RelationshipTracker;

/// The store and the relationship tracker kept in step.
///
/// Lock order: the tracker's write lock is always taken before the store's
/// internal mutex, and neither is held across an await point.
pub struct RunRegistry {
    store: StateStore,
    tracker: RwLock<RelationshipTracker>,
}

impl RunRegistry {
    /// Wrap `store`, rebuilding the tracker from its records.
    pub fn new(store: StateStore) -> Self {
        let tracker = RelationshipTracker::rebuild(&store.get_all_runs(), &store.get_all_orchestrators());
        debug!(
            active = tracker.active_snapshot().len(),
            completed = tracker.completed_snapshot().len(),
            "tracker rebuilt from store"
        );
        Self {
            store,
            tracker: RwLock::new(tracker),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Register a standalone run as running. A run that is already known,
    /// in either set, is left untouched and `Ok(false)` is returned.
    pub fn register_run(&self, run: &RunId, metadata: Option<Metadata>) -> Result<bool, StoreError> {
        let mut tracker = self.tracker.write();
        if self.store.get_run(run).is_some() || tracker.is_known(run) {
            return Ok(false);
        }
        let _ = tracker.register_run(run);
        self.store.register_run(run, None, metadata)?;
        Ok(true)
    }

    /// Register `child` under `parent`, in memory and on disk.
    ///
    /// A child that moves to a new parent is dropped from the previous
    /// orchestrator's record too. All store writes are attempted even if one
    /// fails; the first failure is returned.
    pub fn register_parent_child(
        &self,
        parent: &RunId,
        child: &RunId,
        metadata: Option<Metadata>,
    ) -> Result<(), StoreError> {
        let mut tracker = self.tracker.write();
        let previous = tracker.parent_of(child).filter(|p| *p != parent).cloned();
        tracker.register_parent_child(parent, child);

        let detach = match &previous {
            Some(previous) => {
                info!(child = %child, from = %previous, to = %parent, "moving child run to a new parent");
                self.store.remove_child_from_orchestrator(previous, child).map(|_| ())
            }
            None => Ok(()),
        };
        let orchestrator = self.store.register_orchestrator(parent).map(|_| ());
        let edge = self.store.add_child_to_orchestrator(parent, child);
        let run = self.store.register_run(child, Some(parent), metadata).map(|_| ());
        info!(parent = %parent, child = %child, "registered child run");
        detach.and(orchestrator).and(edge).and(run)
    }

    /// Mark `run` completed without a result.
    pub fn mark_run_completed(&self, run: &RunId) -> bool {
        self.complete_run(run, RunStatus::Completed, None)
    }

    /// Move `run` to a terminal state. Returns `true` only the first time.
    ///
    /// A non-terminal `status` is treated as `Completed`. Runs that were never
    /// registered are ignored. Persistence failures are logged by the store;
    /// memory is already up to date.
    pub fn complete_run(&self, run: &RunId, status: RunStatus, result: Option<String>) -> bool {
        self.finish(run, status, result, false)
    }

    /// Like [`Self::complete_run`], but a run with a parent is also flagged
    /// as owing its result to that parent until [`Self::forward_delivered`].
    pub fn complete_child_run(&self, run: &RunId, status: RunStatus, result: Option<String>) -> bool {
        self.finish(run, status, result, true)
    }

    fn finish(&self, run: &RunId, status: RunStatus, result: Option<String>, forward: bool) -> bool {
        let status = if status.is_terminal() {
            status
        } else {
            RunStatus::Completed
        };
        let mut tracker = self.tracker.write();
        if self.store.get_run(run).is_none() && !tracker.is_known(run) {
            warn!(run_id = %run, "completion for unregistered run ignored");
            return false;
        }
        let newly_completed = tracker.mark_run_completed(run);
        // written before the status: a child is never terminal on disk without its flag
        if newly_completed && forward && tracker.parent_of(run).is_some() {
            let _ = self.store.set_forward_pending(run, true);
        }
        let _ = self.store.update_run_status(run, status, result);
        newly_completed
    }

    /// Finished child runs whose result has not reached the parent yet.
    pub fn pending_forwards(&self) -> Vec<RunId> {
        self.store.pending_forwards()
    }

    /// The parent has `run`'s result; stop retrying the forward.
    pub fn forward_delivered(&self, run: &RunId) -> Result<(), StoreError> {
        self.store.set_forward_pending(run, false).map(|_| ())
    }

    /// Remove runs older than `max_age_days` from the store and the tracker.
    pub fn cleanup_old_runs(&self, max_age_days: u32) -> Result<Cleanup, StoreError> {
        let mut tracker = self.tracker.write();
        let cleanup = self.store.cleanup_old_runs(max_age_days)?;
        for run in cleanup.runs.iter().chain(&cleanup.orchestrators) {
            tracker.forget(run);
        }
        Ok(cleanup)
    }

    pub fn get_run(&self, run: &RunId) -> Option<RunRecord> {
        self.store.get_run(run)
    }

    pub fn get_orchestrator(&self, orchestrator: &RunId) -> Option<OrchestratorRecord> {
        self.store.get_orchestrator(orchestrator)
    }

    pub fn get_orchestrator_for_run(&self, run: &RunId) -> Option<OrchestratorRecord> {
        self.store.get_orchestrator_for_run(run)
    }

    pub fn parent_of(&self, run: &RunId) -> Option<RunId> {
        self.tracker.read().parent_of(run).cloned()
    }

    pub fn children_of(&self, run: &RunId) -> Vec<RunId> {
        self.tracker.read().children_of(run).to_vec()
    }

    pub fn is_active(&self, run: &RunId) -> bool {
        self.tracker.read().is_active(run)
    }

    pub fn is_completed(&self, run: &RunId) -> bool {
        self.tracker.read().is_completed(run)
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.tracker.read().active_snapshot()
    }

    pub fn completed_runs(&self) -> Vec<RunId> {
        self.tracker.read().completed_snapshot()
    }
}
