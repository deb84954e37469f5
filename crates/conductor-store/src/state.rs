use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use conductor_core::ids::RunId;
use conductor_core::status::RunStatus;

use crate::error::StoreError;
use crate::persist::{load_document, save_document};
use crate::records::{Metadata, OrchestratorRecord, RunRecord};

const RUNS_FILE: &str = "runs.json";
const ORCHESTRATORS_FILE: &str = "orchestrators.json";
const RUNS_KEY: &str = "runs";
const ORCHESTRATORS_KEY: &str = "orchestrators";

/// What a cleanup pass removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cleanup {
    pub runs: Vec<RunId>,
    pub orchestrators: Vec<RunId>,
}

impl Cleanup {
    /// Number of run records removed.
    pub fn count(&self) -> usize {
        self.runs.len()
    }
}

#[derive(Default)]
struct Inner {
    runs: BTreeMap<RunId, RunRecord>,
    orchestrators: BTreeMap<RunId, OrchestratorRecord>,
}

/// Run and orchestrator records, mirrored write-through to disk.
///
/// The in-memory maps are authoritative. A failed write is logged and returned
/// to the caller but memory keeps the mutation; the next successful write of
/// that document catches the file up.
pub struct StateStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Open (or create) the store rooted at `dir`, loading whatever is on disk.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let runs: BTreeMap<RunId, RunRecord> = load_document(&dir.join(RUNS_FILE), RUNS_KEY);
        let orchestrators: BTreeMap<RunId, OrchestratorRecord> =
            load_document(&dir.join(ORCHESTRATORS_FILE), ORCHESTRATORS_KEY);
        info!(
            runs = runs.len(),
            orchestrators = orchestrators.len(),
            "state loaded"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                runs,
                orchestrators,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn save_runs(&self, inner: &Inner) -> Result<(), StoreError> {
        save_document(&self.dir.join(RUNS_FILE), RUNS_KEY, &inner.runs).inspect_err(|e| {
            error!(error = %e, "failed to persist runs");
        })
    }

    fn save_orchestrators(&self, inner: &Inner) -> Result<(), StoreError> {
        save_document(
            &self.dir.join(ORCHESTRATORS_FILE),
            ORCHESTRATORS_KEY,
            &inner.orchestrators,
        )
        .inspect_err(|e| {
            error!(error = %e, "failed to persist orchestrators");
        })
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Record a run as running. An existing record is replaced.
    #[instrument(skip(self, metadata), fields(run_id = %run_id))]
    pub fn register_run(
        &self,
        run_id: &RunId,
        orchestrator_id: Option<&RunId>,
        metadata: Option<Metadata>,
    ) -> Result<RunRecord, StoreError> {
        let record = RunRecord::new(
            run_id.clone(),
            orchestrator_id.cloned(),
            metadata.unwrap_or_default(),
        );
        let mut inner = self.inner.lock();
        if inner.runs.insert(run_id.clone(), record.clone()).is_some() {
            debug!("replacing existing run record");
        }
        self.save_runs(&inner)?;
        Ok(record)
    }

    /// Create an orchestrator record unless one already exists.
    #[instrument(skip(self), fields(orchestrator_id = %orchestrator_id))]
    pub fn register_orchestrator(
        &self,
        orchestrator_id: &RunId,
    ) -> Result<OrchestratorRecord, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.orchestrators.get(orchestrator_id) {
            return Ok(existing.clone());
        }
        let record = OrchestratorRecord::new(orchestrator_id.clone());
        let _ = inner
            .orchestrators
            .insert(orchestrator_id.clone(), record.clone());
        self.save_orchestrators(&inner)?;
        Ok(record)
    }

    /// Set a run's status and result.
    ///
    /// Unknown runs are a warning and return `Ok(None)`. A terminal record
    /// keeps its status; only a missing result may still be filled in.
    #[instrument(skip(self, result), fields(run_id = %run_id, status = %status))]
    pub fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        result: Option<String>,
    ) -> Result<Option<RunRecord>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.runs.get_mut(run_id) else {
            warn!("status update for unknown run ignored");
            return Ok(None);
        };

        if record.is_terminal() && record.status != status {
            warn!(current = %record.status, "run already terminal, status unchanged");
            if record.result.is_none() && result.is_some() {
                record.result = result;
                record.updated_at = Some(Utc::now());
            } else {
                return Ok(Some(record.clone()));
            }
        } else {
            record.status = status;
            if result.is_some() {
                record.result = result;
            }
            record.updated_at = Some(Utc::now());
        }

        let updated = record.clone();
        self.save_runs(&inner)?;
        Ok(Some(updated))
    }

    /// Append `child_run_id` to the orchestrator's children, creating the orchestrator if needed.
    #[instrument(skip(self), fields(orchestrator_id = %orchestrator_id, child = %child_run_id))]
    pub fn add_child_to_orchestrator(
        &self,
        orchestrator_id: &RunId,
        child_run_id: &RunId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let orchestrator = inner
            .orchestrators
            .entry(orchestrator_id.clone())
            .or_insert_with(|| OrchestratorRecord::new(orchestrator_id.clone()));
        if !orchestrator.add_child(child_run_id) {
            return Ok(());
        }
        orchestrator.updated_at = Some(Utc::now());
        self.save_orchestrators(&inner)
    }

    /// Drop `child_run_id` from the orchestrator's children. Returns whether it was listed.
    #[instrument(skip(self), fields(orchestrator_id = %orchestrator_id, child = %child_run_id))]
    pub fn remove_child_from_orchestrator(
        &self,
        orchestrator_id: &RunId,
        child_run_id: &RunId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(orchestrator) = inner.orchestrators.get_mut(orchestrator_id) else {
            return Ok(false);
        };
        let before = orchestrator.child_runs.len();
        orchestrator.child_runs.retain(|c| c != child_run_id);
        if orchestrator.child_runs.len() == before {
            return Ok(false);
        }
        orchestrator.updated_at = Some(Utc::now());
        self.save_orchestrators(&inner)?;
        Ok(true)
    }

    /// Flag or clear a finished run whose result still has to reach its parent.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn set_forward_pending(
        &self,
        run_id: &RunId,
        pending: bool,
    ) -> Result<Option<RunRecord>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.runs.get_mut(run_id) else {
            warn!("forward flag for unknown run ignored");
            return Ok(None);
        };
        if record.forward_pending == pending {
            return Ok(Some(record.clone()));
        }
        record.forward_pending = pending;
        record.updated_at = Some(Utc::now());
        let updated = record.clone();
        self.save_runs(&inner)?;
        Ok(Some(updated))
    }

    /// Insert a fully formed record as-is.
    #[instrument(skip_all, fields(run_id = %record.id))]
    pub fn upsert_run(&self, record: RunRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let _ = inner.runs.insert(record.id.clone(), record);
        self.save_runs(&inner)
    }

    /// Remove runs created more than `max_age_days` ago.
    ///
    /// Removed runs are also dropped from every orchestrator's child list, and
    /// orchestrators that are past the same age with no children left go too.
    pub fn cleanup_old_runs(&self, max_age_days: u32) -> Result<Cleanup, StoreError> {
        self.cleanup_older_than(Utc::now() - Duration::days(i64::from(max_age_days)))
    }

    #[instrument(skip(self))]
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<Cleanup, StoreError> {
        let mut inner = self.inner.lock();
        let mut cleanup = Cleanup::default();

        inner.runs.retain(|id, record| {
            let keep = record.created_at >= cutoff;
            if !keep {
                cleanup.runs.push(id.clone());
            }
            keep
        });

        let mut orchestrators_changed = false;
        if !cleanup.runs.is_empty() {
            for orchestrator in inner.orchestrators.values_mut() {
                let before = orchestrator.child_runs.len();
                orchestrator
                    .child_runs
                    .retain(|child| !cleanup.runs.contains(child));
                orchestrators_changed |= orchestrator.child_runs.len() != before;
            }
        }
        inner.orchestrators.retain(|id, orchestrator| {
            let keep = orchestrator.created_at >= cutoff || !orchestrator.child_runs.is_empty();
            if !keep {
                cleanup.orchestrators.push(id.clone());
            }
            keep
        });
        orchestrators_changed |= !cleanup.orchestrators.is_empty();

        if !cleanup.runs.is_empty() || !cleanup.orchestrators.is_empty() {
            info!(
                runs = cleanup.runs.len(),
                orchestrators = cleanup.orchestrators.len(),
                "cleaned up old state"
            );
        }

        let runs_result = if cleanup.runs.is_empty() {
            Ok(())
        } else {
            self.save_runs(&inner)
        };
        let orchestrators_result = if orchestrators_changed {
            self.save_orchestrators(&inner)
        } else {
            Ok(())
        };
        runs_result.and(orchestrators_result)?;
        Ok(cleanup)
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub fn get_run(&self, run_id: &RunId) -> Option<RunRecord> {
        self.inner.lock().runs.get(run_id).cloned()
    }

    pub fn get_orchestrator(&self, orchestrator_id: &RunId) -> Option<OrchestratorRecord> {
        self.inner.lock().orchestrators.get(orchestrator_id).cloned()
    }

    /// The orchestrator that `run_id` was registered under, if any.
    pub fn get_orchestrator_for_run(&self, run_id: &RunId) -> Option<OrchestratorRecord> {
        let inner = self.inner.lock();
        if let Some(parent) = inner
            .runs
            .get(run_id)
            .and_then(|r| r.orchestrator_id.as_ref())
        {
            if let Some(orchestrator) = inner.orchestrators.get(parent) {
                return Some(orchestrator.clone());
            }
        }
        inner
            .orchestrators
            .values()
            .find(|o| o.child_runs.contains(run_id))
            .cloned()
    }

    /// Terminal runs whose result was never delivered to their parent.
    pub fn pending_forwards(&self) -> Vec<RunId> {
        self.inner
            .lock()
            .runs
            .values()
            .filter(|r| r.forward_pending && r.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn get_all_runs(&self) -> BTreeMap<RunId, RunRecord> {
        self.inner.lock().runs.clone()
    }

    pub fn get_all_orchestrators(&self) -> BTreeMap<RunId, OrchestratorRecord> {
        self.inner.lock().orchestrators.clone()
    }
}
