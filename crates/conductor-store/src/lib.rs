//! Durable record of runs and orchestrators.
//!
//! Two JSON documents live under the state directory: `runs.json` and
//! `orchestrators.json`. Every mutation rewrites the affected document
//! through a temp file and rename, so a crash never leaves a torn file.

pub mod error;
pub mod persist;
pub mod records;
pub mod state;

pub use error::StoreError;
pub use records::{OrchestratorRecord, RunRecord};
pub use state::{Cleanup, StateStore};
