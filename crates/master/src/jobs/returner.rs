// Path: crates/master/src/jobs/returner.rs
//! The pluggable persistent-returner interface.
//!
//! Writes from the dispatcher are best-effort: a failing backend logs and
//! never blocks dispatch or collection. The interface is fixed; every
//! backend implements all six methods.

use async_trait::async_trait;
use herd_types::error::CoreError;
use herd_types::job::{Job, Return};
use herd_types::{JobId, MinionId};

/// A persistence backend for the job cache.
#[async_trait]
pub trait Returner: Send + Sync {
    /// Reserves storage for a jid before anything is written.
    async fn prep_jid(&self, job: &Job) -> Result<(), CoreError>;

    /// Persists the job load.
    async fn save_load(&self, jid: &JobId, job: &Job) -> Result<(), CoreError>;

    /// Persists one minion's return.
    async fn save_return(&self, jid: &JobId, ret: &Return) -> Result<(), CoreError>;

    /// Reads a job load back.
    async fn get_load(&self, jid: &JobId) -> Result<Option<Job>, CoreError>;

    /// Reads one minion's return back.
    async fn get_return(&self, jid: &JobId, id: &MinionId) -> Result<Option<Return>, CoreError>;

    /// Lists every persisted jid.
    async fn get_jids(&self) -> Result<Vec<JobId>, CoreError>;
}
