// Path: crates/types/src/job.rs

//! Jobs, job ids, and return records.

use crate::ident::MinionId;
use crate::target::TargetSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A globally unique identifier for one dispatched job.
///
/// The textual form is `YYYYMMDDHHMMSSmmmmmm` (UTC, microsecond precision)
/// followed by eight hex characters of random suffix. The timestamp keeps
/// ids sortable; the suffix guarantees uniqueness across masters that
/// publish within the same microsecond.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Allocates a fresh jid for the current instant.
    pub fn generate() -> Self {
        let suffix: [u8; 4] = rand::random();
        Self(format!(
            "{}{}",
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            hex::encode(suffix)
        ))
    }

    /// Wraps an existing jid string, e.g. one received from an upstream
    /// master. The syndic relay depends on this never re-allocating.
    pub fn from_existing(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    /// Returns the jid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `<YY>/<MM>` cache-directory prefix for this jid, if the leading
    /// timestamp is well formed.
    pub fn cache_prefix(&self) -> Option<(String, String)> {
        let yy = self.0.get(2..4)?;
        let mm = self.0.get(4..6)?;
        if !yy.bytes().all(|b| b.is_ascii_digit()) || !mm.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((yy.to_string(), mm.to_string()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle state of a dispatched job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The publication has been sent and returns are being gathered.
    Collecting,
    /// Every targeted minion returned, or the gather deadline elapsed.
    Closed,
}

/// A dispatched job as recorded by the master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    /// The job id.
    pub jid: JobId,
    /// The target expression the job was published against.
    pub target: TargetSpec,
    /// The function to invoke, keyed `module.fun`.
    pub fun: String,
    /// Positional arguments.
    pub arg: Vec<Value>,
    /// Keyword arguments.
    pub kwarg: Map<String, Value>,
    /// The requesting user, for the audit trail.
    pub user: String,
    /// Publication instant.
    pub timestamp: DateTime<Utc>,
    /// Optional persistent returner name.
    pub ret: Option<String>,
}

/// A single minion's result for one job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Return {
    /// The job this return answers.
    pub jid: JobId,
    /// The returning minion.
    pub id: MinionId,
    /// Process-style return code; zero means success.
    pub retcode: i32,
    /// The function's result, arbitrary JSON-serialisable data.
    #[serde(rename = "return")]
    pub ret: Value,
    /// Whether the function completed without error.
    pub success: bool,
    /// The function that produced this return.
    pub fun: String,
    /// When the minion formed the return.
    #[serde(rename = "_stamp")]
    pub stamp: DateTime<Utc>,
}

impl Return {
    /// Builds a failure return wrapping an internal minion error, per the
    /// propagation policy: the minion never raises, it returns.
    pub fn failure(jid: JobId, id: MinionId, fun: impl Into<String>, msg: String) -> Self {
        Self {
            jid,
            id,
            retcode: 1,
            ret: Value::String(msg),
            success: false,
            fun: fun.into(),
            stamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_shape() {
        let jid = JobId::generate();
        // 20 timestamp digits + 8 hex chars.
        assert_eq!(jid.as_str().len(), 28);
        assert!(jid.as_str()[..20].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_jid_uniqueness() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_prefix() {
        let jid = JobId::from_existing("20260801120000123456deadbeef");
        assert_eq!(
            jid.cache_prefix(),
            Some(("26".to_string(), "08".to_string()))
        );
        assert_eq!(JobId::from_existing("short").cache_prefix(), None);
    }
}
