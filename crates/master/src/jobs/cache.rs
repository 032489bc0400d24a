// Path: crates/master/src/jobs/cache.rs
//! The in-memory job cache.
//!
//! Sharded by jid hash with a per-shard mutex; no lock is held across a
//! suspension point. Entries are ring-retained for `keep_jobs` hours and
//! swept by the master's prune task.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use herd_types::error::{DispatchError, InternalError};
use herd_types::job::{Job, JobState, Return};
use herd_types::wire::{JobStatusView, ReturnEntry};
use herd_types::{JobId, MinionId};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

const SHARDS: usize = 16;

/// What happened to an incoming return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnDisposition {
    /// Stored.
    Stored {
        /// The job had already closed when this return arrived.
        late: bool,
        /// This return completed the expected set and closed the job.
        closed_now: bool,
    },
    /// A return from this minion for this jid already exists; the first
    /// copy stands.
    Duplicate,
}

struct JobRecord {
    job: Job,
    state: JobState,
    expected: BTreeSet<MinionId>,
    returns: Vec<ReturnEntry>,
    missing: BTreeSet<MinionId>,
}

/// The sharded cache.
pub struct JobCache {
    shards: Vec<Mutex<HashMap<JobId, JobRecord>>>,
    keep: ChronoDuration,
    max_jobs: usize,
}

impl JobCache {
    /// A cache retaining jobs for `keep_hours`, refusing new entries past
    /// `max_jobs`.
    pub fn new(keep_hours: u64, max_jobs: usize) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            keep: ChronoDuration::hours(keep_hours.min(i64::MAX as u64) as i64),
            max_jobs,
        }
    }

    fn shard(&self, jid: &JobId) -> &Mutex<HashMap<JobId, JobRecord>> {
        let mut hasher = DefaultHasher::new();
        jid.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        // The modulo keeps the index in range.
        &self.shards[idx]
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Records a new job as collecting. An empty expected set closes it on
    /// the spot. Fails with `JidCollision` if the jid already exists
    /// within the retention window.
    pub fn insert(
        &self,
        job: Job,
        expected: BTreeSet<MinionId>,
    ) -> Result<(), herd_types::error::CoreError> {
        if self.len() >= self.max_jobs {
            return Err(InternalError::CacheFull.into());
        }
        let jid = job.jid.clone();
        let mut shard = self.shard(&jid).lock();
        if shard.contains_key(&jid) {
            return Err(DispatchError::JidCollision.into());
        }
        let state = if expected.is_empty() {
            JobState::Closed
        } else {
            JobState::Collecting
        };
        shard.insert(
            jid,
            JobRecord {
                job,
                state,
                expected,
                returns: Vec::new(),
                missing: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Files one return. Unknown or expired jids are the caller's signal
    /// to discard and log.
    pub fn add_return(&self, ret: Return) -> Result<ReturnDisposition, DispatchError> {
        let mut shard = self.shard(&ret.jid).lock();
        let record = shard
            .get_mut(&ret.jid)
            .ok_or_else(|| DispatchError::JobNotFound(ret.jid.to_string()))?;

        if record.returns.iter().any(|entry| entry.ret.id == ret.id) {
            return Ok(ReturnDisposition::Duplicate);
        }

        let late = record.state == JobState::Closed;
        record.expected.remove(&ret.id);
        record.missing.remove(&ret.id);
        record.returns.push(ReturnEntry { ret, late });

        let closed_now = if !late && record.expected.is_empty() {
            record.state = JobState::Closed;
            true
        } else {
            false
        };
        Ok(ReturnDisposition::Stored { late, closed_now })
    }

    /// Closes a job whose gather deadline fired, flagging every target
    /// that never returned. Returns the missing set, or `None` if the job
    /// is unknown or already closed.
    pub fn close(&self, jid: &JobId) -> Option<Vec<MinionId>> {
        let mut shard = self.shard(jid).lock();
        let record = shard.get_mut(jid)?;
        if record.state == JobState::Closed {
            return None;
        }
        record.state = JobState::Closed;
        record.missing = std::mem::take(&mut record.expected);
        Some(record.missing.iter().cloned().collect())
    }

    /// A point-in-time view of one job.
    pub fn status(&self, jid: &JobId) -> Option<JobStatusView> {
        let shard = self.shard(jid).lock();
        let record = shard.get(jid)?;
        let mut expected: Vec<MinionId> = record.expected.iter().cloned().collect();
        expected.extend(record.returns.iter().map(|e| e.ret.id.clone()));
        expected.sort();
        Some(JobStatusView {
            jid: jid.clone(),
            state: record.state,
            expected,
            returns: record.returns.clone(),
            missing: record.missing.iter().cloned().collect(),
        })
    }

    /// The stored job load.
    pub fn get_load(&self, jid: &JobId) -> Option<Job> {
        self.shard(jid).lock().get(jid).map(|r| r.job.clone())
    }

    /// Every jid in the retention window, newest first.
    pub fn list_jids(&self) -> Vec<JobId> {
        let mut out: Vec<JobId> = self
            .shards
            .iter()
            .flat_map(|s| s.lock().keys().cloned().collect::<Vec<_>>())
            .collect();
        out.sort();
        out.reverse();
        out
    }

    /// True while any job is still collecting.
    pub fn has_collecting(&self) -> bool {
        self.shards.iter().any(|s| {
            s.lock()
                .values()
                .any(|r| r.state == JobState::Collecting)
        })
    }

    /// Sweeps entries older than the retention window.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - self.keep;
        for shard in &self.shards {
            shard.lock().retain(|_, r| r.job.timestamp >= cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_types::target::TargetSpec;
    use serde_json::{json, Map};

    fn job(jid: &str) -> Job {
        Job {
            jid: JobId::from_existing(jid),
            target: TargetSpec::glob("*"),
            fun: "test.echo".into(),
            arg: vec![],
            kwarg: Map::new(),
            user: "root".into(),
            timestamp: Utc::now(),
            ret: None,
        }
    }

    fn ret(jid: &str, id: &str) -> Return {
        Return {
            jid: JobId::from_existing(jid),
            id: MinionId::new(id),
            retcode: 0,
            ret: json!("ok"),
            success: true,
            fun: "test.echo".into(),
            stamp: Utc::now(),
        }
    }

    fn expected(ids: &[&str]) -> BTreeSet<MinionId> {
        ids.iter().map(|s| MinionId::new(*s)).collect()
    }

    #[test]
    fn test_collect_and_close_on_full_set() {
        let cache = JobCache::new(24, 1000);
        cache.insert(job("j1"), expected(&["m1", "m2"])).unwrap();

        assert_eq!(
            cache.add_return(ret("j1", "m1")).unwrap(),
            ReturnDisposition::Stored {
                late: false,
                closed_now: false
            }
        );
        assert_eq!(
            cache.add_return(ret("j1", "m2")).unwrap(),
            ReturnDisposition::Stored {
                late: false,
                closed_now: true
            }
        );
        let view = cache.status(&JobId::from_existing("j1")).unwrap();
        assert_eq!(view.state, JobState::Closed);
        assert!(view.missing.is_empty());
    }

    #[test]
    fn test_duplicate_return_keeps_first_copy() {
        let cache = JobCache::new(24, 1000);
        cache.insert(job("j1"), expected(&["m1", "m2"])).unwrap();
        cache.add_return(ret("j1", "m1")).unwrap();

        let mut second = ret("j1", "m1");
        second.ret = json!("different");
        assert_eq!(
            cache.add_return(second).unwrap(),
            ReturnDisposition::Duplicate
        );

        let view = cache.status(&JobId::from_existing("j1")).unwrap();
        assert_eq!(view.returns.len(), 1);
        assert_eq!(view.returns[0].ret.ret, json!("ok"));
    }

    #[test]
    fn test_deadline_close_flags_missing() {
        let cache = JobCache::new(24, 1000);
        cache
            .insert(job("j1"), expected(&["m1", "m2", "m3"]))
            .unwrap();
        cache.add_return(ret("j1", "m1")).unwrap();

        let missing = cache.close(&JobId::from_existing("j1")).unwrap();
        assert_eq!(missing, vec![MinionId::new("m2"), MinionId::new("m3")]);
        // Closing twice is a no-op.
        assert!(cache.close(&JobId::from_existing("j1")).is_none());
    }

    #[test]
    fn test_late_return_flagged_and_clears_missing() {
        let cache = JobCache::new(24, 1000);
        cache.insert(job("j1"), expected(&["m1"])).unwrap();
        cache.close(&JobId::from_existing("j1")).unwrap();

        assert_eq!(
            cache.add_return(ret("j1", "m1")).unwrap(),
            ReturnDisposition::Stored {
                late: true,
                closed_now: false
            }
        );
        let view = cache.status(&JobId::from_existing("j1")).unwrap();
        assert!(view.returns[0].late);
        assert!(view.missing.is_empty());
    }

    #[test]
    fn test_unknown_jid_is_job_not_found() {
        let cache = JobCache::new(24, 1000);
        assert!(matches!(
            cache.add_return(ret("nope", "m1")),
            Err(DispatchError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_jid_collision_detected() {
        let cache = JobCache::new(24, 1000);
        cache.insert(job("j1"), expected(&["m1"])).unwrap();
        let err = cache.insert(job("j1"), expected(&["m1"])).unwrap_err();
        assert!(matches!(
            err,
            herd_types::error::CoreError::Dispatch(DispatchError::JidCollision)
        ));
    }

    #[test]
    fn test_empty_target_closes_immediately() {
        let cache = JobCache::new(24, 1000);
        cache.insert(job("j1"), BTreeSet::new()).unwrap();
        let view = cache.status(&JobId::from_existing("j1")).unwrap();
        assert_eq!(view.state, JobState::Closed);
    }

    #[test]
    fn test_prune_respects_retention() {
        let cache = JobCache::new(1, 1000);
        let mut old = job("j-old");
        old.timestamp = Utc::now() - ChronoDuration::hours(2);
        cache.insert(old, BTreeSet::new()).unwrap();
        cache.insert(job("j-new"), BTreeSet::new()).unwrap();

        cache.prune(Utc::now());
        assert!(cache.get_load(&JobId::from_existing("j-old")).is_none());
        assert!(cache.get_load(&JobId::from_existing("j-new")).is_some());
    }

    #[test]
    fn test_cache_full() {
        let cache = JobCache::new(24, 2);
        cache.insert(job("j1"), BTreeSet::new()).unwrap();
        cache.insert(job("j2"), BTreeSet::new()).unwrap();
        assert!(matches!(
            cache.insert(job("j3"), BTreeSet::new()),
            Err(herd_types::error::CoreError::Internal(
                InternalError::CacheFull
            ))
        ));
    }
}
