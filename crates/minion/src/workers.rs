// Path: crates/minion/src/workers.rs
//! The bounded worker pool.
//!
//! Publications execute per-publication concurrent up to the pool size;
//! excess publications wait in a bounded queue whose overflow policy is
//! reject-oldest. Cancellation is cooperative: a terminate-job
//! publication flips the job's flag and drops it from the queue if it has
//! not started.

use futures::future::BoxFuture;
use herd_types::wire::PublishLoad;
use herd_types::JobId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// One queued publication plus its cancellation flag.
pub struct QueuedJob {
    /// The decrypted publication body.
    pub load: PublishLoad,
    /// Cooperative cancellation flag shared with `cancel`.
    pub cancel: Arc<AtomicBool>,
}

/// The closure the pool runs for every job.
pub type JobRunner = Arc<dyn Fn(QueuedJob) -> BoxFuture<'static, ()> + Send + Sync>;

struct PoolState {
    queue: VecDeque<QueuedJob>,
    cancels: HashMap<JobId, Arc<AtomicBool>>,
}

/// The pool.
pub struct WorkerPool {
    state: Arc<Mutex<PoolState>>,
    notify: Arc<Notify>,
    queue_cap: usize,
    dispatch_task: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns the dispatch loop: `workers` concurrent executions,
    /// `queue_cap` waiting slots.
    pub fn new(workers: usize, queue_cap: usize, runner: JobRunner) -> Self {
        let state = Arc::new(Mutex::new(PoolState {
            queue: VecDeque::new(),
            cancels: HashMap::new(),
        }));
        let notify = Arc::new(Notify::new());
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        let loop_state = state.clone();
        let loop_notify = notify.clone();
        let dispatch_task = tokio::spawn(async move {
            loop {
                let job = loop {
                    if let Some(job) = loop_state.lock().queue.pop_front() {
                        break job;
                    }
                    loop_notify.notified().await;
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    return;
                };
                let runner = runner.clone();
                let done_state = loop_state.clone();
                tokio::spawn(async move {
                    let jid = job.load.jid.clone();
                    runner(job).await;
                    done_state.lock().cancels.remove(&jid);
                    drop(permit);
                });
            }
        });

        Self {
            state,
            notify,
            queue_cap: queue_cap.max(1),
            dispatch_task,
        }
    }

    /// Queues one publication. On overflow the oldest queued job is
    /// rejected to make room.
    pub fn submit(&self, load: PublishLoad) {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        if state.queue.len() >= self.queue_cap {
            if let Some(dropped) = state.queue.pop_front() {
                state.cancels.remove(&dropped.load.jid);
                tracing::warn!(
                    jid = %dropped.load.jid,
                    fun = %dropped.load.fun,
                    "job queue overflow, oldest publication rejected"
                );
            }
        }
        state.cancels.insert(load.jid.clone(), cancel.clone());
        state.queue.push_back(QueuedJob { load, cancel });
        drop(state);
        self.notify.notify_one();
    }

    /// Cancels a job: flips its flag if running, drops it if queued.
    pub fn cancel(&self, jid: &JobId) -> bool {
        let mut state = self.state.lock();
        state.queue.retain(|job| &job.load.jid != jid);
        match state.cancels.remove(jid) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stops dispatching; running jobs finish on their own.
    pub fn shutdown(&self) {
        self.dispatch_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use herd_types::target::MatcherKind;
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn load(jid: &str) -> PublishLoad {
        PublishLoad {
            jid: JobId::from_existing(jid),
            tgt: "*".into(),
            tgt_type: MatcherKind::Glob,
            fun: "test.echo".into(),
            arg: vec![],
            kwarg: Map::new(),
            ret: None,
            user: "root".into(),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let running2 = running.clone();
        let peak2 = peak.clone();

        let pool = WorkerPool::new(
            2,
            64,
            Arc::new(move |_job| {
                let running = running2.clone();
                let peak = peak2.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        );

        for i in 0..8 {
            pool.submit(load(&format!("j{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_overflow_rejects_oldest() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let gate = Arc::new(Notify::new());
        let gate2 = gate.clone();

        let pool = WorkerPool::new(
            1,
            2,
            Arc::new(move |job: QueuedJob| {
                let seen = seen2.clone();
                let gate = gate2.clone();
                async move {
                    seen.lock().push(job.load.jid.to_string());
                    gate.notified().await;
                }
                .boxed()
            }),
        );

        // j0 starts; j1, j2 queue; j3 evicts j1.
        pool.submit(load("j0"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.submit(load("j1"));
        pool.submit(load("j2"));
        pool.submit(load("j3"));

        for _ in 0..4 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let seen = seen.lock().clone();
        assert!(seen.contains(&"j0".to_string()));
        assert!(!seen.contains(&"j1".to_string()));
        assert!(seen.contains(&"j2".to_string()));
        assert!(seen.contains(&"j3".to_string()));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_drops_queued_job() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let pool = WorkerPool::new(
            1,
            8,
            Arc::new(move |job: QueuedJob| {
                let seen = seen2.clone();
                async move {
                    seen.lock().push(job.load.jid.to_string());
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                .boxed()
            }),
        );

        pool.submit(load("j0"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.submit(load("j1"));
        assert!(pool.cancel(&JobId::from_existing("j1")));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!seen.lock().contains(&"j1".to_string()));
        pool.shutdown();
    }
}
