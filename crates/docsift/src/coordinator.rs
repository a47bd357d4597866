use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use docsift_core::{CancellationToken, PipelineError, Result};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info};

use crate::progress::ProgressSink;
use crate::report::JobReport;

const MAX_WORKERS: usize = 8;

/// What a running job gets from the coordinator.
pub struct JobContext {
    pub cancel: CancellationToken,
    pub sink: Arc<dyn ProgressSink>,
}

pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Runs to completion or until `ctx.cancel` is observed.
    fn run(&self, ctx: &JobContext) -> JobReport;
}

struct Registration {
    generation: u64,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<String, Registration>>>;

/// Waits for a job started through [`WorkerCoordinator::start`].
pub struct JobHandle {
    key: String,
    cancel: CancellationToken,
    rx: Receiver<JobReport>,
}

impl JobHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the job reports. `None` only if the pool was torn down
    /// before the job ran.
    pub fn wait(self) -> Option<JobReport> {
        self.rx.recv().ok()
    }

    pub fn try_report(&self) -> Option<JobReport> {
        self.rx.try_recv().ok()
    }
}

/// Registry of in-flight jobs over an explicitly sized pool.
pub struct WorkerCoordinator {
    pool: ThreadPool,
    registry: Registry,
    generation: AtomicU64,
}

impl WorkerCoordinator {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.clamp(1, MAX_WORKERS);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("docsift-worker-{idx}"))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build worker pool: {e}")))?;
        debug!(workers, "worker pool ready");
        Ok(Self {
            pool,
            registry: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        })
    }

    /// Registers and enqueues `worker` under `key`. A job already registered
    /// under the same key is cancelled and replaced.
    pub fn start(
        &self,
        key: impl Into<String>,
        worker: Arc<dyn Worker>,
        sink: Arc<dyn ProgressSink>,
    ) -> JobHandle {
        let key = key.into();
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut registry = self.registry.lock();
            let previous = registry.insert(
                key.clone(),
                Registration {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                info!(key = %key, "replacing running job");
                previous.cancel.cancel();
            }
        }
        let (tx, rx) = mpsc::channel();
        let registry = Arc::clone(&self.registry);
        let job_key = key.clone();
        let ctx = JobContext {
            cancel: cancel.clone(),
            sink,
        };
        self.pool.spawn(move || {
            let report = if ctx.cancel.is_cancelled() {
                JobReport::cancelled_before_start(worker.name())
            } else {
                catch_unwind(AssertUnwindSafe(|| worker.run(&ctx))).unwrap_or_else(|_| {
                    error!(key = %job_key, "worker panicked");
                    let mut report = JobReport {
                        job: worker.name().to_string(),
                        ..JobReport::default()
                    };
                    report.record_failure(job_key.clone(), "worker panicked");
                    report
                })
            };
            ctx.sink.on_finished(&report);
            {
                let mut registry = registry.lock();
                if registry
                    .get(&job_key)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    registry.remove(&job_key);
                }
            }
            let _ = tx.send(report);
        });
        JobHandle { key, cancel, rx }
    }

    /// Requests cooperative cancellation. Returns false for unknown keys.
    pub fn cancel(&self, key: &str) -> bool {
        match self.registry.lock().get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels and deregisters every job.
    pub fn clear(&self) {
        let drained: Vec<(String, Registration)> = self.registry.lock().drain().collect();
        for (key, entry) in drained {
            debug!(key = %key, "cancelling on clear");
            entry.cancel.cancel();
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.registry.lock().contains_key(key)
    }

    pub fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for WorkerCoordinator {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Spins until cancelled, then reports cancellation.
    struct UntilCancelled {
        started: Arc<AtomicBool>,
    }

    impl Worker for UntilCancelled {
        fn name(&self) -> &str {
            "spin"
        }

        fn run(&self, ctx: &JobContext) -> JobReport {
            self.started.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(10);
            while !ctx.cancel.is_cancelled() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let mut report = JobReport::default();
            report.job = "spin".into();
            report.cancelled = ctx.cancel.is_cancelled();
            report
        }
    }

    struct Quick;

    impl Worker for Quick {
        fn name(&self) -> &str {
            "quick"
        }

        fn run(&self, _ctx: &JobContext) -> JobReport {
            let mut report = JobReport::default();
            report.job = "quick".into();
            report.succeeded = 1;
            report
        }
    }

    struct Panics;

    impl Worker for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn run(&self, _ctx: &JobContext) -> JobReport {
            panic!("bug");
        }
    }

    fn wait_until(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn finished_jobs_deregister() {
        let coordinator = WorkerCoordinator::new(2).unwrap();
        let handle = coordinator.start("a", Arc::new(Quick), Arc::new(NullSink));
        let report = handle.wait().unwrap();
        assert_eq!(report.succeeded, 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.is_running("a") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!coordinator.is_running("a"));
    }

    #[test]
    fn cancel_unknown_key_is_false() {
        let coordinator = WorkerCoordinator::new(1).unwrap();
        assert!(!coordinator.cancel("missing"));
    }

    #[test]
    fn cancel_is_cooperative() {
        let coordinator = WorkerCoordinator::new(1).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let handle = coordinator.start(
            "job",
            Arc::new(UntilCancelled {
                started: started.clone(),
            }),
            Arc::new(NullSink),
        );
        wait_until(&started);
        assert!(coordinator.cancel("job"));
        assert!(handle.wait().unwrap().cancelled);
    }

    #[test]
    fn same_key_replaces_previous_job() {
        let coordinator = WorkerCoordinator::new(2).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let first = coordinator.start(
            "dup",
            Arc::new(UntilCancelled {
                started: started.clone(),
            }),
            Arc::new(NullSink),
        );
        wait_until(&started);
        let second = coordinator.start("dup", Arc::new(Quick), Arc::new(NullSink));
        assert!(first.wait().unwrap().cancelled);
        assert_eq!(second.wait().unwrap().succeeded, 1);
        assert_eq!(coordinator.running().len(), 0);
    }

    #[test]
    fn clear_cancels_queued_and_running_jobs() {
        let coordinator = WorkerCoordinator::new(1).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let running = coordinator.start(
            "one",
            Arc::new(UntilCancelled {
                started: started.clone(),
            }),
            Arc::new(NullSink),
        );
        wait_until(&started);
        let queued = coordinator.start(
            "two",
            Arc::new(UntilCancelled {
                started: Arc::new(AtomicBool::new(false)),
            }),
            Arc::new(NullSink),
        );
        coordinator.clear();
        assert!(coordinator.running().is_empty());
        assert!(running.wait().unwrap().cancelled);
        assert!(queued.wait().unwrap().cancelled);
    }

    #[test]
    fn panicking_worker_reports_failure() {
        let coordinator = WorkerCoordinator::new(1).unwrap();
        let report = coordinator
            .start("p", Arc::new(Panics), Arc::new(NullSink))
            .wait()
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].1, "worker panicked");
    }
}
