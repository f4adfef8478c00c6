//! In-process job queue pairing waiting jobs with idle workers.
//!
//! All four pools live under one mutex. Pairing happens inside the critical
//! section; the builds it starts are spawned only after the lock is released.
//! The queue is idle whenever no worker is busy, even if jobs are still
//! waiting for one.

use artisan_core::{Job, ResourceId, Worker};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::builder::{BuildResult, Builder};

struct Assignment {
    job_id: ResourceId,
    job: Arc<dyn Job>,
    worker_id: ResourceId,
    worker: Arc<dyn Worker>,
}

#[derive(Default)]
struct QueueState {
    idle_jobs: VecDeque<(ResourceId, Arc<dyn Job>)>,
    /// Busy job id to the worker running it.
    busy_jobs: HashMap<ResourceId, ResourceId>,
    idle_workers: VecDeque<(ResourceId, Arc<dyn Worker>)>,
    busy_workers: HashMap<ResourceId, Arc<dyn Worker>>,
    paused: bool,
    /// Arrivals or completions happened while paused.
    deferred: bool,
    results: Vec<BuildResult>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.busy_workers.is_empty()
    }

    /// FIFO pairing pass. Moves every pair it makes into the busy pools.
    fn pair(&mut self) -> Vec<Assignment> {
        if self.paused {
            self.deferred = true;
            return Vec::new();
        }

        let mut assignments = Vec::new();
        while !self.idle_jobs.is_empty() && !self.idle_workers.is_empty() {
            let (Some((job_id, job)), Some((worker_id, worker))) =
                (self.idle_jobs.pop_front(), self.idle_workers.pop_front())
            else {
                break;
            };
            self.busy_jobs.insert(job_id, worker_id);
            self.busy_workers.insert(worker_id, worker.clone());
            assignments.push(Assignment {
                job_id,
                job,
                worker_id,
                worker,
            });
        }
        assignments
    }
}

struct Shared {
    builder: Arc<Builder>,
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pair under the lock, publish idleness, then start builds unlocked.
    fn schedule(self: &Arc<Self>, change: impl FnOnce(&mut QueueState) -> bool) {
        let assignments = {
            let mut state = self.lock();
            let assignments = if change(&mut state) {
                state.pair()
            } else {
                Vec::new()
            };
            self.idle.send_replace(state.is_idle());
            assignments
        };
        for assignment in assignments {
            self.start(assignment);
        }
    }

    fn start(self: &Arc<Self>, assignment: Assignment) {
        info!(
            job_id = %assignment.job_id,
            job = assignment.job.name(),
            worker = assignment.worker.host(),
            "Starting job"
        );
        let shared = self.clone();
        tokio::spawn(async move {
            let result = shared
                .builder
                .run(assignment.job.as_ref(), assignment.worker.as_ref())
                .await;
            shared.finished(assignment.job_id, assignment.worker_id, result);
        });
    }

    fn finished(self: &Arc<Self>, job_id: ResourceId, worker_id: ResourceId, result: BuildResult) {
        debug!(job_id = %job_id, success = result.success, "Job finished");
        self.schedule(|state| {
            state.busy_jobs.remove(&job_id);
            if let Some(worker) = state.busy_workers.remove(&worker_id) {
                if worker.closed() {
                    info!(worker = worker.host(), "Dropping closed worker");
                } else {
                    state.idle_workers.push_back((worker_id, worker));
                }
            }
            state.results.push(result);
            true
        });
    }
}

/// FIFO queue of jobs and workers.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(builder: Arc<Builder>) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                builder,
                state: Mutex::new(QueueState::default()),
                idle,
            }),
        }
    }

    /// Queue a job; it starts as soon as a worker is free.
    pub fn add_job(&self, job: Arc<dyn Job>) -> ResourceId {
        let id = ResourceId::new();
        debug!(job_id = %id, job = job.name(), "Job queued");
        self.shared.schedule(|state| {
            state.idle_jobs.push_back((id, job));
            true
        });
        id
    }

    pub fn add_worker(&self, worker: Arc<dyn Worker>) -> ResourceId {
        let id = ResourceId::new();
        debug!(worker_id = %id, worker = worker.host(), "Worker added");
        self.shared.schedule(|state| {
            state.idle_workers.push_back((id, worker));
            true
        });
        id
    }

    /// Stop pairing. Running jobs continue; arrivals wait for `resume_queue`.
    pub fn pause_queue(&self) {
        self.shared.lock().paused = true;
        info!("Queue paused");
    }

    /// Resume pairing, running one pass if anything arrived while paused.
    pub fn resume_queue(&self) {
        info!("Queue resumed");
        self.shared.schedule(|state| {
            state.paused = false;
            std::mem::take(&mut state.deferred)
        });
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// No worker is busy.
    pub fn is_idle(&self) -> bool {
        *self.shared.idle.borrow()
    }

    /// Wait until no worker is busy. Returns `false` if `timeout` passed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut idle = self.shared.idle.subscribe();
        let became_idle = idle.wait_for(|idle| *idle);
        match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, became_idle).await, Ok(Ok(_))),
            None => became_idle.await.is_ok(),
        }
    }

    pub fn idle_jobs(&self) -> usize {
        self.shared.lock().idle_jobs.len()
    }

    pub fn busy_jobs(&self) -> usize {
        self.shared.lock().busy_jobs.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.shared.lock().idle_workers.len()
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.lock().busy_workers.len()
    }

    /// Results of every finished build, in completion order.
    pub fn results(&self) -> Vec<BuildResult> {
        self.shared.lock().results.clone()
    }

    /// Remove and return the results collected so far.
    pub fn take_results(&self) -> Vec<BuildResult> {
        std::mem::take(&mut self.shared.lock().results)
    }
}
