use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ActiveJob {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// In-memory set of jobs that currently have a worker.
///
/// The mutex is never held across an await point.
#[derive(Default)]
pub struct ActiveJobs {
    jobs: Mutex<HashMap<String, ActiveJob>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Claims `job_id` for a new worker. Returns false if it is already claimed.
    pub fn start(&self, job_id: &str, token: CancellationToken) -> bool {
        let mut jobs = self.lock();
        if jobs.contains_key(job_id) {
            return false;
        }
        jobs.insert(
            job_id.to_string(),
            ActiveJob {
                token,
                handle: None,
            },
        );
        true
    }

    /// Stores the worker's handle. Returns false when the worker already
    /// finished and removed its entry.
    pub fn attach(&self, job_id: &str, handle: JoinHandle<()>) -> bool {
        match self.lock().get_mut(job_id) {
            Some(entry) => {
                entry.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, job_id: &str) {
        if self.lock().remove(job_id).is_some() {
            debug!(%job_id, "job removed from active set");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cancels every worker, waits up to `grace` for them, then aborts the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let drained: Vec<(String, ActiveJob)> = self.lock().drain().collect();
        if drained.is_empty() {
            return;
        }

        for (_, job) in &drained {
            job.token.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        for (job_id, job) in drained {
            let Some(mut handle) = job.handle else {
                continue;
            };
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(%job_id, "worker did not stop in time; aborting");
                handle.abort();
                // Resolves once the aborted task has been dropped
                let _ = handle.await;
            }
        }
    }
}
