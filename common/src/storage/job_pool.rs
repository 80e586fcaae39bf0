use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

use super::types::job::Job;

pub const DEFAULT_POOL_SIZE: usize = 16;

/// Free list of reusable job records.
///
/// Records handed out by [`JobPool::acquire`] come back automatically when the
/// [`PooledJob`] guard is dropped, on every path.
#[derive(Debug)]
pub struct JobPool {
    free: Mutex<Vec<Job>>,
    capacity: usize,
}

impl JobPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let free = std::iter::repeat_with(Job::default).take(capacity).collect();

        Arc::new(Self {
            free: Mutex::new(free),
            capacity,
        })
    }

    /// Hands out a zeroed record, allocating a fresh one when the pool is empty.
    pub fn acquire(self: &Arc<Self>) -> PooledJob {
        let job = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();

        PooledJob {
            job,
            pool: Arc::clone(self),
        }
    }

    /// Clears `job` and puts it back. Records beyond capacity are dropped.
    pub fn release(&self, mut job: Job) {
        job.reset();

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(job);
        }
    }

    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A job record borrowed from a [`JobPool`].
#[derive(Debug)]
pub struct PooledJob {
    job: Job,
    pool: Arc<JobPool>,
}

impl PooledJob {
    /// Replaces the record's contents with `loaded`, keeping pooled buffers.
    pub fn fill(&mut self, loaded: Job) {
        self.job.load_from(loaded);
    }
}

impl Deref for PooledJob {
    type Target = Job;

    fn deref(&self) -> &Self::Target {
        &self.job
    }
}

impl DerefMut for PooledJob {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.job
    }
}

impl Drop for PooledJob {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.job));
    }
}
