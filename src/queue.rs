//! Per-printer job queue: ordered, concurrently mutated by the worker and
//! the request layer.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    errors::{Error, Result},
    job::{Job, JobSnapshot},
};

/// An ordered collection of jobs owned by one printer. Insertion order is
/// print order except where explicitly reordered; a job id appears at most
/// once. Clones share the same underlying queue.
///
/// Every operation takes the internal lock for its whole duration, so the
/// worker's peek and an external delete/bump can interleave but never
/// corrupt ordering. The head may legally disappear between a worker's
/// peek and its next look; callers treat that as "nothing to do".
#[derive(Clone, Debug, Default)]
pub struct Queue {
    jobs: Arc<Mutex<VecDeque<Arc<Job>>>>,
}

impl Queue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Arc<Job>>> {
        self.jobs.lock().expect("queue poisoned")
    }

    /// Append a job. Errors if the id is already queued.
    pub fn add_to_back(&self, job: Arc<Job>) -> Result<()> {
        let mut jobs = self.jobs();
        if jobs.iter().any(|queued| queued.id() == job.id()) {
            return Err(Error::Duplicate(format!("job {}", job.id())));
        }
        jobs.push_back(job);
        Ok(())
    }

    /// Prepend a job. Errors if the id is already queued.
    pub fn add_to_front(&self, job: Arc<Job>) -> Result<()> {
        let mut jobs = self.jobs();
        if jobs.iter().any(|queued| queued.id() == job.id()) {
            return Err(Error::Duplicate(format!("job {}", job.id())));
        }
        jobs.push_front(job);
        Ok(())
    }

    /// The next job to execute, without removing it.
    pub fn peek_next(&self) -> Option<Arc<Job>> {
        self.jobs().front().cloned()
    }

    /// Remove the job with this id wherever it sits. Returns whether
    /// anything was removed. Legal while that job is mid-execution: the
    /// in-flight line finishes, but the job is never re-read as "next".
    pub fn delete_job(&self, job_id: i64) -> bool {
        let mut jobs = self.jobs();
        match jobs.iter().position(|job| job.id() == job_id) {
            Some(index) => {
                jobs.remove(index);
                true
            }
            None => false,
        }
    }

    /// Move a job one position toward the front (`to_front`) or the back.
    /// Silent no-op if the job is absent or already at that extreme; jobs
    /// not involved keep their relative order.
    pub fn bump(&self, to_front: bool, job_id: i64) {
        let mut jobs = self.jobs();
        let Some(index) = jobs.iter().position(|job| job.id() == job_id) else {
            return;
        };
        if to_front && index > 0 {
            jobs.swap(index, index - 1);
        } else if !to_front && index + 1 < jobs.len() {
            jobs.swap(index, index + 1);
        }
    }

    /// Move a job all the way to the front (`to_front`) or the back.
    /// Silent no-op if the job is absent.
    pub fn bump_extreme(&self, to_front: bool, job_id: i64) {
        let mut jobs = self.jobs();
        let Some(index) = jobs.iter().position(|job| job.id() == job_id) else {
            return;
        };
        let Some(job) = jobs.remove(index) else {
            return;
        };
        if to_front {
            jobs.push_front(job);
        } else {
            jobs.push_back(job);
        }
    }

    /// Number of queued jobs.
    pub fn size(&self) -> usize {
        self.jobs().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// The queued jobs, front first.
    pub fn contents(&self) -> Vec<Arc<Job>> {
        self.jobs().iter().cloned().collect()
    }

    /// Reporting view of the queue, front first.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs().iter().map(|job| job.snapshot()).collect()
    }
}
