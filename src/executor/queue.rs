//! Shared job queue

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{Job, Registry};

/// FIFO of pending jobs. Clones share the queue.
#[derive(Clone, Debug, Default)]
pub struct JobQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// One job per unit, in discovery order
    pub fn from_registry(registry: &Registry) -> Self {
        let queue = Self::new();
        for unit in registry.units() {
            queue.push(Job::new(unit.name()));
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, job: Job) {
        self.lock().push_back(job);
    }

    /// Next job, `None` once drained
    pub fn pop(&self) -> Option<Job> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
