//! Priority queue of runnable tasks, plus the service that owns it on the
//! bus.

mod service;

pub use service::QueueService;

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use foreman_db::models::Task;
use foreman_db::{Error, ErrorCode, Result};

/// Three FIFO sub-queues keyed by priority tier; P0 dequeues first.
///
/// The queue itself is not persisted: the rows with `status = queued` are
/// the durable truth, and recovery rebuilds this structure from them.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    capacity: Option<usize>,
}

struct Inner {
    tiers: [VecDeque<Task>; 3],
    ids: HashSet<String>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                ids: HashSet::new(),
            }),
            capacity,
        }
    }

    /// Append the task to its priority tier.
    ///
    /// Returns `Ok(false)` when the id is already queued; fails with
    /// `QueueFull` when the capacity is reached.
    pub fn enqueue(&self, task: Task) -> Result<bool> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.ids.contains(&task.id) {
            return Ok(false);
        }
        if let Some(cap) = self.capacity {
            if inner.ids.len() >= cap {
                return Err(Error::new(
                    ErrorCode::QueueFull,
                    format!("queue capacity of {cap} reached"),
                ));
            }
        }
        inner.ids.insert(task.id.clone());
        let tier = task.priority.index();
        inner.tiers[tier].push_back(task);
        Ok(true)
    }

    /// Pop the head of the highest-priority non-empty tier.
    pub fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        for tier in 0..inner.tiers.len() {
            if let Some(task) = inner.tiers[tier].pop_front() {
                inner.ids.remove(&task.id);
                return Some(task);
            }
        }
        None
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .ids
            .contains(task_id)
    }

    /// Remove a task by id wherever it sits. Returns whether it was queued.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if !inner.ids.remove(task_id) {
            return false;
        }
        for tier in inner.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|t| t.id == task_id) {
                tier.remove(pos);
                break;
            }
        }
        true
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        for tier in inner.tiers.iter_mut() {
            tier.clear();
        }
        inner.ids.clear();
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
