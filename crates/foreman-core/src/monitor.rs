//! Admission control seam.
//!
//! [`ResourceMonitor`] gates worker spawning on host resources. Probing
//! CPU and memory is platform-specific; the default implementation bounds
//! the number of live workers, which is the limit that matters on a
//! single-host daemon, and leaves richer probes to alternative
//! implementations behind the same trait.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use foreman_db::Result;

#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// May another worker be spawned right now?
    async fn can_spawn_worker(&self) -> Result<bool>;

    /// Bookkeeping: a worker entered the pool.
    fn worker_started(&self);

    /// Bookkeeping: a worker left the pool.
    fn worker_stopped(&self);

    /// Current live worker count as the monitor sees it.
    fn active_workers(&self) -> usize;
}

/// Monitor that admits workers while the live count stays under a cap.
pub struct WorkerSlotMonitor {
    active: AtomicUsize,
    max_workers: usize,
}

impl WorkerSlotMonitor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max_workers,
        }
    }
}

#[async_trait]
impl ResourceMonitor for WorkerSlotMonitor {
    async fn can_spawn_worker(&self) -> Result<bool> {
        Ok(self.active.load(Ordering::SeqCst) < self.max_workers)
    }

    fn worker_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn worker_stopped(&self) {
        // Saturating decrement: recovery paths may report a stop for a
        // worker the monitor never saw start.
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_until_the_cap() {
        let monitor = WorkerSlotMonitor::new(2);
        assert!(monitor.can_spawn_worker().await.unwrap());

        monitor.worker_started();
        assert!(monitor.can_spawn_worker().await.unwrap());

        monitor.worker_started();
        assert!(!monitor.can_spawn_worker().await.unwrap());

        monitor.worker_stopped();
        assert!(monitor.can_spawn_worker().await.unwrap());
        assert_eq!(monitor.active_workers(), 1);
    }

    #[tokio::test]
    async fn stop_without_start_does_not_underflow() {
        let monitor = WorkerSlotMonitor::new(1);
        monitor.worker_stopped();
        assert_eq!(monitor.active_workers(), 0);
        assert!(monitor.can_spawn_worker().await.unwrap());
    }
}
