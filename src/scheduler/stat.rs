use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a scheduler over its lifetime.
#[derive(Debug, Default)]
pub struct SchedulerStat {
    scheduled: AtomicU64,
    executed: AtomicU64,
    yielded: AtomicU64,
}

impl SchedulerStat {
    pub fn new() -> Self {
        SchedulerStat::default()
    }

    pub(crate) fn add_scheduled(&self, n: u64) {
        self.scheduled.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_yielded(&self) {
        self.yielded.fetch_add(1, Ordering::Relaxed);
    }

    /// Work items pushed onto the queue.
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Coroutines and callbacks that ran to `Terminate` or `Except`.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Times a task switched back to the run loop without finishing.
    pub fn yielded(&self) -> u64 {
        self.yielded.load(Ordering::Relaxed)
    }
}
