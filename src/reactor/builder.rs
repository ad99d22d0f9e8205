use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::reactor::{IoHandle, IoManager, Reactor};
use crate::scheduler::{Flavor, Handle, Inner};
use crate::timer::{Clock, SystemClock, TimerManager};

pub struct IoManagerBuilder {
    threads: usize,
    use_caller: bool,
    name: String,
    max_events: usize,
    max_wait: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for IoManagerBuilder {
    fn default() -> Self {
        IoManagerBuilder {
            threads: 1,
            use_caller: true,
            name: "IOManager".to_string(),
            max_events: 256,
            max_wait: Duration::from_millis(3000),
            clock: Arc::new(SystemClock),
        }
    }
}

impl IoManagerBuilder {
    pub fn new() -> Self {
        IoManagerBuilder::default()
    }

    /// Worker count, including the calling thread when `use_caller` is set.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Events fetched per `epoll_wait`.
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Upper bound on a single `epoll_wait`, whatever the next timer says.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[tracing::instrument(level = "trace", skip(self), fields(name = %self.name, threads = self.threads))]
    pub fn build(self) -> io::Result<IoManager> {
        let reactor = Reactor::new(self.max_events, self.max_wait, TimerManager::new(self.clock))?;
        let inner = Inner::create(
            self.threads,
            self.use_caller,
            &self.name,
            Flavor::Reactor(reactor),
        );
        let iom = IoManager {
            handle: IoHandle {
                handle: Handle { inner },
            },
        };
        iom.start()?;
        tracing::debug!(
            "IoManagerBuilder::build name: {} threads: {} use_caller: {}",
            self.name,
            self.threads,
            self.use_caller
        );
        Ok(iom)
    }
}
