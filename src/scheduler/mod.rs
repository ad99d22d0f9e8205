//! M:N cooperative scheduler.
//!
//! A scheduler owns a FIFO of work items and a set of worker threads. Each
//! worker runs the same loop: pop the first item it may run, resume it, and
//! decide from the state it comes back in whether to queue it again. With
//! nothing to do the worker resumes its idle coroutine, whose behaviour depends
//! on the [`Flavor`]: a plain scheduler spins on `yield`, a reactor waits in
//! `epoll_wait`.

pub mod stat;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use crate::coroutine::{self, Callback, Coroutine, State};
use crate::hook;
use crate::logging::rt_assert;
use crate::reactor::Reactor;

use self::stat::SchedulerStat;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Inner>>> = const { RefCell::new(None) };
}

/// Kernel thread id of the calling thread.
pub fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Something the scheduler can run.
pub enum Task {
    Coroutine(Arc<Coroutine>),
    Callback(Callback),
}

impl Task {
    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<Arc<Coroutine>> for Task {
    fn from(co: Arc<Coroutine>) -> Self {
        Task::Coroutine(co)
    }
}

impl From<Callback> for Task {
    fn from(cb: Callback) -> Self {
        Task::Callback(cb)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Coroutine(co) => f.debug_tuple("Coroutine").field(&co.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

struct WorkItem {
    task: Task,
    // None: any worker may run it.
    thread: Option<i32>,
}

/// Strategy for the idle/tickle/stopping hooks.
pub(crate) enum Flavor {
    Plain,
    Reactor(Reactor),
}

pub(crate) struct Inner {
    name: String,
    queue: Mutex<VecDeque<WorkItem>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: RwLock<Vec<i32>>,
    // Threads spawned by start(), the caller thread excluded.
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_thread: Option<i32>,
    root_coroutine: Option<Arc<Coroutine>>,
    flavor: Flavor,
    stat: SchedulerStat,
}

impl Inner {
    pub(crate) fn create(
        threads: usize,
        use_caller: bool,
        name: &str,
        flavor: Flavor,
    ) -> Arc<Inner> {
        rt_assert!(threads > 0, "scheduler {} needs at least one thread", name);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let mut thread_count = threads;
            let mut root_thread = None;
            let mut root_coroutine = None;
            let mut thread_ids = Vec::new();

            if use_caller {
                rt_assert!(
                    Handle::current().is_none(),
                    "thread already runs a scheduler"
                );
                Coroutine::current();
                thread_count -= 1;
                let weak = weak.clone();
                root_coroutine = Some(Coroutine::new_caller(
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.run();
                        }
                    },
                    0,
                ));
                let tid = thread_id();
                root_thread = Some(tid);
                thread_ids.push(tid);
            }

            if let Flavor::Reactor(reactor) = &flavor {
                let weak = weak.clone();
                reactor.timers().set_front_listener(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.tickle();
                    }
                });
            }

            Inner {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: RwLock::new(thread_ids),
                thread_count,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_thread,
                root_coroutine,
                flavor,
                stat: SchedulerStat::new(),
            }
        });

        if use_caller {
            set_current_scheduler(Some(Arc::downgrade(&inner)));
        }
        tracing::debug!(
            "Scheduler::create name: {} threads: {} use_caller: {}",
            name,
            threads,
            use_caller
        );
        inner
    }

    pub(crate) fn reactor(&self) -> Option<&Reactor> {
        match &self.flavor {
            Flavor::Reactor(reactor) => Some(reactor),
            Flavor::Plain => None,
        }
    }

    pub(crate) fn idle_threads(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn schedule(&self, task: Task, thread: Option<i32>) -> bool {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(WorkItem { task, thread });
            was_empty
        };
        self.stat.add_scheduled(1);
        if need_tickle {
            self.tickle();
        }
        need_tickle
    }

    pub(crate) fn schedule_batch<I>(&self, tasks: I) -> bool
    where
        I: IntoIterator<Item = Task>,
    {
        let (need_tickle, count) = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(|task| WorkItem { task, thread: None }));
            (was_empty && queue.len() > before, queue.len() - before)
        };
        self.stat.add_scheduled(count as u64);
        if need_tickle {
            self.tickle();
        }
        need_tickle
    }

    fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut threads = self.threads.lock();
        if !self.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stopping.store(false, Ordering::SeqCst);
        rt_assert!(threads.is_empty(), "scheduler {} started twice", self.name);

        let (tx, rx) = mpsc::channel();
        for i in 0..self.thread_count {
            let inner = self.clone();
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || {
                    let _ = tx.send(thread_id());
                    inner.run();
                })?;
            threads.push(handle);
        }
        drop(tx);

        let mut ids = self.thread_ids.write();
        ids.extend(rx.iter().take(self.thread_count));
        tracing::debug!("Scheduler::start name: {} thread_ids: {:?}", self.name, *ids);
        Ok(())
    }

    fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);
        if let Some(root) = &self.root_coroutine {
            if self.thread_count == 0
                && matches!(root.state(), State::Init | State::Terminate | State::Except)
            {
                self.stopping.store(true, Ordering::SeqCst);
                if self.stopping() {
                    self.leave_caller_thread();
                    tracing::info!("Scheduler::stop name: {} stopped", self.name);
                    return;
                }
            }
        }

        match self.root_thread {
            Some(root) => rt_assert!(
                thread_id() == root,
                "scheduler {} must be stopped on the thread that created it",
                self.name
            ),
            None => rt_assert!(
                !Handle::current().is_some_and(|h| std::ptr::eq(Arc::as_ptr(&h.inner), self)),
                "scheduler {} stopped from one of its own workers",
                self.name
            ),
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if let Some(root) = &self.root_coroutine {
            self.tickle();
            if !self.stopping() {
                root.call();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("Scheduler::stop name: {} worker panicked", self.name);
            }
        }
        self.leave_caller_thread();
        tracing::info!("Scheduler::stop name: {} stopped", self.name);
    }

    fn leave_caller_thread(&self) {
        if self.root_thread.is_some() {
            CURRENT_SCHEDULER.with(|c| {
                let mut c = c.borrow_mut();
                if c.as_ref().is_some_and(|w| std::ptr::eq(w.as_ptr(), self)) {
                    *c = None;
                }
            });
        }
    }

    /// Worker loop. Runs on a spawned thread or, with `use_caller`, inside the
    /// root coroutine of the constructing thread.
    fn run(self: &Arc<Self>) {
        tracing::debug!("Scheduler::run name: {}", self.name);
        let previous_hook = hook::is_hook_enable();
        hook::set_hook_enable(true);
        let previous_scheduler = set_current_scheduler(Some(Arc::downgrade(self)));
        let previous_main = coroutine::enter_scheduler();
        let tid = thread_id();

        let idle_coroutine = {
            let inner = self.clone();
            Coroutine::new(move || inner.idle(), 0)
        };
        let mut callback_coroutine: Option<Arc<Coroutine>> = None;

        loop {
            let mut tickle_me = false;
            let item = {
                let mut queue = self.queue.lock();
                let mut picked = None;
                let mut index = 0;
                while index < queue.len() {
                    let item = &queue[index];
                    if item.thread.is_some_and(|t| t != tid) {
                        tickle_me = true;
                        index += 1;
                        continue;
                    }
                    if let Task::Coroutine(co) = &item.task {
                        if co.state() == State::Exec {
                            index += 1;
                            continue;
                        }
                    }
                    picked = queue.remove(index);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= picked.is_some() && index < queue.len();
                picked
            };
            if tickle_me {
                self.tickle();
            }

            match item.map(|item| item.task) {
                Some(Task::Coroutine(co)) => {
                    if co.state().is_finished() {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    co.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    self.after_resume(co);
                }
                Some(Task::Callback(callback)) => {
                    let co = match callback_coroutine.take() {
                        Some(co) => {
                            co.reset_boxed(callback);
                            co
                        }
                        None => Coroutine::from_callback(callback),
                    };
                    co.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    if co.state().is_finished() {
                        self.stat.add_executed();
                        callback_coroutine = Some(co);
                    } else {
                        self.after_resume(co);
                    }
                }
                None => {
                    if idle_coroutine.state().is_finished() {
                        tracing::debug!("Scheduler::run name: {} idle coroutine finished", self.name);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_coroutine.swap_in();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    if !idle_coroutine.state().is_finished() {
                        idle_coroutine.set_state(State::Suspend);
                    }
                }
            }
        }

        drop(callback_coroutine);
        drop(idle_coroutine);
        coroutine::leave_scheduler(previous_main);
        set_current_scheduler(previous_scheduler);
        hook::set_hook_enable(previous_hook);
        tracing::debug!("Scheduler::run name: {} exit", self.name);
    }

    /// Decide what happens to a coroutine that switched back to the loop.
    fn after_resume(&self, co: Arc<Coroutine>) {
        match co.state() {
            State::Ready => {
                self.stat.add_yielded();
                self.schedule(Task::Coroutine(co), None);
            }
            State::Terminate | State::Except => self.stat.add_executed(),
            _ => {
                // Whoever will wake it (an fd event, a timer) holds its own
                // reference; ours is dropped here.
                self.stat.add_yielded();
                co.set_state(State::Suspend);
            }
        }
    }

    fn idle(self: &Arc<Self>) {
        match &self.flavor {
            Flavor::Plain => {
                tracing::trace!("Scheduler::idle name: {}", self.name);
                while !self.stopping() {
                    Coroutine::yield_to_suspend();
                }
            }
            Flavor::Reactor(reactor) => reactor.idle(self),
        }
    }

    pub(crate) fn tickle(&self) {
        match &self.flavor {
            Flavor::Plain => tracing::trace!("Scheduler::tickle name: {}", self.name),
            Flavor::Reactor(reactor) => reactor.tickle(self),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn stopping(&self) -> bool {
        match &self.flavor {
            Flavor::Plain => self.base_stopping(),
            Flavor::Reactor(reactor) => reactor.stopping(self),
        }
    }
}

fn set_current_scheduler(scheduler: Option<Weak<Inner>>) -> Option<Weak<Inner>> {
    CURRENT_SCHEDULER.with(|c| c.replace(scheduler))
}

/// Cheap clonable reference to a running scheduler.
#[derive(Clone)]
pub struct Handle {
    pub(crate) inner: Arc<Inner>,
}

impl Handle {
    /// The scheduler whose worker is running on this thread.
    pub fn current() -> Option<Handle> {
        CURRENT_SCHEDULER
            .with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
            .map(|inner| Handle { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> io::Result<()> {
        self.inner.start()
    }

    /// Drain the queue, stop the workers and join them. With `use_caller` this
    /// runs the remaining work on the calling thread, which must be the one
    /// that created the scheduler.
    pub fn stop(&self) {
        self.inner.stop()
    }

    /// Queue a task for any worker. Returns `true` if the queue was empty and
    /// idle workers were woken.
    pub fn schedule(&self, task: impl Into<Task>) -> bool {
        self.inner.schedule(task.into(), None)
    }

    /// Queue a task that only the worker with kernel thread id `thread` runs.
    pub fn schedule_on(&self, task: impl Into<Task>, thread: i32) -> bool {
        self.inner.schedule(task.into(), Some(thread))
    }

    /// Queue several tasks under one lock acquisition.
    pub fn schedule_batch<I>(&self, tasks: I) -> bool
    where
        I: IntoIterator<Item = Task>,
    {
        self.inner.schedule_batch(tasks)
    }

    /// Kernel thread ids of the participating threads.
    pub fn thread_ids(&self) -> Vec<i32> {
        self.inner.thread_ids.read().clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.inner.idle_threads() > 0
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping()
    }

    pub fn stat(&self) -> &SchedulerStat {
        &self.inner.stat
    }

    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.inner.name)
            .field("threads", &self.inner.thread_count)
            .field("root_thread", &self.inner.root_thread)
            .finish()
    }
}

/// Owning scheduler; stops and joins its workers when dropped.
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// `threads` counts the constructing thread when `use_caller` is set.
    /// Workers are spawned by [`Handle::start`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        Scheduler {
            handle: Handle {
                inner: Inner::create(threads, use_caller, name, Flavor::Plain),
            },
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callbacks_run_on_spawned_workers() {
        let scheduler = Scheduler::new(2, false, "sched_plain");
        scheduler.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = hits.clone();
            scheduler.schedule(Task::callback(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
        assert_eq!(scheduler.stat().executed(), 100);
    }

    #[test]
    fn use_caller_runs_work_on_stop() {
        let scheduler = Scheduler::new(1, true, "sched_caller");
        let caller = thread_id();
        assert!(Handle::current().is_some());
        scheduler.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            scheduler.schedule(Task::callback(move || {
                seen.lock().push((i, thread_id()));
            }));
        }
        assert!(seen.lock().is_empty());
        scheduler.stop();
        let seen = seen.lock();
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(seen.iter().all(|(_, tid)| *tid == caller));
        drop(seen);
        drop(scheduler);
        assert!(Handle::current().is_none());
    }

    #[test]
    fn yielding_coroutine_is_requeued() {
        let scheduler = Scheduler::new(1, false, "sched_yield");
        scheduler.start().unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        scheduler.schedule(Coroutine::new(
            move || {
                for _ in 0..3 {
                    s.fetch_add(1, Ordering::SeqCst);
                    Coroutine::yield_to_ready();
                }
            },
            0,
        ));
        scheduler.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert!(scheduler.stat().yielded() >= 3);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let scheduler = Scheduler::new(1, false, "sched_panic");
        scheduler.start().unwrap();
        let after = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Task::callback(|| panic!("task failure")));
        let a = after.clone();
        scheduler.schedule(Task::callback(move || {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler.stop();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
