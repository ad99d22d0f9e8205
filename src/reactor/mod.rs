//! epoll reactor layered on the scheduler.
//!
//! An [`IoManager`] is a scheduler whose idle coroutine waits in
//! `epoll_wait`. Code running in a task coroutine registers interest in an fd
//! with [`IoHandle::add_event`], suspends, and is scheduled again when the fd
//! becomes ready or the event is cancelled. Timers share the same wait: the
//! `epoll_wait` timeout is the time until the next deadline, clamped to
//! `max_wait`.
//!
//! Workers sleeping in `epoll_wait` are woken through a self-pipe whose read
//! end is registered under [`TICKLE_TOKEN`].

pub mod builder;

use std::fmt;
use std::io;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::coroutine::{Callback, Coroutine, State};
use crate::hook::originals::originals;
use crate::logging::rt_assert;
use crate::scheduler::{Handle, Inner, Task};
use crate::timer::{Timer, TimerManager};

pub use self::builder::IoManagerBuilder;

/// epoll user data marking the self-pipe.
pub const TICKLE_TOKEN: u64 = u64::MAX;

const INITIAL_CONTEXTS: usize = 32;

/// Readiness an fd can be waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

enum Waiter {
    Coroutine(Arc<Coroutine>),
    Callback(Callback),
}

#[derive(Default)]
struct EventSlot {
    // Scheduler current at registration; the reactor's own when absent.
    scheduler: Option<Weak<Inner>>,
    waiter: Option<Waiter>,
}

impl EventSlot {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.waiter.is_none()
    }
}

#[derive(Default)]
struct FdState {
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

impl FdState {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }
}

/// Reactor half of an [`IoManager`], stored in the scheduler's flavor.
pub(crate) struct Reactor {
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: TimerManager,
    max_events: usize,
    max_wait: Duration,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl Reactor {
    pub(crate) fn new(max_events: usize, max_wait: Duration, timers: TimerManager) -> io::Result<Reactor> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let mut fds = [0; 2];
        if let Err(e) = cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }) {
            unsafe { (originals().close)(epfd) };
            return Err(e);
        }

        let reactor = Reactor {
            epfd,
            tickle_fds: fds,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(
                (0..INITIAL_CONTEXTS)
                    .map(|fd| Arc::new(FdContext::new(fd as RawFd)))
                    .collect(),
            ),
            timers,
            max_events: max_events.max(1),
            max_wait,
        };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        cvt(unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) })?;
        tracing::debug!("Reactor::new epfd: {} tickle_fds: {:?}", epfd, fds);
        Ok(reactor)
    }

    pub(crate) fn timers(&self) -> &TimerManager {
        &self.timers
    }

    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        let index = fd as usize;
        if let Some(ctx) = self.contexts.read().get(index) {
            return ctx.clone();
        }
        let mut contexts = self.contexts.write();
        if contexts.len() <= index {
            let len = (index * 3 / 2).max(index + 1);
            let start = contexts.len();
            contexts.extend((start..len).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
            tracing::trace!("Reactor::context grow to {}", len);
        }
        contexts[index].clone()
    }

    fn existing(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                err
            );
            return Err(err);
        }
        Ok(())
    }

    fn add_event(&self, fd: RawFd, event: Event, callback: Option<Callback>) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let ctx = self.context(fd);
        let mut state = ctx.state.lock();
        rt_assert!(
            state.events & event.bits() == 0,
            "add_event fd={} event={:?} already registered events={:#x}",
            fd,
            event,
            state.events
        );

        let op = if state.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, state.events | event.bits())?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events |= event.bits();
        let slot = state.slot_mut(event);
        rt_assert!(slot.is_empty(), "event slot fd={} {:?} not empty", fd, event);
        slot.scheduler = Handle::current().map(|h| Arc::downgrade(&h.inner));
        slot.waiter = Some(match callback {
            Some(callback) => Waiter::Callback(callback),
            None => {
                let co = Coroutine::current();
                rt_assert!(
                    !co.is_root() && co.state() == State::Exec,
                    "add_event without callback outside a running coroutine"
                );
                Waiter::Coroutine(co)
            }
        });
        tracing::trace!("Reactor::add_event fd: {} event: {:?}", fd, event);
        Ok(())
    }

    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.existing(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events & event.bits() == 0 {
            return false;
        }
        let left = state.events & !event.bits();
        if self.ctl(Self::op_for(left), fd, left).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        *state.slot_mut(event) = EventSlot::default();
        true
    }

    fn cancel_event(&self, owner: &Arc<Inner>, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.existing(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events & event.bits() == 0 {
            return false;
        }
        let left = state.events & !event.bits();
        if self.ctl(Self::op_for(left), fd, left).is_err() {
            return false;
        }
        self.trigger(owner, &mut state, event);
        true
    }

    fn cancel_all(&self, owner: &Arc<Inner>, fd: RawFd) -> bool {
        let Some(ctx) = self.existing(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events == 0 {
            return false;
        }
        if self.ctl(libc::EPOLL_CTL_DEL, fd, 0).is_err() {
            return false;
        }
        if state.events & Event::Read.bits() != 0 {
            self.trigger(owner, &mut state, Event::Read);
        }
        if state.events & Event::Write.bits() != 0 {
            self.trigger(owner, &mut state, Event::Write);
        }
        rt_assert!(state.events == 0, "cancel_all fd={} left {:#x}", fd, state.events);
        true
    }

    fn op_for(left: u32) -> libc::c_int {
        if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        }
    }

    /// Clear `event` and hand its waiter to the scheduler it was bound on.
    fn trigger(&self, owner: &Arc<Inner>, state: &mut FdState, event: Event) {
        rt_assert!(state.events & event.bits() != 0, "trigger unregistered {:?}", event);
        state.events &= !event.bits();
        let slot = std::mem::take(state.slot_mut(event));
        let scheduler = slot
            .scheduler
            .and_then(|w| w.upgrade())
            .unwrap_or_else(|| owner.clone());
        match slot.waiter {
            Some(Waiter::Coroutine(co)) => {
                scheduler.schedule(Task::Coroutine(co), None);
            }
            Some(Waiter::Callback(cb)) => {
                scheduler.schedule(Task::Callback(cb), None);
            }
            None => {}
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn tickle(&self, inner: &Inner) {
        if inner.idle_threads() == 0 {
            return;
        }
        let byte = b'T';
        let rt = unsafe { (originals().write)(self.tickle_fds[1], (&byte as *const u8).cast(), 1) };
        // A full pipe already holds a pending wakeup.
        if rt != 1 {
            tracing::trace!("Reactor::tickle write returned {}", rt);
        }
    }

    pub(crate) fn stopping(&self, inner: &Inner) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && inner.base_stopping()
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { (originals().read)(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Idle coroutine body: wait for fd events and timers until stopping.
    pub(crate) fn idle(&self, inner: &Arc<Inner>) {
        tracing::debug!("Reactor::idle start");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let max_wait = u64::try_from(self.max_wait.as_millis()).unwrap_or(u64::MAX);

        loop {
            let next = self.timers.next_timer();
            if next.is_none()
                && self.pending.load(Ordering::SeqCst) == 0
                && inner.base_stopping()
            {
                tracing::debug!("Reactor::idle stopping exit");
                break;
            }

            let timeout = wait_timeout(next, max_wait);
            let n = loop {
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout,
                    )
                };
                if rt < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    tracing::error!("epoll_wait({}) failed: {}", self.epfd, err);
                    break 0;
                }
                break rt as usize;
            };

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                inner.schedule_batch(expired.into_iter().map(|cb| Task::callback(move || cb())));
            }

            for ev in &events[..n] {
                let (flags, token) = (ev.events, ev.u64);
                if token == TICKLE_TOKEN {
                    self.drain_tickle();
                    continue;
                }
                let fd = token as RawFd;
                let Some(ctx) = self.existing(fd) else {
                    continue;
                };
                let mut state = ctx.state.lock();
                let mut flags = flags;
                if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    flags |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events;
                }
                let mut fired = 0;
                if flags & libc::EPOLLIN as u32 != 0 {
                    fired |= Event::Read.bits();
                }
                if flags & libc::EPOLLOUT as u32 != 0 {
                    fired |= Event::Write.bits();
                }
                fired &= state.events;
                if fired == 0 {
                    continue;
                }

                let left = state.events & !fired;
                if self.ctl(Self::op_for(left), ctx.fd, left).is_err() {
                    continue;
                }
                if fired & Event::Read.bits() != 0 {
                    self.trigger(inner, &mut state, Event::Read);
                }
                if fired & Event::Write.bits() != 0 {
                    self.trigger(inner, &mut state, Event::Write);
                }
            }

            Coroutine::yield_to_suspend();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let close = originals().close;
        unsafe {
            close(self.epfd);
            close(self.tickle_fds[0]);
            close(self.tickle_fds[1]);
        }
    }
}

/// Clonable handle to a running [`IoManager`].
#[derive(Clone)]
pub struct IoHandle {
    handle: Handle,
}

impl IoHandle {
    /// The `IoManager` whose worker is running on this thread.
    pub fn current() -> Option<IoHandle> {
        Handle::current().and_then(IoHandle::from_handle)
    }

    /// `None` if `handle` belongs to a plain scheduler.
    pub fn from_handle(handle: Handle) -> Option<IoHandle> {
        handle.inner.reactor()?;
        Some(IoHandle { handle })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn reactor(&self) -> &Reactor {
        match self.handle.inner.reactor() {
            Some(reactor) => reactor,
            None => unreachable!("IoHandle always wraps a reactor scheduler"),
        }
    }

    /// Wait for `event` on `fd`. Without a callback the running coroutine is
    /// bound and must suspend itself afterwards.
    ///
    /// Registering an event that is already registered on `fd` panics and
    /// leaves the existing registration in place. The panic is catchable: in
    /// a coroutine body the trampoline catches it and the coroutine ends in
    /// [`State::Except`](crate::State::Except).
    #[tracing::instrument(level = "trace", skip(self, callback))]
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Callback>) -> io::Result<()> {
        self.reactor().add_event(fd, event, callback)
    }

    /// Drop interest without waking the waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().del_event(fd, event)
    }

    /// Drop interest and schedule the waiter as if the event fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().cancel_event(&self.handle.inner, fd, event)
    }

    /// Cancel both events of `fd` and remove it from epoll.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor().cancel_all(&self.handle.inner, fd)
    }

    /// Registered events that have not fired or been removed.
    pub fn pending_events(&self) -> usize {
        self.reactor().pending.load(Ordering::SeqCst)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.reactor().timers
    }

    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers().add_timer(ms, callback, recurring)
    }

    pub fn add_condition_timer<F, G>(
        &self,
        ms: u64,
        callback: F,
        guard: Weak<G>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        G: std::any::Any + Send + Sync,
    {
        self.timers().add_condition_timer(ms, callback, guard, recurring)
    }
}

impl Deref for IoHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("name", &self.handle.name())
            .field("pending_events", &self.pending_events())
            .finish()
    }
}

/// Owning reactor scheduler. Started on construction; stopped and joined on
/// drop.
pub struct IoManager {
    handle: IoHandle,
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<IoManager> {
        IoManager::builder()
            .threads(threads)
            .use_caller(use_caller)
            .name(name)
            .build()
    }

    pub fn builder() -> IoManagerBuilder {
        IoManagerBuilder::new()
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }
}

impl Deref for IoManager {
    type Target = IoHandle;

    fn deref(&self) -> &IoHandle {
        &self.handle
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

/// `epoll_wait` timeout for the next timer, bounded by `max_wait` and by
/// what a `c_int` holds.
fn wait_timeout(next: Option<u64>, max_wait: u64) -> libc::c_int {
    let ms = next.map_or(max_wait, |ms| ms.min(max_wait));
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn wait_timeout_is_clamped() {
        assert_eq!(wait_timeout(None, 3000), 3000);
        assert_eq!(wait_timeout(Some(10), 3000), 10);
        assert_eq!(wait_timeout(Some(5000), 3000), 3000);
        assert_eq!(wait_timeout(None, u64::MAX), libc::c_int::MAX);
        assert_eq!(wait_timeout(Some(1 << 40), 1 << 41), libc::c_int::MAX);
    }

    #[test]
    fn huge_max_wait_still_stops() {
        let iom = IoManager::builder()
            .threads(1)
            .use_caller(false)
            .name("reactor_huge_wait")
            .max_wait(Duration::from_secs(u64::MAX))
            .build()
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.schedule(Task::callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_fires_on_readiness() {
        let iom = IoManager::new(1, false, "reactor_cb").unwrap();
        let (r, w) = pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            Event::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(iom.pending_events(), 1);

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
        drop(iom);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn del_event_does_not_wake() {
        let iom = IoManager::new(1, false, "reactor_del").unwrap();
        let (r, w) = pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            Event::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert!(iom.del_event(r, Event::Read));
        assert!(!iom.del_event(r, Event::Read));
        assert_eq!(iom.pending_events(), 0);
        drop(iom);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn cancel_event_triggers_callback() {
        let iom = IoManager::new(1, false, "reactor_cancel").unwrap();
        let (r, w) = pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            Event::Read,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert!(iom.cancel_event(r, Event::Read));
        assert!(!iom.cancel_event(r, Event::Read));
        drop(iom);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn context_table_grows_past_initial_size() {
        let iom = IoManager::new(1, false, "reactor_grow").unwrap();
        let reactor = iom.reactor();
        let ctx = reactor.context(100);
        assert_eq!(ctx.fd, 100);
        assert!(reactor.contexts.read().len() >= 150);
        assert!(reactor.existing(-1).is_none());
    }
}
