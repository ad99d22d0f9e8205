//! Stackful coroutines.
//!
//! A [`Coroutine`] owns a stack and a saved machine context. Every OS thread
//! additionally gets an implicit root coroutine, created on first use of
//! [`Coroutine::current`], that stands for the thread's native stack.
//!
//! Two resume pairs exist:
//!
//! * [`Coroutine::swap_in`] / [`Coroutine::swap_out`] switch relative to the
//!   scheduler's main coroutine for this thread. This is what the run loop uses.
//! * [`Coroutine::call`] / [`Coroutine::back`] switch relative to the thread
//!   root. The use-caller scheduler coroutine runs this way, and so can code
//!   that drives coroutines by hand.
//!
//! A panic inside a coroutine body never crosses a stack switch: the entry
//! trampoline catches it, logs it, and leaves the coroutine in
//! [`State::Except`].

pub mod context;
pub mod stack;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::{Config, ConfigVar};
use crate::logging::{rt_abort, rt_assert};

use self::context::{Context, ExecutionContext};
use self::stack::Stack;

/// Default stack size when `coroutine.stack_size` is not configured.
pub const DEFAULT_STACK_SIZE: u32 = 128 * 1024;

/// Body of a coroutine or a scheduled callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Coroutine lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init = 0,
    Ready = 1,
    Exec = 2,
    Suspend = 3,
    Terminate = 4,
    Except = 5,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Suspend,
            4 => State::Terminate,
            _ => State::Except,
        }
    }

    /// `Terminate` or `Except`.
    pub fn is_finished(self) -> bool {
        matches!(self, State::Terminate | State::Except)
    }
}

/// Where control goes once the body has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Back to the scheduler main coroutine of the running thread.
    Worker,
    /// Back to the thread root; used for the one coroutine that runs a
    /// scheduler loop on the constructing thread.
    Caller,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static TOTAL: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Cell<*const Coroutine> = const { Cell::new(ptr::null()) };
    static SCHEDULER_MAIN: Cell<*const Coroutine> = const { Cell::new(ptr::null()) };
    static THREAD_COUNT: Cell<u64> = const { Cell::new(0) };
    static THREAD_ROOT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

fn stack_size_var() -> Option<&'static Arc<ConfigVar<u32>>> {
    static VAR: OnceLock<Option<Arc<ConfigVar<u32>>>> = OnceLock::new();
    VAR.get_or_init(|| {
        Config::lookup(
            "coroutine.stack_size",
            DEFAULT_STACK_SIZE,
            "coroutine stack size",
        )
        .ok()
    })
    .as_ref()
}

/// Stack size used when a coroutine is created with `stack_size == 0`.
pub fn default_stack_size() -> usize {
    stack_size_var().map_or(DEFAULT_STACK_SIZE, |var| var.value()) as usize
}

pub(crate) fn register_config() {
    let _ = stack_size_var();
}

// Thread-local accessors stay out of line so a coroutine that migrates to
// another thread never reuses a TLS address computed before the switch.
#[inline(never)]
fn current_ptr() -> *const Coroutine {
    CURRENT.with(|c| c.get())
}

#[inline(never)]
fn set_current(co: *const Coroutine) {
    CURRENT.with(|c| c.set(co));
}

#[inline(never)]
fn thread_root() -> *const Coroutine {
    THREAD_ROOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let root = slot.get_or_insert_with(|| {
            let root = Arc::new(Coroutine::root());
            CURRENT.with(|c| {
                if c.get().is_null() {
                    c.set(Arc::as_ptr(&root));
                }
            });
            root
        });
        Arc::as_ptr(root)
    })
}

#[inline(never)]
fn main_coroutine() -> *const Coroutine {
    let main = SCHEDULER_MAIN.with(|c| c.get());
    if main.is_null() {
        thread_root()
    } else {
        main
    }
}

/// Make the running coroutine the scheduler main coroutine of this thread and
/// return the previous one for [`leave_scheduler`].
pub(crate) fn enter_scheduler() -> *const Coroutine {
    let mut cur = current_ptr();
    if cur.is_null() {
        cur = thread_root();
    }
    SCHEDULER_MAIN.with(|c| c.replace(cur))
}

pub(crate) fn leave_scheduler(previous: *const Coroutine) {
    SCHEDULER_MAIN.with(|c| c.set(previous));
}

/// A stackful unit of execution.
pub struct Coroutine {
    id: u64,
    state: AtomicU8,
    entry: Entry,
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    callback: UnsafeCell<Option<Callback>>,
}

// The context and callback cells are only touched by the thread currently
// resuming the coroutine; the scheduler serialises resumption through the
// `Exec` state check done under its queue lock.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Create a coroutine that returns to the scheduler main coroutine when
    /// its body finishes. `stack_size == 0` picks [`default_stack_size`].
    pub fn new<F>(callback: F, stack_size: usize) -> Arc<Coroutine>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(callback), stack_size, Entry::Worker)
    }

    /// Create a coroutine that returns to the thread root when its body
    /// finishes.
    pub fn new_caller<F>(callback: F, stack_size: usize) -> Arc<Coroutine>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(callback), stack_size, Entry::Caller)
    }

    pub(crate) fn from_callback(callback: Callback) -> Arc<Coroutine> {
        Self::build(callback, 0, Entry::Worker)
    }

    fn build(callback: Callback, stack_size: usize, entry: Entry) -> Arc<Coroutine> {
        let size = if stack_size == 0 {
            default_stack_size()
        } else {
            stack_size
        };
        let stack = match Stack::new(size) {
            Ok(stack) => stack,
            Err(e) => rt_abort!("coroutine stack allocation of {} bytes failed: {}", size, e),
        };
        let ctx = match Context::prepare(&stack, entry.trampoline()) {
            Ok(ctx) => ctx,
            Err(e) => rt_abort!("coroutine context setup failed: {}", e),
        };

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
        TOTAL.fetch_add(1, Ordering::Relaxed);
        THREAD_COUNT.with(|c| c.set(c.get() + 1));
        tracing::debug!("coroutine created id={} stack={}", id, size);

        Arc::new(Coroutine {
            id,
            state: AtomicU8::new(State::Init as u8),
            entry,
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            callback: UnsafeCell::new(Some(callback)),
        })
    }

    /// The implicit coroutine standing for a thread's native stack.
    fn root() -> Coroutine {
        let ctx = match Context::capture() {
            Ok(ctx) => ctx,
            Err(e) => rt_abort!("getcontext failed for thread root: {}", e),
        };
        TOTAL.fetch_add(1, Ordering::Relaxed);
        THREAD_COUNT.with(|c| c.set(c.get() + 1));
        Coroutine {
            id: 0,
            state: AtomicU8::new(State::Exec as u8),
            entry: Entry::Caller,
            stack: None,
            ctx: UnsafeCell::new(ctx),
            callback: UnsafeCell::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `true` for the thread root, which runs on the native stack.
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Give the coroutine a new body, reusing its stack.
    ///
    /// Only valid in `Init`, `Terminate` or `Except`.
    pub fn reset<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(callback));
    }

    pub(crate) fn reset_boxed(&self, callback: Callback) {
        let Some(stack) = self.stack.as_ref() else {
            rt_assert!(false, "reset on thread root coroutine");
            return;
        };
        let state = self.state();
        rt_assert!(
            matches!(state, State::Init | State::Terminate | State::Except),
            "reset coroutine id={} in state {:?}",
            self.id,
            state
        );
        let ctx = match Context::prepare(stack, self.entry.trampoline()) {
            Ok(ctx) => ctx,
            Err(e) => rt_abort!("coroutine context setup failed: {}", e),
        };
        // SAFETY: the coroutine is not running, nobody else touches the cells.
        unsafe {
            *self.ctx.get() = ctx;
            *self.callback.get() = Some(callback);
        }
        self.set_state(State::Init);
    }

    /// Resume this coroutine from the scheduler main coroutine.
    pub fn swap_in(&self) {
        if self.state().is_finished() {
            tracing::debug!("swap_in on finished coroutine id={}", self.id);
            return;
        }
        let main = main_coroutine();
        rt_assert!(
            self.state() != State::Exec,
            "coroutine id={} resumed while executing",
            self.id
        );
        set_current(self);
        self.set_state(State::Exec);
        // SAFETY: `main` is alive while its run loop is on the stack.
        unsafe { switch_or_abort((*main).ctx.get(), self.ctx.get()) };
    }

    /// Suspend this coroutine and continue the scheduler main coroutine.
    pub fn swap_out(&self) {
        let main = main_coroutine();
        set_current(main);
        unsafe { switch_or_abort(self.ctx.get(), (*main).ctx.get()) };
    }

    /// Resume this coroutine from the thread root.
    pub fn call(&self) {
        if self.state().is_finished() {
            tracing::debug!("call on finished coroutine id={}", self.id);
            return;
        }
        let root = thread_root();
        set_current(self);
        self.set_state(State::Exec);
        unsafe { switch_or_abort((*root).ctx.get(), self.ctx.get()) };
    }

    /// Suspend this coroutine and continue the thread root.
    pub fn back(&self) {
        let root = thread_root();
        set_current(root);
        unsafe { switch_or_abort(self.ctx.get(), (*root).ctx.get()) };
    }

    /// The running coroutine, creating the thread root on first use.
    pub fn current() -> Arc<Coroutine> {
        let mut cur = current_ptr();
        if cur.is_null() {
            thread_root();
            cur = current_ptr();
        }
        // SAFETY: every coroutine lives in an Arc and the running one is kept
        // alive by whoever resumed it.
        unsafe {
            Arc::increment_strong_count(cur);
            Arc::from_raw(cur)
        }
    }

    /// Id of the running coroutine, 0 on a thread root or outside any.
    pub fn current_id() -> u64 {
        let cur = current_ptr();
        if cur.is_null() {
            0
        } else {
            unsafe { (*cur).id }
        }
    }

    /// `true` when running on a coroutine stack rather than a thread root.
    pub fn is_in_coroutine() -> bool {
        let cur = current_ptr();
        !cur.is_null() && unsafe { !(*cur).is_root() }
    }

    /// Mark the running coroutine `Ready` and switch to the scheduler; the run
    /// loop queues it again.
    pub fn yield_to_ready() {
        let cur = Self::running("yield_to_ready");
        unsafe {
            (*cur).set_state(State::Ready);
            (*cur).swap_out();
        }
    }

    /// Switch to the scheduler without requeueing. Someone holding a handle
    /// (an fd event, a timer) must schedule the coroutine again.
    ///
    /// The state stays `Exec` until the run loop has switched away, so no other
    /// worker can resume the coroutine while it is still on its stack.
    pub fn yield_to_suspend() {
        let cur = Self::running("yield_to_suspend");
        unsafe { (*cur).swap_out() };
    }

    fn running(op: &str) -> *const Coroutine {
        let cur = current_ptr();
        rt_assert!(
            !cur.is_null() && unsafe { !(*cur).is_root() },
            "{} outside a coroutine",
            op
        );
        let state = unsafe { (*cur).state() };
        rt_assert!(state == State::Exec, "{} in state {:?}", op, state);
        cur
    }

    /// Coroutines alive in the process, thread roots included.
    pub fn total() -> u64 {
        TOTAL.load(Ordering::Relaxed)
    }

    /// Coroutines created minus destroyed on this thread.
    pub fn thread_count() -> u64 {
        THREAD_COUNT.with(|c| c.get())
    }
}

impl Entry {
    fn trampoline(self) -> extern "C" fn() {
        match self {
            Entry::Worker => worker_main,
            Entry::Caller => caller_main,
        }
    }
}

unsafe fn switch_or_abort(from: *mut Context, to: *const Context) {
    if let Err(e) = Context::switch(from, to) {
        rt_abort!("swapcontext failed: {}", e);
    }
}

/// Run the body of the current coroutine and record how it ended. Everything
/// owned here is dropped before the caller's final switch.
fn run_body() -> *const Coroutine {
    let cur = current_ptr();
    let co = unsafe { &*cur };
    let callback = unsafe { (*co.callback.get()).take() };
    let outcome = match callback {
        Some(callback) => panic::catch_unwind(AssertUnwindSafe(callback)),
        None => Ok(()),
    };
    match outcome {
        Ok(()) => co.set_state(State::Terminate),
        Err(payload) => {
            co.set_state(State::Except);
            tracing::error!(
                "coroutine except: {} coroutine_id={}\n{}",
                panic_message(payload.as_ref()),
                co.id,
                crate::logging::backtrace()
            );
        }
    }
    cur
}

extern "C" fn worker_main() {
    let cur = run_body();
    let id = unsafe { (*cur).id };
    unsafe { (*cur).swap_out() };
    rt_abort!("never reach coroutine_id={}", id);
}

extern "C" fn caller_main() {
    let cur = run_body();
    let id = unsafe { (*cur).id };
    unsafe { (*cur).back() };
    rt_abort!("never reach coroutine_id={}", id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        TOTAL.fetch_sub(1, Ordering::Relaxed);
        let _ = THREAD_COUNT.try_with(|c| c.set(c.get().saturating_sub(1)));

        let state = self.state();
        if self.stack.is_some() {
            if !matches!(state, State::Init | State::Terminate | State::Except) {
                rt_abort!("coroutine id={} dropped in state {:?}", self.id, state);
            }
            tracing::debug!("coroutine dropped id={} total={}", self.id, Self::total());
        } else {
            if state != State::Exec {
                rt_abort!("thread root coroutine dropped in state {:?}", state);
            }
            let this: *const Coroutine = self;
            let _ = CURRENT.try_with(|c| {
                if c.get() == this {
                    c.set(ptr::null());
                }
            });
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("entry", &self.entry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn call_and_back_interleave() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t = trace.clone();
        let co = Coroutine::new(
            move || {
                t.lock().unwrap().push(1);
                Coroutine::yield_to_ready();
                t.lock().unwrap().push(3);
            },
            0,
        );
        assert_eq!(co.state(), State::Init);

        co.call();
        assert_eq!(co.state(), State::Ready);
        trace.lock().unwrap().push(2);

        co.call();
        assert_eq!(co.state(), State::Terminate);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
        assert!(Coroutine::current().is_root());
    }

    #[test]
    fn finished_coroutine_is_not_reentered() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let co = Coroutine::new(
            move || {
                r.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        co.call();
        co.call();
        co.swap_in();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), State::Terminate);
    }

    #[test]
    fn panic_becomes_except() {
        let co = Coroutine::new(|| panic!("boom"), 0);
        co.call();
        assert_eq!(co.state(), State::Except);
        assert!(!Coroutine::is_in_coroutine());
    }

    #[test]
    fn reset_behaves_like_fresh_coroutine() {
        fn transitions(co: &Arc<Coroutine>) -> Vec<State> {
            let mut seen = vec![co.state()];
            while !co.state().is_finished() {
                co.call();
                seen.push(co.state());
            }
            seen
        }
        let body = |hits: Arc<AtomicUsize>| {
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
                Coroutine::yield_to_ready();
                hits.fetch_add(1, Ordering::SeqCst);
            }
        };

        let hits = Arc::new(AtomicUsize::new(0));
        let fresh = Coroutine::new(body(hits.clone()), 64 * 1024);
        let expected = transitions(&fresh);

        let reused = Coroutine::new(|| {}, 64 * 1024);
        reused.call();
        assert_eq!(reused.state(), State::Terminate);
        reused.reset(body(hits.clone()));
        let id = reused.id();
        assert_eq!(transitions(&reused), expected);
        assert_eq!(reused.id(), id);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn thread_count_tracks_lifetimes() {
        let _root = Coroutine::current();
        let before = Coroutine::thread_count();
        let co = Coroutine::new(|| {}, 0);
        assert_eq!(Coroutine::thread_count(), before + 1);
        drop(co);
        assert_eq!(Coroutine::thread_count(), before);
    }

    #[test]
    fn current_id_inside_body() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let co = Coroutine::new(
            move || {
                s.store(Coroutine::current_id(), Ordering::SeqCst);
            },
            0,
        );
        co.call();
        assert_eq!(seen.load(Ordering::SeqCst), co.id());
        assert_eq!(Coroutine::current_id(), 0);
    }

    #[test]
    #[should_panic]
    fn reset_running_state_is_rejected() {
        let co = Coroutine::new(|| Coroutine::yield_to_ready(), 0);
        co.call();
        assert_eq!(co.state(), State::Ready);
        // Dropping an unfinished coroutine aborts; keep it alive past the panic.
        std::mem::forget(co.clone());
        co.reset(|| {});
    }
}
