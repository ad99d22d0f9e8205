//! Blocking syscalls turned into coroutine suspensions.
//!
//! Each function here has the signature of the libc call it replaces. When
//! hooking is enabled on the calling thread, the caller runs inside a task
//! coroutine of an [`IoManager`](crate::reactor::IoManager), and the fd is a
//! socket the runtime tracks in [`FdManager`], an operation that would block
//! registers interest with the reactor and suspends the coroutine instead.
//! Everything else goes straight to the real libc function.
//!
//! With the `interpose` feature the same functions are also exported under the
//! libc names, so blocking calls made anywhere in the process are covered.

pub mod originals;

#[cfg(feature = "interpose")]
mod interpose;

use std::cell::Cell;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    timespec, useconds_t,
};
use parking_lot::Mutex;

use crate::config::{Config, ConfigVar};
use crate::coroutine::Coroutine;
use crate::fd::{FdCtx, FdManager, TimeoutKind, NO_TIMEOUT};
use crate::reactor::{Event, IoHandle};

use self::originals::originals;

/// Default for `tcp.connect.timeout`, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline(never)]
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.try_with(|c| c.get()).unwrap_or(false)
}

#[inline(never)]
pub fn set_hook_enable(flag: bool) {
    let _ = HOOK_ENABLED.try_with(|c| c.set(flag));
}

static CONNECT_TIMEOUT: AtomicU64 = AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_MS);

fn connect_timeout_var() -> Option<&'static Arc<ConfigVar<u64>>> {
    static VAR: OnceLock<Option<Arc<ConfigVar<u64>>>> = OnceLock::new();
    VAR.get_or_init(|| {
        let var = Config::lookup(
            "tcp.connect.timeout",
            DEFAULT_CONNECT_TIMEOUT_MS,
            "tcp connect timeout",
        )
        .ok()?;
        CONNECT_TIMEOUT.store(var.value(), Ordering::Relaxed);
        var.add_listener(|old, new| {
            tracing::info!("tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT.store(*new, Ordering::Relaxed);
        });
        Some(var)
    })
    .as_ref()
}

pub(crate) fn register_config() {
    let _ = connect_timeout_var();
}

/// Timeout applied by [`connect`], `None` when disabled.
pub fn connect_timeout() -> Option<u64> {
    register_config();
    match CONNECT_TIMEOUT.load(Ordering::Relaxed) {
        NO_TIMEOUT => None,
        ms => Some(ms),
    }
}

fn errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Shared between a parked operation and its timeout timer. The timer sets
/// `cancelled` to the errno the operation should fail with.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Reactor and fd context when the call should be handled cooperatively.
fn hooked_socket(fd: c_int) -> Result<(IoHandle, Arc<FdCtx>), Passthrough> {
    if !is_hook_enable() {
        return Err(Passthrough::Real);
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return Err(Passthrough::Real);
    };
    if ctx.is_closed() {
        return Err(Passthrough::BadFd);
    }
    if !ctx.is_socket() || ctx.user_nonblock() || !Coroutine::is_in_coroutine() {
        return Err(Passthrough::Real);
    }
    match IoHandle::current() {
        Some(iom) => Ok((iom, ctx)),
        None => Err(Passthrough::Real),
    }
}

enum Passthrough {
    Real,
    BadFd,
}

/// Arm a timer that fails the parked operation on `fd` with `ETIMEDOUT`.
fn arm_timeout(
    iom: &IoHandle,
    info: &Arc<TimerInfo>,
    fd: c_int,
    event: Event,
    ms: u64,
) -> Option<Arc<crate::timer::Timer>> {
    if ms == NO_TIMEOUT {
        return None;
    }
    let weak = Arc::downgrade(info);
    let target = iom.clone();
    Some(iom.add_condition_timer(
        ms,
        move || {
            let Some(info) = weak.upgrade() else {
                return;
            };
            if info
                .cancelled
                .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            target.cancel_event(fd, event);
        },
        Arc::downgrade(info),
        false,
    ))
}

/// Run `op` until it stops failing with `EINTR`/`EAGAIN`, parking the
/// coroutine on `event` in between.
fn do_io<F>(fd: c_int, name: &'static str, event: Event, kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    let (iom, ctx) = match hooked_socket(fd) {
        Ok(found) => found,
        Err(Passthrough::Real) => return op(),
        Err(Passthrough::BadFd) => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    let timeout = ctx.timeout(kind);
    let info = Arc::new(TimerInfo::default());

    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }

        let timer = arm_timeout(&iom, &info, fd, event, timeout);
        if let Err(e) = iom.add_event(fd, event, None) {
            tracing::error!("{} add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(timer) = timer {
                timer.cancel();
            }
            set_errno(e.raw_os_error().unwrap_or(libc::EIO));
            return -1;
        }
        Coroutine::yield_to_suspend();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = info.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

/// Suspend the running coroutine for `ms`. `false` when the caller cannot be
/// suspended and must block for real.
fn sleep_ms(ms: u64) -> bool {
    if !is_hook_enable() || !Coroutine::is_in_coroutine() {
        return false;
    }
    let Some(iom) = IoHandle::current() else {
        return false;
    };
    let waiter = Mutex::new(Some(Coroutine::current()));
    let target = iom.handle().clone();
    iom.add_timer(
        ms,
        move || {
            if let Some(co) = waiter.lock().take() {
                target.schedule(co);
            }
        },
        false,
    );
    Coroutine::yield_to_suspend();
    true
}

pub unsafe fn sleep(seconds: c_uint) -> c_uint {
    if sleep_ms(seconds as u64 * 1000) {
        0
    } else {
        (originals().sleep)(seconds)
    }
}

pub unsafe fn usleep(usec: useconds_t) -> c_int {
    if sleep_ms(usec as u64 / 1000) {
        0
    } else {
        (originals().usleep)(usec)
    }
}

pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if req.is_null() || !is_hook_enable() {
        return (originals().nanosleep)(req, rem);
    }
    let req = &*req;
    let Some(ms) = timespec_to_ms(req) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    if sleep_ms(ms) {
        0
    } else {
        (originals().nanosleep)(req, rem)
    }
}

/// `None` for a timespec the real `nanosleep` rejects with EINVAL.
fn timespec_to_ms(ts: &timespec) -> Option<u64> {
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        return None;
    }
    Some(
        (ts.tv_sec as u64)
            .saturating_mul(1000)
            .saturating_add(ts.tv_nsec as u64 / 1_000_000),
    )
}

/// Socket timeout in milliseconds; a zero timeval means no timeout.
fn timeval_to_ms(tv: &libc::timeval) -> Option<u64> {
    if tv.tv_sec < 0 || !(0..1_000_000).contains(&tv.tv_usec) {
        return None;
    }
    if tv.tv_sec == 0 && tv.tv_usec == 0 {
        return Some(NO_TIMEOUT);
    }
    Some(
        (tv.tv_sec as u64)
            .saturating_mul(1000)
            .saturating_add(tv.tv_usec as u64 / 1000)
            .min(NO_TIMEOUT - 1),
    )
}

pub unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (originals().socket)(domain, ty, protocol);
    if fd >= 0 && is_hook_enable() {
        FdManager::global().get(fd, true);
    }
    fd
}

/// `connect` with an explicit timeout in milliseconds (`None` waits forever).
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout: Option<u64>,
) -> c_int {
    let real = originals().connect;
    let iom = match hooked_socket(fd) {
        Ok((iom, _)) => iom,
        Err(Passthrough::Real) => return real(fd, addr, len),
        Err(Passthrough::BadFd) => {
            set_errno(libc::EBADF);
            return -1;
        }
    };

    let n = real(fd, addr, len);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let info = Arc::new(TimerInfo::default());
    let timer = arm_timeout(&iom, &info, fd, Event::Write, timeout.unwrap_or(NO_TIMEOUT));
    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            Coroutine::yield_to_suspend();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let cancelled = info.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            tracing::error!("connect add_event({}, Write) failed: {}", fd, e);
        }
    }

    let mut error: c_int = 0;
    let mut error_len = mem::size_of::<c_int>() as socklen_t;
    if (originals().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        (&mut error as *mut c_int).cast(),
        &mut error_len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, len, connect_timeout())
}

pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let real = originals().accept;
    let client = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || {
        real(fd, addr, len) as ssize_t
    }) as c_int;
    if client >= 0 && is_hook_enable() {
        FdManager::global().get(client, true);
    }
    client
}

pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let real = originals().read;
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || real(fd, buf, count))
}

pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let real = originals().readv;
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || real(fd, iov, iovcnt))
}

pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let real = originals().recv;
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, || {
        real(fd, buf, len, flags)
    })
}

pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let real = originals().recvfrom;
    do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, || {
        real(fd, buf, len, flags, addr, addrlen)
    })
}

pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let real = originals().recvmsg;
    do_io(fd, "recvmsg", Event::Read, TimeoutKind::Recv, || {
        real(fd, msg, flags)
    })
}

pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let real = originals().write;
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || real(fd, buf, count))
}

pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let real = originals().writev;
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || {
        real(fd, iov, iovcnt)
    })
}

pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let real = originals().send;
    do_io(fd, "send", Event::Write, TimeoutKind::Send, || {
        real(fd, buf, len, flags)
    })
}

pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let real = originals().sendto;
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, || {
        real(fd, buf, len, flags, addr, addrlen)
    })
}

pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    let real = originals().sendmsg;
    do_io(fd, "sendmsg", Event::Write, TimeoutKind::Send, || {
        real(fd, msg, flags)
    })
}

/// Wake anything parked on `fd`, forget it, then close it.
///
/// The fd is forgotten even with hooking off, so a reused fd number never
/// inherits a stale context.
pub unsafe fn close(fd: c_int) -> c_int {
    if FdManager::global().get(fd, false).is_some() {
        if is_hook_enable() {
            if let Some(iom) = IoHandle::current() {
                iom.cancel_all(fd);
            }
        }
        FdManager::global().del(fd);
    }
    (originals().close)(fd)
}

fn tracked_socket(fd: c_int) -> Option<Arc<FdCtx>> {
    FdManager::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

/// `arg` is the single variadic argument, passed as one machine word.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: libc::c_long) -> c_int {
    let real = originals().fcntl;
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            let Some(ctx) = tracked_socket(fd) else {
                return real(fd, cmd, flags);
            };
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            real(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = real(fd, cmd);
            if flags < 0 {
                return flags;
            }
            match tracked_socket(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => real(fd, cmd, arg),
    }
}

pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let real = originals().ioctl;
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = tracked_socket(fd) {
            ctx.set_user_nonblock(nonblock);
            // The OS-level fd stays non-blocking while the runtime owns it.
            if ctx.sys_nonblock() {
                let mut on: c_int = 1;
                return real(fd, request, &mut on as *mut c_int);
            }
        }
    }
    real(fd, request, arg)
}

pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (originals().getsockopt)(fd, level, optname, optval, optlen)
}

/// Records `SO_RCVTIMEO`/`SO_SNDTIMEO` so hooked I/O can enforce them.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && !optval.is_null()
        && optlen as usize >= mem::size_of::<libc::timeval>()
    {
        if let Some(kind) = TimeoutKind::from_sockopt(optname) {
            if let Some(ctx) = FdManager::global().get(fd, false) {
                // Invalid values are left for the real call to reject.
                if let Some(ms) = timeval_to_ms(&*(optval as *const libc::timeval)) {
                    ctx.set_timeout(kind, ms);
                }
            }
        }
    }
    (originals().setsockopt)(fd, level, optname, optval, optlen)
}
