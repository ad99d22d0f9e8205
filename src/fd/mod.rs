//! Per-fd bookkeeping for the hook layer.
//!
//! Every socket the hooks know about is switched to `O_NONBLOCK` at the OS
//! level. [`FdCtx`] remembers whether the *user* asked for non-blocking mode,
//! so the hooks can keep presenting blocking semantics to everyone else, and
//! the `SO_RCVTIMEO` / `SO_SNDTIMEO` values the user set.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::hook::originals::originals;

/// Timeout value meaning "wait forever".
pub const NO_TIMEOUT: u64 = u64::MAX;

const INITIAL_SLOTS: usize = 64;

/// Timeout direction, matching `SO_RCVTIMEO` / `SO_SNDTIMEO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    pub fn from_sockopt(optname: libc::c_int) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            (false, false)
        } else {
            (true, stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        if is_socket {
            let fcntl = originals().fcntl;
            unsafe {
                let flags = fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
        }
        tracing::trace!("FdCtx::new fd: {} socket: {}", fd, is_socket);

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: is_socket,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// The runtime forced `O_NONBLOCK` on the fd.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The user asked for `O_NONBLOCK` through `fcntl` or `ioctl(FIONBIO)`.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Milliseconds, [`NO_TIMEOUT`] when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide table of [`FdCtx`] indexed by fd.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl Default for FdManager {
    fn default() -> Self {
        FdManager {
            slots: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }
}

impl FdManager {
    pub fn global() -> &'static FdManager {
        static MANAGER: OnceLock<FdManager> = OnceLock::new();
        MANAGER.get_or_init(FdManager::default)
    }

    /// Look up `fd`, creating its context when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let slots = self.slots.read();
            match slots.get(index) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        // Built outside the lock: creation logs, and logging writes through
        // the hooks, which read this table.
        let fresh = Arc::new(FdCtx::new(fd));
        let mut slots = self.slots.write();
        if slots.len() <= index {
            let len = (index * 3 / 2).max(index + 1);
            slots.resize(len, None);
        }
        let ctx = slots[index].get_or_insert(fresh);
        Some(ctx.clone())
    }

    /// Forget `fd`, marking its context closed for anyone still holding it.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.closed.store(true, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_is_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let manager = FdManager::default();
        assert!(manager.get(fd, false).is_none());

        let ctx = manager.get(fd, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        assert!(Arc::ptr_eq(&ctx, &manager.get(fd, false).unwrap()));
        manager.del(fd);
        assert!(ctx.is_closed());
        assert!(manager.get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn pipe_is_not_a_socket() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let manager = FdManager::default();
        let ctx = manager.get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn table_grows_for_large_fds() {
        let manager = FdManager::default();
        // Not an open fd: the context exists but fstat failed.
        let ctx = manager.get(1000, true).unwrap();
        assert!(!ctx.is_init());
        assert!(manager.slots.read().len() >= 1500);
    }
}
