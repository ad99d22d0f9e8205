//! The libc implementations behind the hooked symbols.
//!
//! Resolved once with `dlsym(RTLD_NEXT, ..)`. Runtime internals always go
//! through these so they never re-enter the hooks.

use std::sync::OnceLock;

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    timespec, useconds_t,
};

macro_rules! originals {
    ($($name:ident: $ty:ty;)+) => {
        /// Function pointers to the next definition of each hooked symbol.
        pub struct Originals {
            $(pub $name: $ty,)+
        }

        impl Originals {
            fn resolve() -> Originals {
                Originals {
                    $($name: unsafe {
                        std::mem::transmute::<*mut c_void, $ty>(lookup(concat!(stringify!($name), "\0")))
                    },)+
                }
            }
        }
    };
}

originals! {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint;
    usleep: unsafe extern "C" fn(useconds_t) -> c_int;
    nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
    connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
    accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
    read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
    readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
    recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
    recvfrom: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t;
    recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
    write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
    writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
    send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
    sendto: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
    sendmsg: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
    close: unsafe extern "C" fn(c_int) -> c_int;
    fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
    ioctl: unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
    getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
}

/// `name` must be NUL terminated.
fn lookup(name: &'static str) -> *mut c_void {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) };
    if sym.is_null() {
        // Logging would write through the hooks we are still resolving, so
        // report with a raw syscall.
        let msg = format!("dlsym(RTLD_NEXT, {}) failed\n", name.trim_end_matches('\0'));
        unsafe {
            libc::syscall(libc::SYS_write, 2, msg.as_ptr(), msg.len());
        }
        std::process::abort();
    }
    sym
}

pub fn originals() -> &'static Originals {
    static ORIGINALS: OnceLock<Originals> = OnceLock::new();
    ORIGINALS.get_or_init(Originals::resolve)
}
