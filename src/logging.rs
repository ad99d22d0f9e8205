//! Logging helpers shared by the runtime.
//!
//! Everything logs through `tracing`. The runtime never installs a subscriber on
//! its own; binaries and tests call [`init`] when they want output.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling it more than once is harmless, later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

/// Capture the current call stack as a printable string.
pub fn backtrace() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}

/// Runtime contract check. Logs the violation with a backtrace and panics.
///
/// Inside a coroutine body the panic is caught by the trampoline and the
/// coroutine ends up in `State::Except`.
macro_rules! rt_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            let msg = concat!("assertion failed: ", stringify!($cond));
            tracing::error!("{}\n{}", msg, $crate::logging::backtrace());
            panic!("{}", msg);
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let msg = format!($($arg)+);
            tracing::error!("{}\n{}", msg, $crate::logging::backtrace());
            panic!("{}", msg);
        }
    };
}

/// Unrecoverable state: log with a backtrace and abort the process.
///
/// Used where unwinding would run over a foreign or dead stack.
macro_rules! rt_abort {
    ($($arg:tt)+) => {{
        tracing::error!("{}\n{}", format!($($arg)+), $crate::logging::backtrace());
        std::process::abort()
    }};
}

pub(crate) use rt_abort;
pub(crate) use rt_assert;
