//! Stackful coroutines on an M:N scheduler with an epoll reactor.
//!
//! - [`coroutine`]: user-space execution contexts with their own stacks.
//! - [`scheduler`]: a pool of worker threads multiplexing coroutines and
//!   callbacks, optionally including the constructing thread.
//! - [`timer`]: one-shot, recurring and condition timers with clock rollback
//!   detection.
//! - [`reactor`]: the [`IoManager`], a scheduler whose idle workers wait in
//!   `epoll_wait` and resume coroutines parked on fd readiness.
//! - [`hook`]: blocking libc calls rewritten as suspensions, exported under the
//!   libc names with the default `interpose` feature.
//! - [`net`]: a small socket wrapper and TCP server on top of the hooks.

pub mod logging;

pub mod config;
pub mod coroutine;
pub mod error;
pub mod fd;
pub mod hook;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use config::{Config, ConfigVar};
pub use coroutine::{Coroutine, State};
pub use error::{Error, Result};
pub use reactor::{Event, IoHandle, IoManager, IoManagerBuilder};
pub use scheduler::{Handle, Scheduler, Task};
pub use timer::{Timer, TimerManager};

/// Register every runtime config variable, so a document loaded with
/// [`Config::load_from_str`] or [`Config::load_from_file`] reaches them even
/// before first use.
pub fn register_config_vars() {
    coroutine::register_config();
    hook::register_config();
    net::server::register_config();
}
