//! Error type for the configuration and setup paths of the runtime.
//!
//! Reactor and socket operations report `std::io::Error` directly; hooked
//! syscalls keep the C convention of `-1` plus `errno`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config key `{0}`, expected [a-z0-9._]+")]
    InvalidConfigName(String),

    #[error("config key `{name}` is already registered with type {registered}")]
    ConfigTypeMismatch {
        name: String,
        registered: &'static str,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("bad value for config key `{name}`: {source}")]
    ConfigValue {
        name: String,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
