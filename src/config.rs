//! Live-reloadable named configuration values.
//!
//! A [`ConfigVar`] is created once through [`Config::lookup`] with a default
//! and can later be overwritten by loading a TOML document. Nested tables are
//! flattened into dotted keys, so
//!
//! ```toml
//! [tcp.connect]
//! timeout = 3000
//! ```
//!
//! assigns the `tcp.connect.timeout` variable. Subscribers registered with
//! [`ConfigVar::add_listener`] see every change as `(old, new)`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use slab::Slab;

use crate::error::{Error, Result};

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Type-erased view of a [`ConfigVar`] used by the loader.
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn type_name(&self) -> &'static str;
    /// Render the current value for diagnostics.
    fn value_string(&self) -> String;
    /// Convert `value` to the variable's type and assign it.
    fn load(&self, value: toml::Value) -> Result<()>;
}

/// A named, typed configuration value.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Slab<Listener<T>>>,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Debug + Send + Sync + 'static,
{
    fn new(name: &str, default: T, description: &str) -> Self {
        ConfigVar {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(Slab::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value.
    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value and notify listeners if it changed.
    pub fn set_value(&self, value: T) {
        let old = {
            let mut slot = self.value.write();
            if *slot == value {
                return;
            }
            std::mem::replace(&mut *slot, value.clone())
        };
        tracing::info!(
            "config {} changed from {:?} to {:?}",
            self.name,
            old,
            value
        );
        // Listeners run without any lock held so they may read the var again.
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&old, &value);
        }
    }

    /// Register a change listener, returning a key for [`Self::remove_listener`].
    pub fn add_listener<F>(&self, listener: F) -> usize
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.listeners.lock().insert(Arc::new(listener))
    }

    pub fn remove_listener(&self, key: usize) -> bool {
        self.listeners.lock().try_remove(key).is_some()
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl<T> ConfigVarBase for ConfigVar<T>
where
    T: Clone + PartialEq + Debug + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn value_string(&self) -> String {
        format!("{:?}", self.value.read())
    }

    fn load(&self, value: toml::Value) -> Result<()> {
        let parsed: T = value.try_into().map_err(|source| Error::ConfigValue {
            name: self.name.clone(),
            source,
        })?;
        self.set_value(parsed);
        Ok(())
    }
}

struct Entry {
    base: Arc<dyn ConfigVarBase>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Process-wide registry of configuration variables.
pub struct Config;

fn registry() -> &'static RwLock<HashMap<String, Entry>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Entry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
}

impl Config {
    /// Return the variable called `name`, creating it with `default` if absent.
    #[tracing::instrument(level = "trace", skip(default, description))]
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Result<Arc<ConfigVar<T>>>
    where
        T: Clone + PartialEq + Debug + DeserializeOwned + Send + Sync + 'static,
    {
        let mut registry = registry().write();
        if let Some(entry) = registry.get(name) {
            return match entry.any.clone().downcast::<ConfigVar<T>>() {
                Ok(var) => {
                    tracing::debug!("config lookup name={} exists", name);
                    Ok(var)
                }
                Err(_) => {
                    tracing::error!(
                        "config lookup name={} exists with type {}, requested {}",
                        name,
                        entry.base.type_name(),
                        std::any::type_name::<T>()
                    );
                    Err(Error::ConfigTypeMismatch {
                        name: name.to_string(),
                        registered: entry.base.type_name(),
                    })
                }
            };
        }

        if !valid_name(name) {
            tracing::error!("config lookup name invalid {}", name);
            return Err(Error::InvalidConfigName(name.to_string()));
        }

        let var = Arc::new(ConfigVar::new(name, default, description));
        registry.insert(
            name.to_string(),
            Entry {
                base: var.clone(),
                any: var.clone(),
            },
        );
        Ok(var)
    }

    /// Return an already registered variable of type `T`.
    pub fn lookup_existing<T>(name: &str) -> Option<Arc<ConfigVar<T>>>
    where
        T: Send + Sync + 'static,
    {
        registry()
            .read()
            .get(name)
            .and_then(|entry| entry.any.clone().downcast::<ConfigVar<T>>().ok())
    }

    /// Type-erased access, mostly for dumping the configuration.
    pub fn lookup_base(name: &str) -> Option<Arc<dyn ConfigVarBase>> {
        registry().read().get(name).map(|entry| entry.base.clone())
    }

    /// Apply a TOML document to the registered variables.
    ///
    /// Keys without a registered variable are ignored.
    pub fn load_from_str(document: &str) -> Result<()> {
        let root: toml::Table = document.parse()?;
        let mut assignments = Vec::new();
        flatten("", toml::Value::Table(root), &mut assignments);
        for (key, value) in assignments {
            let Some(var) = Self::lookup_base(&key) else {
                tracing::trace!("config key {} has no registered var", key);
                continue;
            };
            var.load(value)?;
        }
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<()> {
        let document = std::fs::read_to_string(path)?;
        Self::load_from_str(&document)
    }

    /// Visit every registered variable.
    pub fn visit(mut f: impl FnMut(&dyn ConfigVarBase)) {
        for entry in registry().read().values() {
            f(entry.base.as_ref());
        }
    }
}

/// Collect `(dotted.key, value)` pairs. A registered key stops the descent so
/// table-valued variables receive their whole table.
fn flatten(prefix: &str, value: toml::Value, out: &mut Vec<(String, toml::Value)>) {
    if !prefix.is_empty() && registry().read().contains_key(prefix) {
        out.push((prefix.to_string(), value));
        return;
    }
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                let key = key.to_ascii_lowercase();
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.push((prefix.to_string(), other));
            }
        }
    }
}
