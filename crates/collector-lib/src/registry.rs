//! Module registry
//!
//! Maps module names to constructors and default job settings. The registry
//! is filled before discovery starts and then shared read-only behind an
//! `Arc`; tests build private registries with only the modules they need.

use crate::confgroup::{Defaults, DefaultsLookup};
use crate::module::Module;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

type CreateFn = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid module name '{0}': expected lowercase ascii")]
    InvalidName(String),
}

/// Constructor plus defaults of one module
#[derive(Clone)]
pub struct Creator {
    create: CreateFn,
    pub defaults: Defaults,
}

impl Creator {
    pub fn new<F, M>(create: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Module + 'static,
    {
        Self {
            create: Arc::new(move || Box::new(create()) as Box<dyn Module>),
            defaults: Defaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn create(&self) -> Box<dyn Module> {
        (self.create)()
    }
}

impl fmt::Debug for Creator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Creator")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    modules: HashMap<String, Creator>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `name`
    pub fn register(&mut self, name: &str, creator: Creator) -> Result<(), RegistryError> {
        let valid = name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase())
            .unwrap_or(false)
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.modules.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.modules.insert(name.to_string(), creator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Creator> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Keep only the modules in `names`. Returns the requested names that
    /// are not registered.
    pub fn restrict(&mut self, names: &[String]) -> Vec<String> {
        self.modules.retain(|name, _| names.contains(name));
        names
            .iter()
            .filter(|name| !self.modules.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl DefaultsLookup for Registry {
    fn defaults_for(&self, module: &str) -> Option<Defaults> {
        self.get(module).map(|c| c.defaults)
    }
}
