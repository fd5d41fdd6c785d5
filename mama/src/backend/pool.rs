//! Backend pool: one subprocess backend per channel key.
//!
//! Set/prompt sequences on a backend are only safe when a single lane drives
//! it, so the pool hands every channel key its own instance. A shared single
//! instance is available for tests and one-shot CLI runs, where only one key
//! is ever in flight.

use std::sync::Arc;

use dashmap::DashMap;

use crate::backend::AgentBackend;

/// Builds a fresh backend for a newly seen channel key.
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn AgentBackend> + Send + Sync>;

pub struct BackendPool {
    factory: BackendFactory,
    backends: DashMap<String, Arc<dyn AgentBackend>>,
}

impl BackendPool {
    pub fn new(factory: BackendFactory) -> Self {
        Self {
            factory,
            backends: DashMap::new(),
        }
    }

    /// A pool that hands the same instance to every key.
    pub fn single(backend: Arc<dyn AgentBackend>) -> Self {
        Self::new(Arc::new(move || backend.clone()))
    }

    /// The backend owned by `key`, created on first use.
    pub fn for_key(&self, key: &str) -> Arc<dyn AgentBackend> {
        self.backends
            .entry(key.to_string())
            .or_insert_with(|| (self.factory)())
            .clone()
    }

    /// Drops the backend for `key`; the next use gets a fresh process.
    pub fn remove(&self, key: &str) -> bool {
        self.backends.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
