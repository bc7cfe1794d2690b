//! Name-keyed worker registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::worker::Worker;

/// Maps worker names to their definitions.
///
/// The registry is a cheap clonable handle; every clone sees the same table.
/// Registration may happen before or after dispatchers start, and
/// re-registering a name replaces the previous definition. Each orchestrator
/// owns its own registry so independent instances can coexist in one process
/// (and in tests).
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Worker>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W>(&self, worker: W)
    where
        W: Worker + 'static,
    {
        self.register_arc(Arc::new(worker));
    }

    pub fn register_arc(&self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_owned();
        self.write().insert(name, worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.inner.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.inner.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.names())
            .finish()
    }
}
