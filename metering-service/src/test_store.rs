//! State store that fails on chosen paths, for exercising error handling.

use std::sync::Mutex;

use meter_client::db::{MemoryStateStore, NodeSchema, StateStore, StoreError};
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Fault {
    Transient,
    Unavailable,
}

impl Fault {
    fn error(self, path: &str) -> StoreError {
        match self {
            Self::Transient => StoreError::Transient(format!("injected fault at {path}")),
            Self::Unavailable => StoreError::Unavailable(format!("injected fault at {path}")),
        }
    }
}

/// Wraps a [`MemoryStateStore`]; every access to a path under an armed
/// prefix fails with that prefix's fault. `delete_subtree` always succeeds.
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStateStore,
    faults: Mutex<Vec<(String, Fault)>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_under(&self, prefix: &str, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((prefix.to_string(), fault));
        }
    }

    pub fn heal(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    fn check(&self, path: &str) -> Result<(), StoreError> {
        let faults = match self.faults.lock() {
            Ok(faults) => faults,
            Err(_) => return Ok(()),
        };
        match faults.iter().find(|(prefix, _)| path.starts_with(prefix.as_str())) {
            Some((_, fault)) => Err(fault.error(path)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl StateStore for FaultyStore {
    async fn get_value(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check(path)?;
        self.inner.get_value(path).await
    }

    async fn set_value(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.check(path)?;
        self.inner.set_value(path, value).await
    }

    async fn ensure_node(&self, path: &str, schema: &NodeSchema) -> Result<(), StoreError> {
        self.check(path)?;
        self.inner.ensure_node(path, schema).await
    }

    async fn node_exists(&self, path: &str) -> Result<bool, StoreError> {
        self.check(path)?;
        self.inner.node_exists(path).await
    }

    async fn delete_subtree(&self, path: &str) -> Result<(), StoreError> {
        self.inner.delete_subtree(path).await
    }
}
