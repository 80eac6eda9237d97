use crate::config::{Config, Engine};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod memory;

/// Executes translated statements against one backing store.
///
/// Only called once every lock the statement needs has been granted.
pub trait StorageAdapter: Send + Sync {
    fn engine(&self) -> Engine;

    /// Run `statement` and return the produced rows/documents.
    fn execute(&self, statement: &str) -> Result<Vec<Value>>;
}

/// Storage id -> adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn StorageAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, storage: impl Into<String>, adapter: Arc<dyn StorageAdapter>) {
        self.adapters.insert(storage.into(), adapter);
    }

    pub fn get(&self, storage: &str) -> Result<&Arc<dyn StorageAdapter>> {
        self.adapters.get(storage).ok_or_else(|| Error::StorageExecution {
            storage: storage.to_owned(),
            reason: "no adapter registered".to_owned(),
        })
    }

    /// Every configured storage needs an adapter of the matching engine.
    pub fn check(&self, config: &Config) -> Result<()> {
        for storage in config.storages.iter() {
            let adapter = self.adapters.get(&storage.id).ok_or_else(|| {
                Error::Config(format!("no adapter registered for storage {}", storage.id))
            })?;
            if adapter.engine() != storage.engine {
                return Err(Error::Config(format!(
                    "storage {} is {:?} but its adapter is {:?}",
                    storage.id,
                    storage.engine,
                    adapter.engine()
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
