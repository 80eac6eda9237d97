use super::StorageAdapter;
use crate::config::{Config, Engine};
use crate::{Error, Result};
use log::debug;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

/// In-process adapter. Records every statement it runs instead of talking
/// to a server, and can be primed to fail.
pub struct MemoryAdapter {
    id: String,
    engine: Engine,
    log: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryAdapter {
    pub fn new(id: impl Into<String>, engine: Engine) -> Self {
        Self {
            id: id.into(),
            engine,
            log: Mutex::new(vec![]),
            fail_with: Mutex::new(None),
        }
    }

    /// One adapter per configured storage.
    pub fn for_config(config: &Config) -> Vec<(String, Arc<MemoryAdapter>)> {
        config
            .storages
            .iter()
            .map(|s| (s.id.clone(), Arc::new(Self::new(s.id.clone(), s.engine))))
            .collect()
    }

    /// Make every following `execute` fail with `reason`, or succeed again
    /// with `None`.
    pub fn fail(&self, reason: Option<&str>) {
        *self.fail_with.lock().unwrap() = reason.map(str::to_owned);
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl StorageAdapter for MemoryAdapter {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn execute(&self, statement: &str) -> Result<Vec<Value>> {
        if let Some(reason) = self.fail_with.lock().unwrap().clone() {
            return Err(Error::StorageExecution {
                storage: self.id.clone(),
                reason,
            });
        }
        debug!("storage {} execute: {statement}", self.id);
        let mut log = self.log.lock().unwrap();
        log.push(statement.to_owned());
        Ok(vec![json!({ "storage": self.id, "seq": log.len() })])
    }
}
