#![allow(dead_code)]

use fedlock_core::{
    AdapterRegistry, Config, FairnessPolicy, LockManager, LockMode, LockTarget, MemoryAdapter,
    Result, SchemaTranslator, TransactionManager, VictimPolicy,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One MySQL storage holding `shop.users` and one MongoDB storage holding
/// `shop.events`, with a fast detector.
pub fn config() -> Config {
    let mut config: Config = serde_json::from_str(
        r#"{
            "lock": { "detector_period_ms": 20, "poll_interval_ms": 5 },
            "workers": 4,
            "storages": [
                { "id": "mysql0", "engine": "mysql" },
                { "id": "mongo0", "engine": "mongodb" }
            ],
            "schemas": [
                { "storage": "mysql0", "database": "shop",
                  "tables": [ { "name": "users", "columns": ["id", "name"], "primary_key": "id" } ] },
                { "storage": "mongo0", "database": "shop",
                  "tables": [ { "name": "events", "primary_key": "id" } ] }
            ]
        }"#,
    )
    .unwrap();
    config.lock.victim_policy = VictimPolicy::Youngest;
    config
}

pub struct Harness {
    pub manager: TransactionManager,
    pub adapters: Vec<(String, Arc<MemoryAdapter>)>,
}

impl Harness {
    pub fn adapter(&self, id: &str) -> &Arc<MemoryAdapter> {
        &self
            .adapters
            .iter()
            .find(|(name, _)| name == id)
            .unwrap()
            .1
    }
}

pub fn open(config: Config) -> Result<Harness> {
    let adapters = MemoryAdapter::for_config(&config);
    let mut registry = AdapterRegistry::new();
    for (id, adapter) in adapters.iter() {
        registry.register(id.clone(), adapter.clone());
    }
    let translator = Arc::new(SchemaTranslator::new(config.clone()));
    let manager = TransactionManager::open(&config, translator, registry)?;
    Ok(Harness { manager, adapters })
}

pub fn manager(fairness: FairnessPolicy) -> Arc<LockManager> {
    Arc::new(LockManager::new(fairness))
}

pub fn db(name: &str) -> LockTarget {
    LockTarget::database(name)
}

pub fn table(db: &str, table: &str) -> LockTarget {
    LockTarget::table(db, table)
}

pub fn record(db: &str, table: &str, id: &str) -> LockTarget {
    LockTarget::record(db, table, id)
}

/// Group mode of `target`, `None` if nobody holds it.
pub fn mode_of(manager: &LockManager, target: &LockTarget) -> Option<LockMode> {
    manager.snapshot(target).and_then(|s| s.mode)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
