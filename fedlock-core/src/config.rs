use crate::deadlock::VictimPolicy;
use crate::lock::FairnessPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

/// Lock manager and deadlock detector knobs.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub detector_period_ms: u64,
    /// Upper bound of one executor wait between grant checks.
    pub poll_interval_ms: u64,
    /// Abort the wait after this long. `None` waits until granted or killed.
    pub lock_wait_timeout_ms: Option<u64>,
    pub fairness: FairnessPolicy,
    pub victim_policy: VictimPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            detector_period_ms: 100,
            poll_interval_ms: 50,
            lock_wait_timeout_ms: None,
            fairness: FairnessPolicy::default(),
            victim_policy: VictimPolicy::default(),
        }
    }
}

impl LockConfig {
    #[inline]
    pub fn detector_period(&self) -> Duration {
        Duration::from_millis(self.detector_period_ms)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Mysql,
    Mongodb,
}

/// One backing store of the federation.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub id: String,
    pub engine: Engine,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Federated/sharded stores hang below a parent storage.
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    pub primary_key: String,
}

/// Tables (or collections) of one database living on one storage.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SchemaConfig {
    pub storage: String,
    pub database: String,
    pub tables: Vec<TableSchema>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub lock: LockConfig,
    /// Size of the transaction worker pool.
    pub workers: usize,
    pub storages: Vec<StorageConfig>,
    pub schemas: Vec<SchemaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            workers: 4,
            storages: vec![],
            schemas: vec![],
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(f))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let config: Config = serde_json::from_reader(reader)
            .map_err(|e| Error::Config(format!("cannot deserialize Config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock.detector_period_ms == 0 {
            return Err(Error::Config("detector_period_ms must be positive".to_owned()));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_owned()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".to_owned()));
        }

        let mut ids = HashSet::new();
        for storage in self.storages.iter() {
            if !ids.insert(storage.id.as_str()) {
                return Err(Error::Config(format!("duplicate storage id {}", storage.id)));
            }
        }
        for storage in self.storages.iter() {
            if let Some(parent) = &storage.parent {
                if !ids.contains(parent.as_str()) {
                    return Err(Error::Config(format!(
                        "storage {} has unknown parent {parent}",
                        storage.id
                    )));
                }
            }
        }

        let mut owners: HashMap<(&str, &str), &str> = HashMap::new();
        for schema in self.schemas.iter() {
            if !ids.contains(schema.storage.as_str()) {
                return Err(Error::Config(format!(
                    "schema of {} names unknown storage {}",
                    schema.database, schema.storage
                )));
            }
            for table in schema.tables.iter() {
                let key = (schema.database.as_str(), table.name.as_str());
                if let Some(other) = owners.insert(key, schema.storage.as_str()) {
                    return Err(Error::Config(format!(
                        "table {}.{} mapped to both {other} and {}",
                        schema.database, table.name, schema.storage
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn storage(&self, id: &str) -> Option<&StorageConfig> {
        self.storages.iter().find(|s| s.id == id)
    }

    /// The storage owning `database.table`, with the table's schema.
    pub fn locate(&self, database: &str, table: &str) -> Option<(&StorageConfig, &TableSchema)> {
        self.schemas
            .iter()
            .filter(|s| s.database == database)
            .find_map(|s| {
                let table = s.tables.iter().find(|t| t.name == table)?;
                Some((self.storage(&s.storage)?, table))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &str = r#"{
        "lock": { "detector_period_ms": 20, "fairness": "fifo", "victim_policy": "fewest_locks" },
        "storages": [
            { "id": "mysql0", "engine": "mysql", "host": "127.0.0.1", "port": 3306 },
            { "id": "mongo0", "engine": "mongodb", "parent": "mysql0" }
        ],
        "schemas": [
            { "storage": "mysql0", "database": "shop",
              "tables": [ { "name": "users", "columns": ["id", "name"], "primary_key": "id" } ] },
            { "storage": "mongo0", "database": "shop",
              "tables": [ { "name": "events", "primary_key": "_id" } ] }
        ]
    }"#;

    #[test]
    fn parse_with_defaults() {
        let config = Config::from_reader(CONFIG.as_bytes()).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.lock.detector_period(), Duration::from_millis(20));
        assert_eq!(config.lock.poll_interval_ms, 50);
        assert_eq!(config.lock.lock_wait_timeout(), None);
        assert_eq!(config.lock.fairness, FairnessPolicy::Fifo);
        assert_eq!(config.lock.victim_policy, VictimPolicy::FewestLocks);

        let (storage, table) = config.locate("shop", "events").unwrap();
        assert_eq!(storage.engine, Engine::Mongodb);
        assert_eq!(table.primary_key, "_id");
        assert!(config.locate("shop", "nothing").is_none());
    }

    #[test]
    fn reject_inconsistent_topology() {
        let mut config = Config::from_reader(CONFIG.as_bytes()).unwrap();
        config.storages[1].parent = Some("ghost".to_owned());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::from_reader(CONFIG.as_bytes()).unwrap();
        config.schemas[1].tables[0].name = "users".to_owned();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::from_reader(CONFIG.as_bytes()).unwrap();
        config.storages.push(config.storages[0].clone());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::from_reader(CONFIG.as_bytes()).unwrap();
        config.lock.detector_period_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
