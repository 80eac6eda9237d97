use fedlock_core::{Config, Result};

/// `shop.users` on a MySQL storage and `shop.events` on a MongoDB storage
/// hanging below it.
pub const SAMPLE_CONFIG: &str = r#"{
    "lock": { "detector_period_ms": 20, "poll_interval_ms": 5 },
    "workers": 2,
    "storages": [
        { "id": "mysql0", "engine": "mysql", "host": "127.0.0.1", "port": 3306, "user": "root" },
        { "id": "mongo0", "engine": "mongodb", "host": "127.0.0.1", "port": 27017, "parent": "mysql0" }
    ],
    "schemas": [
        { "storage": "mysql0", "database": "shop",
          "tables": [ { "name": "users", "columns": ["id", "name"], "primary_key": "id" } ] },
        { "storage": "mongo0", "database": "shop",
          "tables": [ { "name": "events", "primary_key": "id" } ] }
    ]
}"#;

pub fn sample_config() -> Result<Config> {
    Config::from_reader(SAMPLE_CONFIG.as_bytes())
}

pub fn base_url(addr: &str) -> String {
    format!("http://{addr}")
}
