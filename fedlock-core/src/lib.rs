mod errors;

pub mod config;
pub mod deadlock;
pub mod lock;
pub mod storage;
pub mod translate;
pub mod txn;

pub use config::{Config, Engine, LockConfig};
pub use deadlock::{DeadlockDetector, DeadlockStats, VictimPolicy, WaitsForGraph};
pub use errors::{Error, Result};
pub use lock::{FairnessPolicy, LockManager, LockMode, LockTarget};
pub use storage::{memory::MemoryAdapter, AdapterRegistry, StorageAdapter};
pub use translate::{SchemaTranslator, Translator};
pub use txn::{Transaction, TransactionManager, TxnId, TxnOutcome, TxnTicket};
