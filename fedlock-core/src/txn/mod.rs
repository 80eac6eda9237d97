use crate::config::LockConfig;
use crate::lock::{AbortReason, Acquire, GrantListener, LockManager, LockMode, LockTarget};
use crate::storage::AdapterRegistry;
use crate::translate::{StatementPlan, Translator};
use crate::{Error, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

mod executor;
mod manager;

pub use executor::QueryExecutor;
pub use manager::{TransactionManager, TxnTicket};

pub type TxnId = u64;

type LockKey = (LockTarget, LockMode);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub storage: String,
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementOutcome {
    pub sql: String,
    pub results: Vec<BackendResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnOutcome {
    pub txn_id: TxnId,
    pub statements: Vec<StatementOutcome>,
}

#[derive(Default)]
struct TxnState {
    // (target, mode) -> granted
    locks: HashMap<LockKey, bool>,
    aborted: Option<AbortReason>,
    // first executor failure, stops the siblings
    failed: Option<Error>,
}

/// The part of a transaction the lock manager calls back into.
struct TxnShared {
    id: TxnId,
    state: Mutex<TxnState>,
    signal: Condvar,
}

impl GrantListener for TxnShared {
    fn granted(&self, target: &LockTarget, mode: LockMode) {
        let mut state = self.state.lock().unwrap();
        if let Some(granted) = state.locks.get_mut(&(target.clone(), mode)) {
            *granted = true;
        }
        self.signal.notify_all();
    }

    fn aborted(&self, reason: AbortReason) {
        let mut state = self.state.lock().unwrap();
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
        self.signal.notify_all();
    }
}

/// A unit of work: aggregates the lock requests of its executors and
/// releases all of them when it ends.
///
/// Locks are also released when the transaction is dropped.
pub struct Transaction {
    shared: Arc<TxnShared>,
    manager: Arc<LockManager>,
    poll_interval: Duration,
    lock_wait_timeout: Option<Duration>,
}

impl Transaction {
    pub fn new(id: TxnId, manager: Arc<LockManager>, config: &LockConfig) -> Self {
        let shared = Arc::new(TxnShared {
            id,
            state: Mutex::new(TxnState::default()),
            signal: Condvar::new(),
        });
        let listener: Arc<dyn GrantListener> = shared.clone();
        manager.register(id, Arc::downgrade(&listener));
        Self {
            shared,
            manager,
            poll_interval: config.poll_interval(),
            lock_wait_timeout: config.lock_wait_timeout(),
        }
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().unwrap().aborted.is_some()
    }

    /// Error an executor of this transaction reports once it is killed or
    /// a sibling executor has failed.
    pub fn check_alive(&self) -> Result<()> {
        match self.dead_error(&self.shared.state.lock().unwrap()) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Mark the transaction as failed with `e`. Only the first failure is
    /// kept; executors still waiting or running stop with it.
    pub fn fail(&self, e: &Error) {
        let mut state = self.shared.state.lock().unwrap();
        if state.failed.is_none() {
            debug!("txn {} failed, stopping executors: {e}", self.id());
            state.failed = Some(e.clone());
        }
        self.shared.signal.notify_all();
    }

    fn dead_error(&self, state: &TxnState) -> Option<Error> {
        match (&state.aborted, &state.failed) {
            (Some(reason), _) => Some(self.abort_error(reason)),
            (None, Some(e)) => Some(e.clone()),
            (None, None) => None,
        }
    }

    fn abort_error(&self, reason: &AbortReason) -> Error {
        match reason {
            AbortReason::Deadlock { cycle } => Error::Deadlock {
                txn_id: self.id(),
                cycle: cycle.clone(),
            },
            AbortReason::Cancelled => Error::TxnAborted(self.id()),
        }
    }

    /// Forward a lock request to the lock manager. Returns whether it was
    /// granted right away; a queued request is granted later through the
    /// listener.
    pub fn submit(&self, target: &LockTarget, mode: LockMode) -> Result<bool> {
        let key = (target.clone(), mode);
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(e) = self.dead_error(&state) {
                return Err(e);
            }
            // record before asking, a grant may arrive before acquire returns
            match state.locks.get(&key) {
                Some(true) => return Ok(true),
                Some(false) => {}
                None => {
                    state.locks.insert(key.clone(), false);
                }
            }
        }

        match self.manager.try_acquire(self.id(), target, mode) {
            Ok(Acquire::Granted) => {
                let mut state = self.shared.state.lock().unwrap();
                state.locks.insert(key, true);
                Ok(true)
            }
            Ok(Acquire::Queued { at }) => {
                debug!("txn {} waits at {at} for {mode} on {target}", self.id());
                Ok(false)
            }
            Err(e) => {
                let mut state = self.shared.state.lock().unwrap();
                if state.locks.get(&key) == Some(&false) {
                    state.locks.remove(&key);
                }
                Err(e)
            }
        }
    }

    pub fn is_granted(&self, target: &LockTarget, mode: LockMode) -> bool {
        let state = self.shared.state.lock().unwrap();
        state
            .locks
            .get(&(target.clone(), mode))
            .copied()
            .unwrap_or(false)
    }

    /// Block until every request in `keys` is granted or the transaction is
    /// killed or failed. Each wait is bounded by the poll interval so an abort is
    /// noticed even without a wakeup.
    pub fn wait_for(&self, keys: &[(LockTarget, LockMode)]) -> Result<()> {
        let deadline = self.lock_wait_timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(e) = self.dead_error(&state) {
                return Err(e);
            }
            if keys
                .iter()
                .all(|k| state.locks.get(k).copied().unwrap_or(false))
            {
                return Ok(());
            }

            let mut wait = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    warn!("txn {} lock wait timed out", self.id());
                    return Err(Error::LockTimeout(self.id()));
                }
                wait = wait.min(deadline - now);
            }
            state = self.shared.signal.wait_timeout(state, wait).unwrap().0;
        }
    }

    /// Cancel the transaction: executors stop, locks are released and
    /// waiters behind them promoted.
    pub fn abort(&self) {
        self.manager.abort(self.id(), AbortReason::Cancelled);
    }

    pub fn release(&self) {
        self.manager.release(self.id());
        let mut state = self.shared.state.lock().unwrap();
        state.locks.clear();
    }

    /// Translate every statement, then run them with one executor each,
    /// concurrently, and release every lock no matter how they ended.
    ///
    /// A statement that does not translate fails the whole transaction
    /// before any lock is taken or any storage touched. The first executor
    /// that fails stops its siblings.
    pub fn run(
        &self,
        statements: &[String],
        translator: &dyn Translator,
        adapters: &AdapterRegistry,
    ) -> Result<TxnOutcome> {
        info!("txn {} start, {} statements", self.id(), statements.len());
        let plans = statements
            .iter()
            .map(|sql| translator.translate(sql))
            .collect::<Result<Vec<StatementPlan>>>()
            .map_err(|e| {
                warn!("txn {} rejected: {e}", self.id());
                e
            })?;

        let results: Vec<Result<StatementOutcome>> = std::thread::scope(|s| {
            let handles: Vec<_> = statements
                .iter()
                .zip(plans.iter())
                .map(|(sql, plan)| {
                    let executor = QueryExecutor::new(self, sql, plan);
                    s.spawn(move || {
                        executor.execute(adapters).map_err(|e| {
                            if !e.is_abort() {
                                self.fail(&e);
                            }
                            e
                        })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::Internal("query executor panicked".to_owned())))
                })
                .collect()
        });
        self.release();

        let mut outcome = TxnOutcome {
            txn_id: self.id(),
            statements: Vec::with_capacity(results.len()),
        };
        let mut first_err = None;
        for res in results {
            match res {
                Ok(statement) => outcome.statements.push(statement),
                // abort errors explain the others, report them first
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => {
                warn!("txn {} failed: {e}", self.id());
                Err(e)
            }
            None => {
                info!("txn {} done", self.id());
                Ok(outcome)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.manager.release(self.id());
        self.manager.unregister(self.id());
    }
}
