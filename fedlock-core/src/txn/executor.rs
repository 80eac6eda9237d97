use super::{BackendResult, StatementOutcome, Transaction};
use crate::storage::AdapterRegistry;
use crate::translate::StatementPlan;
use crate::{Error, Result};
use log::{debug, error, warn};

/// Runs one planned statement of a transaction: lock, wait, execute.
pub struct QueryExecutor<'a> {
    txn: &'a Transaction,
    sql: &'a str,
    plan: &'a StatementPlan,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(txn: &'a Transaction, sql: &'a str, plan: &'a StatementPlan) -> Self {
        Self { txn, sql, plan }
    }

    /// Submit one request per lock target, block until all are granted or
    /// the transaction is killed, then hand the translated statements to
    /// their storages.
    ///
    /// Releasing is left to the transaction, which outlives its executors.
    pub fn execute(&self, adapters: &AdapterRegistry) -> Result<StatementOutcome> {
        let txn_id = self.txn.id();
        let plan = self.plan;

        let mut pending = Vec::with_capacity(plan.targets.len());
        for target in plan.targets.iter() {
            match self.txn.submit(target, plan.mode) {
                Ok(_) => pending.push((target.clone(), plan.mode)),
                // proceed without that lock
                Err(Error::InvalidLockLevel(reason)) => {
                    warn!("txn {txn_id} skip lock on {target}: {reason}")
                }
                Err(e) => return Err(e),
            }
        }
        self.txn.wait_for(&pending)?;
        debug!("txn {txn_id} locks satisfied for: {}", self.sql);

        let mut results = Vec::with_capacity(plan.statements.len());
        for statement in plan.statements.iter() {
            // killed or failed between two backend statements
            self.txn.check_alive()?;
            let adapter = adapters.get(&statement.storage)?;
            let rows = adapter.execute(&statement.text).map_err(|e| {
                error!("txn {txn_id} statement on {} failed: {e}", statement.storage);
                e
            })?;
            results.push(BackendResult {
                storage: statement.storage.clone(),
                rows,
            });
        }

        Ok(StatementOutcome {
            sql: self.sql.to_owned(),
            results,
        })
    }
}
