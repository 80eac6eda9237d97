use crate::txn::TxnId;

mod manager;
mod mode;
mod target;
mod tree;

pub use manager::{Acquire, FairnessPolicy, LockManager, NodeSnapshot};
pub use mode::LockMode;
pub use target::{Granularity, LockTarget, RawTarget};
pub(crate) use tree::{LockTree, NodeId};

/// A lock request as it sits in a node's queue.
///
/// `target`/`mode` are what the caller asked for, `applied_target`/`applied_mode`
/// is what is evaluated at this node. They differ for the intent locks
/// placed on the ancestors of a table or record request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub target: LockTarget,
    pub mode: LockMode,
    pub applied_target: LockTarget,
    pub applied_mode: LockMode,
    pub granted: bool,
}

impl LockRequest {
    pub(crate) fn new(txn_id: TxnId, target: LockTarget, mode: LockMode) -> Self {
        Self {
            txn_id,
            applied_target: target.clone(),
            applied_mode: mode,
            target,
            mode,
            granted: false,
        }
    }

    /// The same request, evaluated at `level` of the target's path.
    pub(crate) fn at(&self, level: &LockTarget) -> Self {
        let applied_mode = if *level == self.target {
            self.mode
        } else {
            self.mode.intent()
        };
        Self {
            txn_id: self.txn_id,
            target: self.target.clone(),
            mode: self.mode,
            applied_target: level.clone(),
            applied_mode,
            granted: false,
        }
    }

    pub fn is_intent(&self) -> bool {
        self.applied_target != self.target
    }
}

/// Why a transaction was killed by the lock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Deadlock { cycle: Vec<TxnId> },
    Cancelled,
}

/// Receives asynchronous lock events for one transaction.
///
/// Called outside of the lock manager's critical section.
pub trait GrantListener: Send + Sync {
    /// A previously queued request has been granted down to its target.
    fn granted(&self, target: &LockTarget, mode: LockMode);

    fn aborted(&self, reason: AbortReason);
}
