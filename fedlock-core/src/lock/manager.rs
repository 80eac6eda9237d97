use super::{AbortReason, GrantListener, LockMode, LockRequest, LockTarget, LockTree, NodeId};
use crate::deadlock::WaitsForGraph;
use crate::txn::TxnId;
use crate::{Error, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Whether a compatible request may overtake older incompatible waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessPolicy {
    /// Grant anything compatible with the node's current mode. Waiters can
    /// starve.
    #[default]
    Immediate,
    /// No new grant while an older request of another txn waits on the node.
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Left waiting at `at`, which is the requested target itself or the
    /// first ancestor that could not be granted.
    Queued { at: LockTarget },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub target: LockTarget,
    pub mode: Option<LockMode>,
    pub holders: Vec<(TxnId, LockMode)>,
    pub waiters: Vec<(TxnId, LockMode)>,
}

/// Hierarchical lock manager.
///
/// All tree mutation happens under one mutex, held for the duration of a
/// single acquire or release and never while a caller waits for a grant.
pub struct LockManager {
    tree: Mutex<LockTree>,
    graph: WaitsForGraph,
    listeners: Mutex<HashMap<TxnId, Weak<dyn GrantListener>>>,
    fairness: FairnessPolicy,
}

impl LockManager {
    pub fn new(fairness: FairnessPolicy) -> Self {
        Self {
            tree: Mutex::new(LockTree::new()),
            graph: WaitsForGraph::new(),
            listeners: Mutex::new(HashMap::new()),
            fairness,
        }
    }

    pub fn fairness(&self) -> FairnessPolicy {
        self.fairness
    }

    pub fn graph(&self) -> &WaitsForGraph {
        &self.graph
    }

    /// Route asynchronous grants and aborts of `txn_id` to `listener`.
    pub fn register(&self, txn_id: TxnId, listener: Weak<dyn GrantListener>) {
        self.listeners.lock().unwrap().insert(txn_id, listener);
    }

    pub fn unregister(&self, txn_id: TxnId) {
        self.listeners.lock().unwrap().remove(&txn_id);
    }

    /// Returns true only if every level from the database down to `target`
    /// was granted. Rejected requests are logged and return false.
    pub fn acquire(&self, txn_id: TxnId, target: &LockTarget, mode: LockMode) -> bool {
        matches!(self.try_acquire(txn_id, target, mode), Ok(Acquire::Granted))
    }

    pub fn try_acquire(&self, txn_id: TxnId, target: &LockTarget, mode: LockMode) -> Result<Acquire> {
        if let Err(e) = target.validate() {
            warn!("txn {txn_id} request {mode} on {target} rejected: {e}");
            return Err(e);
        }
        let request = LockRequest::new(txn_id, target.clone(), mode);

        let mut tree = self.tree.lock().unwrap();
        let path = tree.path(target);
        match self.acquire_from(&mut tree, &request, &path, 0) {
            Ok(true) => {
                debug!("txn {txn_id} granted {mode} on {target}");
                Ok(Acquire::Granted)
            }
            Ok(false) => {
                debug!("txn {txn_id} queued for {mode} on {target}");
                Ok(Acquire::Queued { at: target.clone() })
            }
            Err(Error::AncestorAcquisitionFailed { blocked_at, .. }) => {
                debug!("txn {txn_id} queued for {mode} on {target}, blocked at {blocked_at}");
                Ok(Acquire::Queued { at: blocked_at })
            }
            Err(e) => Err(e),
        }
    }

    /// Walk `path` from `start` downwards, requesting the intent mode on
    /// ancestors and the requested mode on the target itself.
    ///
    /// Ok(false) means the target level is queued; an ancestor that queues
    /// stops the walk with `AncestorAcquisitionFailed`.
    fn acquire_from(
        &self,
        tree: &mut LockTree,
        request: &LockRequest,
        path: &[NodeId],
        start: usize,
    ) -> Result<bool> {
        let txn_id = request.txn_id;
        for (level, &id) in path.iter().enumerate().skip(start) {
            let at = request.at(tree.node(id).target());
            let applied_target = at.applied_target.clone();
            tree.touch(txn_id, id);
            if tree.node_mut(id).request(at, self.fairness) {
                self.graph.hold(txn_id, &applied_target);
                continue;
            }

            self.graph.wait(txn_id, &applied_target);
            if level + 1 == path.len() {
                return Ok(false);
            }
            return Err(Error::AncestorAcquisitionFailed {
                target: request.target.clone(),
                blocked_at: applied_target,
            });
        }
        Ok(true)
    }

    /// Drop every lock and pending request of `txn_id`, then promote
    /// waiters on each node it touched.
    pub fn release(&self, txn_id: TxnId) {
        let granted = {
            let mut tree = self.tree.lock().unwrap();
            let touched = tree.take_touched(txn_id);
            for &id in touched.iter() {
                tree.node_mut(id).remove_txn(txn_id);
            }
            self.graph.remove_transaction(txn_id);

            let mut granted = vec![];
            for &id in touched.iter() {
                self.promote(&mut tree, id, &mut granted);
            }
            if !touched.is_empty() {
                debug!(
                    "txn {txn_id} released {} nodes, {} requests promoted",
                    touched.len(),
                    granted.len()
                );
            }
            granted
        };
        self.notify_granted(granted);
    }

    /// Kill `txn_id`: tell its owner, then release everything it holds.
    pub fn abort(&self, txn_id: TxnId, reason: AbortReason) {
        info!("abort txn {txn_id}: {reason:?}");
        if let Some(listener) = self.listener(txn_id) {
            listener.aborted(reason);
        }
        self.release(txn_id);
    }

    fn promote(&self, tree: &mut LockTree, id: NodeId, granted: &mut Vec<LockRequest>) {
        let promoted = tree.node_mut(id).promote(self.fairness);
        for entry in promoted {
            let txn_id = entry.txn_id;
            self.graph.hold(txn_id, &entry.applied_target);
            if !tree.node(id).is_waiting(txn_id) {
                self.graph.stop_waiting(txn_id, &entry.applied_target);
            }
            if !entry.is_intent() {
                granted.push(entry);
                continue;
            }

            // an ancestor came through, resume the walk towards the target
            let path = tree.path(&entry.target);
            let Some(level) = path.iter().position(|p| *p == id) else {
                continue;
            };
            match self.acquire_from(tree, &entry, &path, level + 1) {
                Ok(true) => granted.push(entry),
                Ok(false) | Err(_) => {}
            }
        }
    }

    fn notify_granted(&self, granted: Vec<LockRequest>) {
        for req in granted {
            debug!(
                "txn {} granted {} on {} after waiting",
                req.txn_id, req.mode, req.target
            );
            if let Some(listener) = self.listener(req.txn_id) {
                listener.granted(&req.target, req.mode);
            }
        }
    }

    fn listener(&self, txn_id: TxnId) -> Option<Arc<dyn GrantListener>> {
        self.listeners
            .lock()
            .unwrap()
            .get(&txn_id)
            .and_then(|l| l.upgrade())
    }

    pub fn snapshot(&self, target: &LockTarget) -> Option<NodeSnapshot> {
        let tree = self.tree.lock().unwrap();
        let node = tree.node(tree.locate(target)?);
        Some(NodeSnapshot {
            target: target.clone(),
            mode: node.mode(),
            holders: node.holders(),
            waiters: node.waiters(),
        })
    }

    /// Combined mode `txn_id` holds on `target`, if any.
    pub fn held_mode(&self, txn_id: TxnId, target: &LockTarget) -> Option<LockMode> {
        let tree = self.tree.lock().unwrap();
        tree.node(tree.locate(target)?).held_by(txn_id)
    }

    /// Number of nodes on which `txn_id` holds a granted lock.
    pub fn lock_count(&self, txn_id: TxnId) -> usize {
        let tree = self.tree.lock().unwrap();
        tree.touched(txn_id)
            .filter(|&id| tree.node(id).held_by(txn_id).is_some())
            .count()
    }

    pub fn node_count(&self) -> usize {
        self.tree.lock().unwrap().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(FairnessPolicy::default())
    }
}
