use super::{FairnessPolicy, LockMode, LockRequest, LockTarget};
use crate::txn::TxnId;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Handle of a node in the lock tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(usize);

/// Children of a node, selected by granularity.
pub(crate) enum ResourceNode {
    Database { tables: HashMap<String, NodeId> },
    Table { records: HashMap<String, NodeId> },
    Record,
}

pub(crate) struct LockTreeNode {
    target: LockTarget,
    kind: ResourceNode,
    // undefined until the first grant, and again once every holder left
    mode: Option<LockMode>,
    queue: VecDeque<LockRequest>,
}

impl LockTreeNode {
    fn new(target: LockTarget, kind: ResourceNode) -> Self {
        Self {
            target,
            kind,
            mode: None,
            queue: VecDeque::new(),
        }
    }

    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }

    /// Combined mode `txn_id` holds on this node.
    pub fn held_by(&self, txn_id: TxnId) -> Option<LockMode> {
        self.granted_modes(|tid| tid == txn_id)
    }

    fn mode_excluding(&self, txn_id: TxnId) -> Option<LockMode> {
        self.granted_modes(|tid| tid != txn_id)
    }

    fn granted_modes(&self, filter: impl Fn(TxnId) -> bool) -> Option<LockMode> {
        self.queue
            .iter()
            .filter(|e| e.granted && filter(e.txn_id))
            .map(|e| e.applied_mode)
            .reduce(LockMode::join)
    }

    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.queue.iter().any(|e| !e.granted && e.txn_id == txn_id)
    }

    /// Transactions holding this node, each with its combined mode.
    pub fn holders(&self) -> Vec<(TxnId, LockMode)> {
        let mut holders: BTreeMap<TxnId, LockMode> = BTreeMap::new();
        for e in self.queue.iter().filter(|e| e.granted) {
            holders
                .entry(e.txn_id)
                .and_modify(|m| *m = m.join(e.applied_mode))
                .or_insert(e.applied_mode);
        }
        holders.into_iter().collect()
    }

    /// Pending requests in arrival order.
    pub fn waiters(&self) -> Vec<(TxnId, LockMode)> {
        self.queue
            .iter()
            .filter(|e| !e.granted)
            .map(|e| (e.txn_id, e.applied_mode))
            .collect()
    }

    /// Whether the request at queue `position` could be granted now.
    fn grantable(&self, req: &LockRequest, position: usize, fairness: FairnessPolicy) -> bool {
        let held = self.held_by(req.txn_id);
        // a holder upgrading is never parked behind waiters, they would
        // wait on it anyway
        if fairness == FairnessPolicy::Fifo
            && held.is_none()
            && self
                .queue
                .iter()
                .take(position)
                .any(|e| !e.granted && e.txn_id != req.txn_id)
        {
            return false;
        }
        let wanted = held.map_or(req.applied_mode, |h| h.join(req.applied_mode));
        self.mode_excluding(req.txn_id)
            .map_or(true, |others| others.compatible(wanted))
    }

    /// Evaluate a new request. Returns whether it is granted; otherwise it
    /// is left waiting in the queue.
    pub fn request(&mut self, req: LockRequest, fairness: FairnessPolicy) -> bool {
        if let Some(held) = self.held_by(req.txn_id) {
            if held.covers(req.applied_mode) {
                return true;
            }
        }
        let duplicate = self.queue.iter().any(|e| {
            !e.granted
                && e.txn_id == req.txn_id
                && e.applied_mode == req.applied_mode
                && e.target == req.target
                && e.mode == req.mode
        });
        if duplicate {
            return false;
        }

        let granted = self.grantable(&req, self.queue.len(), fairness);
        self.queue.push_back(LockRequest { granted, ..req });
        if granted {
            self.refresh_mode();
        }
        granted
    }

    /// Grant whatever waiting requests became compatible, in arrival order.
    pub fn promote(&mut self, fairness: FairnessPolicy) -> Vec<LockRequest> {
        let mut promoted = vec![];
        for idx in 0..self.queue.len() {
            if self.queue[idx].granted {
                continue;
            }
            if self.grantable(&self.queue[idx], idx, fairness) {
                self.queue[idx].granted = true;
                self.refresh_mode();
                promoted.push(self.queue[idx].clone());
            } else if fairness == FairnessPolicy::Fifo {
                break;
            }
        }
        promoted
    }

    /// Drop every entry of `txn_id`, granted or waiting.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.queue.retain(|e| e.txn_id != txn_id);
        self.refresh_mode();
    }

    fn refresh_mode(&mut self) {
        self.mode = self.granted_modes(|_| true);
    }
}

/// Hierarchical resource namespace: database -> table -> record.
///
/// Nodes live in an arena and are addressed by `NodeId`. The tree only
/// grows; nodes are never freed.
#[derive(Default)]
pub(crate) struct LockTree {
    nodes: Vec<LockTreeNode>,
    databases: HashMap<String, NodeId>,
    // nodes where each txn has at least one queue entry
    touched: HashMap<TxnId, BTreeSet<NodeId>>,
}

impl LockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> &LockTreeNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut LockTreeNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn locate(&self, target: &LockTarget) -> Option<NodeId> {
        match target {
            LockTarget::Database(db) => self.databases.get(db).copied(),
            LockTarget::Table(_, table) => {
                let parent = self.locate(&target.parent()?)?;
                self.child(parent, table)
            }
            LockTarget::Record(_, _, id) => {
                let parent = self.locate(&target.parent()?)?;
                self.child(parent, id)
            }
        }
    }

    /// Find the node of `target`, creating it and its ancestors on demand.
    pub fn locate_or_insert(&mut self, target: &LockTarget) -> NodeId {
        if let Some(id) = self.locate(target) {
            return id;
        }
        match target {
            LockTarget::Database(db) => {
                let id = self.push(
                    target.clone(),
                    ResourceNode::Database {
                        tables: HashMap::new(),
                    },
                );
                self.databases.insert(db.clone(), id);
                id
            }
            LockTarget::Table(db, table) => {
                let parent = self.locate_or_insert(&LockTarget::Database(db.clone()));
                let id = self.push(
                    target.clone(),
                    ResourceNode::Table {
                        records: HashMap::new(),
                    },
                );
                self.adopt(parent, table, id);
                id
            }
            LockTarget::Record(db, table, record) => {
                let parent = self.locate_or_insert(&LockTarget::Table(db.clone(), table.clone()));
                let id = self.push(target.clone(), ResourceNode::Record);
                self.adopt(parent, record, id);
                id
            }
        }
    }

    /// Node ids from the database down to `target`.
    pub fn path(&mut self, target: &LockTarget) -> Vec<NodeId> {
        target
            .path()
            .iter()
            .map(|level| self.locate_or_insert(level))
            .collect()
    }

    pub fn touch(&mut self, txn_id: TxnId, id: NodeId) {
        self.touched.entry(txn_id).or_default().insert(id);
    }

    pub fn take_touched(&mut self, txn_id: TxnId) -> BTreeSet<NodeId> {
        self.touched.remove(&txn_id).unwrap_or_default()
    }

    pub fn touched(&self, txn_id: TxnId) -> impl Iterator<Item = NodeId> + '_ {
        self.touched.get(&txn_id).into_iter().flatten().copied()
    }

    fn push(&mut self, target: LockTarget, kind: ResourceNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(LockTreeNode::new(target, kind));
        id
    }

    fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes[parent.0].kind {
            ResourceNode::Database { tables } => tables.get(name).copied(),
            ResourceNode::Table { records } => records.get(name).copied(),
            ResourceNode::Record => None,
        }
    }

    fn adopt(&mut self, parent: NodeId, name: &str, child: NodeId) {
        match &mut self.nodes[parent.0].kind {
            ResourceNode::Database { tables } => {
                tables.insert(name.to_owned(), child);
            }
            ResourceNode::Table { records } => {
                records.insert(name.to_owned(), child);
            }
            ResourceNode::Record => unreachable!("records have no children"),
        }
    }
}
