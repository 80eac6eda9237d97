use crate::lock::LockTarget;
use crate::txn::TxnId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

mod detector;

pub use detector::{DeadlockDetector, DeadlockStats, DetectorHandle, VictimPolicy};

/// A vertex of the waits-for graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphNode {
    Transaction(TxnId),
    Resource(LockTarget),
}

/// A cycle of transactions each waiting on a resource held by the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockCycle {
    pub transactions: Vec<TxnId>,
    pub resources: Vec<LockTarget>,
}

impl DeadlockCycle {
    /// The most recently started transaction (highest id).
    pub fn youngest(&self) -> Option<TxnId> {
        self.transactions.iter().max().copied()
    }

    pub fn oldest(&self) -> Option<TxnId> {
        self.transactions.iter().min().copied()
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.transactions.contains(&txn_id)
    }
}

/// Edges of the graph. `waits` is `Transaction -> Resource`, `holds` is
/// `Resource -> Transaction`.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    waits: BTreeMap<TxnId, BTreeSet<LockTarget>>,
    holds: BTreeMap<LockTarget, BTreeSet<TxnId>>,
}

impl GraphSnapshot {
    pub fn edges(&self) -> Vec<(GraphNode, GraphNode)> {
        let waits = self.waits.iter().flat_map(|(txn, resources)| {
            resources
                .iter()
                .map(|r| (GraphNode::Transaction(*txn), GraphNode::Resource(r.clone())))
        });
        let holds = self.holds.iter().flat_map(|(resource, txns)| {
            txns.iter()
                .map(|t| (GraphNode::Resource(resource.clone()), GraphNode::Transaction(*t)))
        });
        waits.chain(holds).collect()
    }

    pub fn edge_count(&self) -> usize {
        self.waits.values().map(|r| r.len()).sum::<usize>()
            + self.holds.values().map(|t| t.len()).sum::<usize>()
    }

    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.waits.contains_key(&txn_id)
    }

    /// Number of resources `txn_id` holds.
    pub fn held_count(&self, txn_id: TxnId) -> usize {
        self.holds.values().filter(|t| t.contains(&txn_id)).count()
    }

    /// Transactions `txn_id` waits for, with the resource in between. A
    /// hold edge back to `txn_id` itself (lock upgrade) is not a wait.
    fn blockers(&self, txn_id: TxnId) -> impl Iterator<Item = (&LockTarget, TxnId)> + '_ {
        self.waits.get(&txn_id).into_iter().flatten().flat_map(move |r| {
            self.holds
                .get(r)
                .into_iter()
                .flatten()
                .filter(move |&&holder| holder != txn_id)
                .map(move |&holder| (r, holder))
        })
    }

    /// Depth-first search with recursion-stack coloring. Reports one cycle
    /// per back edge found.
    pub fn find_cycles(&self) -> Vec<DeadlockCycle> {
        let mut color = HashMap::new();
        let mut path = vec![];
        let mut via = vec![];
        let mut cycles = vec![];
        for &txn_id in self.waits.keys() {
            if !color.contains_key(&txn_id) {
                self.visit(txn_id, &mut color, &mut path, &mut via, &mut cycles);
            }
        }
        cycles
    }

    fn visit(
        &self,
        txn_id: TxnId,
        color: &mut HashMap<TxnId, Color>,
        path: &mut Vec<TxnId>,
        via: &mut Vec<LockTarget>,
        cycles: &mut Vec<DeadlockCycle>,
    ) {
        color.insert(txn_id, Color::Gray);
        path.push(txn_id);

        for (resource, holder) in self.blockers(txn_id) {
            match color.get(&holder) {
                None => {
                    via.push(resource.clone());
                    self.visit(holder, color, path, via, cycles);
                    via.pop();
                }
                Some(Color::Gray) => {
                    if let Some(start) = path.iter().position(|&t| t == holder) {
                        let mut resources = via[start..].to_vec();
                        resources.push(resource.clone());
                        cycles.push(DeadlockCycle {
                            transactions: path[start..].to_vec(),
                            resources,
                        });
                    }
                }
                Some(Color::Black) => {}
            }
        }

        path.pop();
        color.insert(txn_id, Color::Black);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Live waits-for graph, mutated by the lock manager and scanned by the
/// deadlock detector.
#[derive(Default)]
pub struct WaitsForGraph {
    inner: Mutex<GraphSnapshot>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `txn_id` is waiting on `resource`.
    pub fn wait(&self, txn_id: TxnId, resource: &LockTarget) {
        let mut inner = self.inner.lock().unwrap();
        inner.waits.entry(txn_id).or_default().insert(resource.clone());
    }

    pub fn stop_waiting(&self, txn_id: TxnId, resource: &LockTarget) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(resources) = inner.waits.get_mut(&txn_id) {
            resources.remove(resource);
            if resources.is_empty() {
                inner.waits.remove(&txn_id);
            }
        }
    }

    /// `txn_id` now holds `resource`.
    pub fn hold(&self, txn_id: TxnId, resource: &LockTarget) {
        let mut inner = self.inner.lock().unwrap();
        inner.holds.entry(resource.clone()).or_default().insert(txn_id);
    }

    /// Drop every edge touching `txn_id`.
    pub fn remove_transaction(&self, txn_id: TxnId) {
        let mut inner = self.inner.lock().unwrap();
        inner.waits.remove(&txn_id);
        inner.holds.retain(|_, txns| {
            txns.remove(&txn_id);
            !txns.is_empty()
        });
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.inner.lock().unwrap().clone()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().unwrap().edge_count()
    }

    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.inner.lock().unwrap().is_waiting(txn_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(name: &str) -> LockTarget {
        LockTarget::table("d", name)
    }

    #[test]
    fn two_cycle() {
        let graph = WaitsForGraph::new();
        graph.hold(1, &table("t1"));
        graph.hold(2, &table("t2"));
        graph.wait(1, &table("t2"));
        graph.wait(2, &table("t1"));

        let cycles = graph.snapshot().find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].transactions, vec![1, 2]);
        assert_eq!(cycles[0].resources, vec![table("t2"), table("t1")]);
        assert_eq!(cycles[0].youngest(), Some(2));
    }

    #[test]
    fn three_cycle() {
        let graph = WaitsForGraph::new();
        for (txn, held, wanted) in [(1, "a", "b"), (2, "b", "c"), (3, "c", "a")] {
            graph.hold(txn, &table(held));
            graph.wait(txn, &table(wanted));
        }
        let cycles = graph.snapshot().find_cycles();
        assert_eq!(cycles.len(), 1);
        let mut txns = cycles[0].transactions.clone();
        txns.sort();
        assert_eq!(txns, vec![1, 2, 3]);
    }

    #[test]
    fn chain_is_not_a_cycle() {
        let graph = WaitsForGraph::new();
        graph.hold(1, &table("a"));
        graph.wait(2, &table("a"));
        graph.hold(2, &table("b"));
        graph.wait(3, &table("b"));
        assert!(graph.snapshot().find_cycles().is_empty());
    }

    #[test]
    fn upgrade_is_not_self_deadlock() {
        let graph = WaitsForGraph::new();
        graph.hold(1, &table("a"));
        graph.hold(2, &table("a"));
        graph.wait(1, &table("a"));
        assert!(graph.snapshot().find_cycles().is_empty());

        // both holders upgrading does deadlock
        graph.wait(2, &table("a"));
        assert_eq!(graph.snapshot().find_cycles().len(), 1);
    }

    #[test]
    fn remove_transaction_breaks_cycle() {
        let graph = WaitsForGraph::new();
        graph.hold(1, &table("t1"));
        graph.hold(2, &table("t2"));
        graph.wait(1, &table("t2"));
        graph.wait(2, &table("t1"));
        assert_eq!(graph.edge_count(), 4);

        graph.remove_transaction(2);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.snapshot().find_cycles().is_empty());
        assert_eq!(
            graph.snapshot().edges(),
            vec![
                (GraphNode::Transaction(1), GraphNode::Resource(table("t2"))),
                (GraphNode::Resource(table("t1")), GraphNode::Transaction(1)),
            ]
        );
    }
}
