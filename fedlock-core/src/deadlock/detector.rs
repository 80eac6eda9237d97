use super::{DeadlockCycle, GraphSnapshot};
use crate::lock::{AbortReason, LockManager};
use crate::txn::TxnId;
use crate::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Which transaction of a cycle gets aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// Highest transaction id, i.e. the most recently started.
    #[default]
    Youngest,
    Oldest,
    /// The one holding the fewest locks, ties go to the youngest.
    FewestLocks,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockStats {
    pub scans: u64,
    pub deadlocks_detected: u64,
    pub victims_aborted: u64,
}

pub struct DeadlockDetector {
    manager: Arc<LockManager>,
    policy: VictimPolicy,
    stats: Mutex<DeadlockStats>,
}

impl DeadlockDetector {
    pub fn new(manager: Arc<LockManager>, policy: VictimPolicy) -> Self {
        Self {
            manager,
            policy,
            stats: Mutex::new(DeadlockStats::default()),
        }
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.lock().unwrap().clone()
    }

    /// Snapshot the graph, find cycles and abort one victim per cycle.
    /// Returns every cycle found.
    pub fn scan_once(&self) -> Vec<DeadlockCycle> {
        let snapshot = self.manager.graph().snapshot();
        let cycles = snapshot.find_cycles();

        let mut victims = BTreeSet::new();
        for cycle in cycles.iter() {
            // an earlier victim already broke this one
            if cycle.transactions.iter().any(|t| victims.contains(t)) {
                continue;
            }
            let Some(victim) = self.choose_victim(cycle, &snapshot) else {
                continue;
            };
            if !self.manager.graph().is_waiting(victim) {
                debug!("txn {victim} stopped waiting before it could be aborted");
                continue;
            }
            warn!(
                "deadlock among txns {:?} on {:?}, aborting txn {victim}",
                cycle.transactions,
                cycle
                    .resources
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
            );
            victims.insert(victim);
            self.manager.abort(
                victim,
                AbortReason::Deadlock {
                    cycle: cycle.transactions.clone(),
                },
            );
        }

        let mut stats = self.stats.lock().unwrap();
        stats.scans += 1;
        stats.deadlocks_detected += cycles.len() as u64;
        stats.victims_aborted += victims.len() as u64;
        cycles
    }

    pub fn choose_victim(&self, cycle: &DeadlockCycle, snapshot: &GraphSnapshot) -> Option<TxnId> {
        match self.policy {
            VictimPolicy::Youngest => cycle.youngest(),
            VictimPolicy::Oldest => cycle.oldest(),
            VictimPolicy::FewestLocks => cycle
                .transactions
                .iter()
                .copied()
                .min_by_key(|&t| (snapshot.held_count(t), std::cmp::Reverse(t))),
        }
    }

    /// Run `scan_once` every `period` on a background thread.
    pub fn spawn(self: Arc<Self>, period: Duration) -> Result<DetectorHandle> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread = {
            let detector = self.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("deadlock_detector".to_owned())
                .spawn(move || detector.run(period, &stop))?
        };
        info!("deadlock detector started, period {period:?}");
        Ok(DetectorHandle {
            detector: self,
            stop,
            thread: Some(thread),
        })
    }

    fn run(&self, period: Duration, stop: &(Mutex<bool>, Condvar)) {
        let (stopped, signal) = stop;
        let mut stopped = stopped.lock().unwrap();
        loop {
            if *stopped {
                break;
            }
            stopped = signal.wait_timeout(stopped, period).unwrap().0;
            if *stopped {
                break;
            }
            // scan without holding the stop flag, abort takes other locks
            drop(stopped);
            self.scan_once();
            stopped = stop.0.lock().unwrap();
        }
        debug!("deadlock detector exit");
    }
}

/// Owns the detector thread; stops and joins it on drop.
pub struct DetectorHandle {
    detector: Arc<DeadlockDetector>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl DetectorHandle {
    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    pub fn stats(&self) -> DeadlockStats {
        self.detector.stats()
    }

    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let (stopped, signal) = &*self.stop;
            *stopped.lock().unwrap() = true;
            signal.notify_all();
        }
        if thread.join().is_err() {
            warn!("deadlock detector thread panicked");
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
