use super::{Transaction, TxnId, TxnOutcome};
use crate::config::{Config, LockConfig};
use crate::deadlock::{DeadlockDetector, DeadlockStats, DetectorHandle};
use crate::lock::{AbortReason, LockManager};
use crate::storage::AdapterRegistry;
use crate::translate::Translator;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// What a running transaction needs, shared with the worker threads.
struct Context {
    lock_config: LockConfig,
    lock_manager: Arc<LockManager>,
    translator: Arc<dyn Translator>,
    adapters: AdapterRegistry,
    next_txn_id: AtomicU64,
}

/// Fixed set of named threads draining a job queue.
struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(size: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("txn_worker_{i}"))
                .spawn(move || Self::work(rx))?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    fn work(rx: Arc<Mutex<Receiver<Job>>>) {
        loop {
            // hold the receiver only while taking a job
            let job = rx.lock().unwrap().recv();
            match job {
                Ok(job) => job(),
                Err(_) => break,
            }
        }
    }

    fn spawn(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => tx
                .send(job)
                .map_err(|e| Error::Internal(format!("worker pool is gone: {e}"))),
            None => Err(Error::Internal("worker pool is shut down".to_owned())),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the queue lets every worker finish its job and exit
        self.sender.lock().unwrap().take();
        for worker in self.workers.lock().unwrap().drain(..) {
            if worker.join().is_err() {
                warn!("transaction worker panicked");
            }
        }
    }
}

/// Result of a transaction submitted to the worker pool.
pub struct TxnTicket {
    txn_id: TxnId,
    rx: Receiver<Result<TxnOutcome>>,
}

impl TxnTicket {
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn wait(self) -> Result<TxnOutcome> {
        match self.rx.recv() {
            Ok(res) => res,
            Err(e) => Err(Error::Internal(format!(
                "txn {} recv outcome error: {e}",
                self.txn_id
            ))),
        }
    }
}

/// Entry point of the middleware: hands out transaction ids, runs
/// transactions and owns the deadlock detector.
#[derive(Clone)]
pub struct TransactionManager {
    ctx: Arc<Context>,
    pool: Arc<WorkerPool>,
    detector: Arc<Mutex<DetectorHandle>>,
}

impl TransactionManager {
    pub fn open(
        config: &Config,
        translator: Arc<dyn Translator>,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        config.validate()?;
        adapters.check(config)?;

        let lock_manager = Arc::new(LockManager::new(config.lock.fairness));
        let detector = Arc::new(DeadlockDetector::new(
            lock_manager.clone(),
            config.lock.victim_policy,
        ))
        .spawn(config.lock.detector_period())?;
        let pool = WorkerPool::new(config.workers)?;
        info!(
            "transaction manager open: {} workers, {} storages, {:?}",
            config.workers,
            adapters.len(),
            config.lock
        );

        Ok(Self {
            ctx: Arc::new(Context {
                lock_config: config.lock.clone(),
                lock_manager,
                translator,
                adapters,
                next_txn_id: AtomicU64::new(1),
            }),
            pool: Arc::new(pool),
            detector: Arc::new(Mutex::new(detector)),
        })
    }

    pub fn allocate_txn_id(&self) -> TxnId {
        self.ctx.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// A transaction whose locks the caller drives by hand.
    pub fn begin(&self) -> Transaction {
        let txn_id = self.allocate_txn_id();
        debug!("begin txn {txn_id}");
        Transaction::new(txn_id, self.ctx.lock_manager.clone(), &self.ctx.lock_config)
    }

    /// Run `statements` as one transaction on the caller's thread.
    pub fn execute(&self, statements: &[String]) -> Result<TxnOutcome> {
        let txn = self.begin();
        txn.run(statements, self.ctx.translator.as_ref(), &self.ctx.adapters)
    }

    /// Queue `statements` as one transaction on the worker pool.
    pub fn submit(&self, statements: Vec<String>) -> Result<TxnTicket> {
        let txn = self.begin();
        let txn_id = txn.id();
        let (tx, rx): (SyncSender<Result<TxnOutcome>>, _) = mpsc::sync_channel(1);
        let ctx = self.ctx.clone();
        self.pool.spawn(Box::new(move || {
            let res = txn.run(&statements, ctx.translator.as_ref(), &ctx.adapters);
            if tx.send(res).is_err() {
                debug!("txn {txn_id} outcome dropped by submitter");
            }
        }))?;
        Ok(TxnTicket { txn_id, rx })
    }

    /// Cancel a running transaction.
    pub fn abort(&self, txn_id: TxnId) {
        self.ctx.lock_manager.abort(txn_id, AbortReason::Cancelled);
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.ctx.lock_manager
    }

    pub fn deadlock_stats(&self) -> DeadlockStats {
        self.detector.lock().unwrap().stats()
    }

    pub fn lock_config(&self) -> &LockConfig {
        &self.ctx.lock_config
    }
}
