//! Per-group snapshot persistence chains.
//!
//! Every mutation enqueues a persist-and-publish task on its group's chain;
//! tasks of one group run strictly FIFO and never overlap, so the store and
//! bus always see writes in version order even though the mutation lock is
//! not held during I/O. `flush` awaits the tail of a chain and is called
//! before the mutation lock is released, so cross-pod observers never read
//! a state older than the lock holder's view.
//!
//! Store or bus errors inside a task are logged and swallowed; the next
//! task still runs (the next mutation's persist step is the retry).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::group::types::Snapshot;
use crate::protocol_constants::PIPELINE_CHANNEL_CAPACITY;
use crate::store::{SnapshotBus, SnapshotStore};

enum ChainTask {
    /// Write to the store, then publish on the bus.
    Persist(Snapshot),
    /// The group ended: remove its stored snapshot.
    Retire,
    /// Barrier: resolves when every task enqueued before it has finished.
    Flush(oneshot::Sender<()>),
}

pub struct SnapshotPipeline {
    chains: DashMap<String, mpsc::Sender<ChainTask>>,
    store: Arc<dyn SnapshotStore>,
    bus: Arc<dyn SnapshotBus>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SnapshotPipeline {
    pub fn new(store: Arc<dyn SnapshotStore>, bus: Arc<dyn SnapshotBus>) -> Self {
        Self {
            chains: DashMap::new(),
            store,
            bus,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Appends a persist-and-publish task to the group's chain. Blocks when
    /// the chain is saturated (never drops).
    pub async fn enqueue(&self, snapshot: Snapshot) {
        let chain = self.chain(&snapshot.group_id);
        if chain.send(ChainTask::Persist(snapshot)).await.is_err() {
            log::warn!("[SnapshotPipeline] Chain closed, persist task dropped");
        }
    }

    /// Appends a store-delete for an ended group, waits for it, and retires
    /// the chain.
    pub async fn retire(&self, group_id: &str) {
        let chain = self.chain(group_id);
        if chain.send(ChainTask::Retire).await.is_err() {
            log::warn!("[SnapshotPipeline] Chain closed, retire task dropped");
        }
        let (done_tx, done_rx) = oneshot::channel();
        if chain.send(ChainTask::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        // Dropping the sender lets the worker drain and exit
        self.chains.remove(group_id);
    }

    /// Awaits the tail of the group's chain. A group with no chain has
    /// nothing pending.
    pub async fn flush(&self, group_id: &str) {
        let Some(chain) = self.chains.get(group_id).map(|c| c.clone()) else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if chain.send(ChainTask::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drains every chain and waits for the workers to finish.
    pub async fn shutdown(&self) {
        self.chains.clear();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        log::info!("[SnapshotPipeline] Drained all chains");
    }

    fn chain(&self, group_id: &str) -> mpsc::Sender<ChainTask> {
        use dashmap::mapref::entry::Entry;
        match self.chains.entry(group_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
                entry.insert(tx.clone());
                let worker = run_chain(
                    group_id.to_string(),
                    rx,
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                );
                self.workers.lock().push(tokio::spawn(worker));
                tx
            }
        }
    }
}

async fn run_chain(
    group_id: String,
    mut tasks: mpsc::Receiver<ChainTask>,
    store: Arc<dyn SnapshotStore>,
    bus: Arc<dyn SnapshotBus>,
) {
    while let Some(task) = tasks.recv().await {
        match task {
            ChainTask::Persist(snapshot) => {
                if let Err(e) = store.set(&snapshot).await {
                    log::warn!(
                        "[SnapshotPipeline] Persist failed for {} v{}: {}",
                        group_id,
                        snapshot.version,
                        e
                    );
                }
                if let Err(e) = bus.publish(&snapshot).await {
                    log::warn!(
                        "[SnapshotPipeline] Publish failed for {} v{}: {}",
                        group_id,
                        snapshot.version,
                        e
                    );
                }
            }
            ChainTask::Retire => {
                if let Err(e) = store.delete(&group_id).await {
                    log::warn!("[SnapshotPipeline] Delete failed for {}: {}", group_id, e);
                }
            }
            ChainTask::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
