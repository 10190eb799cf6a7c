//! The shared work channel, the deferred queue and the worker pool.
//!
//! Every state transition of every agreement flows through one unbounded
//! channel of tagged work items. N workers drain it; the per-agreement lock
//! inside the processor serializes items for the same agreement while items
//! for distinct agreements run in parallel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use agbot_common::agreement::TerminationReason;
use agbot_common::messages::{BlockchainUpdate, ProposalReply};
use agbot_common::policy::Policy;

use crate::error::BotError;

/// What a worker should do for one agreement.
#[derive(Clone, Debug)]
pub enum WorkKind {
    MakeProposal { device_id: String, policy: Policy },
    ReplyReceived { reply: ProposalReply },
    ProducerUpdate { update: BlockchainUpdate },
    ConsumerUpdateAck,
    AsyncUpdate,
    AsyncWrite,
    BCRecorded,
    BCTerminated { reason: TerminationReason },
    AgreementTimeout { reason: TerminationReason },
    PolicyChanged,
    PolicyDeleted,
    WorkloadUpgrade,
}

impl WorkKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkKind::MakeProposal { .. } => "MakeProposal",
            WorkKind::ReplyReceived { .. } => "ReplyReceived",
            WorkKind::ProducerUpdate { .. } => "ProducerUpdate",
            WorkKind::ConsumerUpdateAck => "ConsumerUpdateAck",
            WorkKind::AsyncUpdate => "AsyncUpdate",
            WorkKind::AsyncWrite => "AsyncWrite",
            WorkKind::BCRecorded => "BCRecorded",
            WorkKind::BCTerminated { .. } => "BCTerminated",
            WorkKind::AgreementTimeout { .. } => "AgreementTimeout",
            WorkKind::PolicyChanged => "PolicyChanged",
            WorkKind::PolicyDeleted => "PolicyDeleted",
            WorkKind::WorkloadUpgrade => "WorkloadUpgrade",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkItem {
    pub agreement_id: String,
    pub protocol: String,
    pub kind: WorkKind,
}

impl WorkItem {
    pub fn new(agreement_id: &str, protocol: &str, kind: WorkKind) -> Self {
        Self {
            agreement_id: agreement_id.to_string(),
            protocol: protocol.to_string(),
            kind,
        }
    }
}

/// Sender half of the work channel plus the deferred queue for items whose
/// ledger is not ready yet.
pub struct WorkQueue {
    tx: Mutex<Option<UnboundedSender<WorkItem>>>,
    deferred: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> (Arc<WorkQueue>, UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(WorkQueue {
                tx: Mutex::new(Some(tx)),
                deferred: Mutex::new(VecDeque::new()),
            }),
            rx,
        )
    }

    pub fn enqueue(&self, item: WorkItem) {
        trace!(
            "enqueue {} for agreement {}",
            item.kind.name(),
            item.agreement_id
        );
        let tx = self.tx.lock().expect("work channel lock poisoned");
        // After close the pool is shutting down; the item is intentionally
        // dropped then.
        match tx.as_ref() {
            Some(tx) if tx.send(item).is_ok() => {}
            _ => debug!("work channel closed, dropping item"),
        }
    }

    /// Stop accepting work. Workers drain what is already queued, finish
    /// their current item and exit.
    pub fn close(&self) {
        self.tx.lock().expect("work channel lock poisoned").take();
    }

    /// Park an item until its ledger becomes ready.
    pub fn defer(&self, item: WorkItem) {
        debug!(
            "deferring {} for agreement {} until ledger is ready",
            item.kind.name(),
            item.agreement_id
        );
        self.deferred
            .lock()
            .expect("deferred queue lock poisoned")
            .push_back(item);
    }

    /// Move the whole deferred batch back onto the work channel in
    /// insertion order. Returns how many items were released.
    pub fn release_deferred(&self) -> usize {
        let batch: Vec<WorkItem> = {
            let mut deferred = self
                .deferred
                .lock()
                .expect("deferred queue lock poisoned");
            deferred.drain(..).collect()
        };
        let count = batch.len();
        for item in batch {
            self.enqueue(item);
        }
        count
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred
            .lock()
            .expect("deferred queue lock poisoned")
            .len()
    }
}

/// Implemented by the consumer protocol handler; split out so the pool can
/// be exercised on its own.
#[async_trait]
pub trait WorkProcessor: Send + Sync + 'static {
    async fn process(&self, item: WorkItem) -> Result<(), BotError>;
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers draining `rx`. Workers exit when the channel
    /// is closed and drained; each finishes its current item first.
    pub fn spawn(
        count: usize,
        rx: UnboundedReceiver<WorkItem>,
        processor: Arc<dyn WorkProcessor>,
    ) -> Self {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let rx = rx.clone();
            let processor = processor.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else {
                        trace!("worker {} exiting, channel closed", worker_id);
                        break;
                    };
                    let kind = item.kind.name();
                    let agreement_id = item.agreement_id.clone();
                    if let Err(e) = processor.process(item).await {
                        warn!(
                            "worker {}: {} for agreement {} failed: {}",
                            worker_id, kind, agreement_id, e
                        );
                    }
                }
            }));
        }
        Self { handles }
    }

    /// Wait for every worker to exit. Close the queue (drop all senders)
    /// first or this never returns.
    pub async fn join(self) {
        futures::future::join_all(self.handles).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        processed: AtomicUsize,
    }

    #[async_trait]
    impl WorkProcessor for CountingProcessor {
        async fn process(&self, _item: WorkItem) -> Result<(), BotError> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn item(id: &str, kind: WorkKind) -> WorkItem {
        WorkItem::new(id, "standard", kind)
    }

    #[tokio::test]
    async fn test_pool_drains_channel_and_exits() {
        let (queue, rx) = WorkQueue::new();
        let processor = Arc::new(CountingProcessor {
            processed: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(3, rx, processor.clone());

        for i in 0..20 {
            queue.enqueue(item(&format!("ag-{}", i), WorkKind::BCRecorded));
        }
        drop(queue);
        pool.join().await;

        assert_eq!(processor.processed.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_close_lets_workers_finish_and_exit() {
        let (queue, rx) = WorkQueue::new();
        let processor = Arc::new(CountingProcessor {
            processed: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(2, rx, processor.clone());

        queue.enqueue(item("ag-1", WorkKind::BCRecorded));
        queue.close();
        pool.join().await;

        assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
        // Late work after close is dropped, not panicked on
        queue.enqueue(item("ag-2", WorkKind::BCRecorded));
    }

    #[tokio::test]
    async fn test_deferred_batch_released_in_order() {
        let (queue, mut rx) = WorkQueue::new();
        queue.defer(item("ag-1", WorkKind::AsyncUpdate));
        queue.defer(item("ag-1", WorkKind::AsyncWrite));
        queue.defer(item("ag-2", WorkKind::AsyncUpdate));
        assert_eq!(queue.deferred_len(), 3);

        assert_eq!(queue.release_deferred(), 3);
        assert_eq!(queue.deferred_len(), 0);

        let first = rx.recv().await.expect("first item");
        assert_eq!(first.agreement_id, "ag-1");
        assert!(matches!(first.kind, WorkKind::AsyncUpdate));
        let second = rx.recv().await.expect("second item");
        assert!(matches!(second.kind, WorkKind::AsyncWrite));
        let third = rx.recv().await.expect("third item");
        assert_eq!(third.agreement_id, "ag-2");
    }
}
