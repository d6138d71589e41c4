//! Deferred remote writes for the write-behind policy.
//!
//! Operations are applied strictly in enqueue order by a single worker, so an
//! invalidation queued after a pending write always lands after it. Callers
//! that need the outcome submit with an acknowledgement and await it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::remote::RemoteCacheAdapter;
use crate::stats::CacheMetrics;

/// A remote-tier operation waiting for the worker.
#[derive(Debug, Clone)]
pub enum RemoteOp {
    Set {
        key: String,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        tags: Vec<String>,
    },
    Delete {
        key: String,
    },
    ClearTags {
        tags: Vec<String>,
    },
    ClearPattern {
        pattern: String,
    },
    ClearAll,
}

impl RemoteOp {
    /// Apply to the remote tier. Returns the number of keys written or removed.
    pub async fn apply(self, remote: &RemoteCacheAdapter) -> u64 {
        match self {
            RemoteOp::Set {
                key,
                value,
                ttl,
                tags,
            } => {
                let stored = remote.set(&key, &value, ttl, &tags).await;
                if !stored {
                    tracing::warn!(key = %key, "write-behind L2 write failed");
                }
                u64::from(stored)
            }
            RemoteOp::Delete { key } => u64::from(remote.delete(&key).await),
            RemoteOp::ClearTags { tags } => remote.clear_tags(&tags).await,
            RemoteOp::ClearPattern { pattern } => remote.clear_pattern(&pattern).await,
            RemoteOp::ClearAll => remote.clear_all().await,
        }
    }
}

struct Queued {
    op: RemoteOp,
    done: Option<oneshot::Sender<u64>>,
}

/// Bounded queue plus the worker task draining it.
pub struct WriteBehindQueue {
    tx: Mutex<Option<mpsc::Sender<Queued>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<CacheMetrics>,
}

impl WriteBehindQueue {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub fn spawn(
        remote: Arc<RemoteCacheAdapter>,
        capacity: usize,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Queued>(capacity);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker = tokio::spawn(async move {
            while let Some(Queued { op, done }) = rx.recv().await {
                let applied = op.apply(&remote).await;
                worker_pending.fetch_sub(1, Ordering::AcqRel);
                if let Some(done) = done {
                    // The submitter may have given up waiting
                    let _ = done.send(applied);
                }
            }
            tracing::debug!("write-behind worker drained and stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
            metrics,
        }
    }

    /// Queue an operation without waiting. Returns false when the queue is full
    /// or already shut down; the operation is dropped and counted in that case.
    pub fn enqueue(&self, op: RemoteOp) -> bool {
        match self.try_enqueue(op) {
            Ok(()) => true,
            Err(op) => {
                self.metrics.record_write_behind_dropped();
                tracing::warn!(op = ?op, "write-behind queue rejected operation");
                false
            }
        }
    }

    /// Like `enqueue`, but hands a rejected operation back to the caller.
    pub fn try_enqueue(&self, op: RemoteOp) -> Result<(), RemoteOp> {
        self.push(Queued { op, done: None })
    }

    /// Queue an operation behind everything already pending, waiting for room
    /// if the queue is full. The receiver resolves with the operation's result
    /// once the worker has applied it. Fails only after shutdown.
    pub async fn submit(&self, op: RemoteOp) -> Result<oneshot::Receiver<u64>, RemoteOp> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(op);
        };
        let Ok(permit) = tx.reserve().await else {
            return Err(op);
        };

        let (done, applied) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(Queued {
            op,
            done: Some(done),
        });
        Ok(applied)
    }

    fn push(&self, queued: Queued) -> Result<(), RemoteOp> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(queued.op);
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.try_send(queued).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            e.into_inner().op
        })
    }

    /// Whether queued operations have not been applied yet.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting operations and wait until the queue is drained.
    pub async fn shutdown(&self) {
        // Dropping the sender lets the worker finish once the queue is empty
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::remote::MemoryStore;

    fn remote(store: Arc<MemoryStore>, metrics: Arc<CacheMetrics>) -> Arc<RemoteCacheAdapter> {
        Arc::new(RemoteCacheAdapter::new(
            store,
            &CacheConfig::default(),
            metrics,
        ))
    }

    #[tokio::test]
    async fn test_operations_applied_in_order() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let adapter = remote(store, metrics.clone());
        let queue = WriteBehindQueue::spawn(Arc::clone(&adapter), 16, metrics);

        assert!(queue.enqueue(RemoteOp::Set {
            key: "k".to_string(),
            value: Arc::new(b"v".to_vec()),
            ttl: Duration::ZERO,
            tags: vec![],
        }));
        assert!(queue.enqueue(RemoteOp::Delete {
            key: "k".to_string()
        }));
        assert!(queue.enqueue(RemoteOp::Set {
            key: "other".to_string(),
            value: Arc::new(b"v".to_vec()),
            ttl: Duration::ZERO,
            tags: vec![],
        }));

        queue.shutdown().await;

        assert!(!queue.has_pending());
        assert!(adapter.get("k").await.is_none());
        assert!(adapter.get("other").await.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_hands_operation_back() {
        let metrics = Arc::new(CacheMetrics::new());
        let adapter = remote(Arc::new(MemoryStore::new()), metrics.clone());
        let queue = WriteBehindQueue::spawn(adapter, 1, metrics.clone());

        // Fill faster than a current_thread worker can drain: it never runs between these calls
        let mut rejected = 0;
        for i in 0..4 {
            if let Err(op) = queue.try_enqueue(RemoteOp::Delete { key: format!("k{i}") }) {
                assert!(matches!(op, RemoteOp::Delete { .. }));
                rejected += 1;
            }
        }
        assert!(rejected > 0);
        assert!(!queue.enqueue(RemoteOp::ClearAll));

        let stats = metrics.snapshot(Default::default());
        assert_eq!(stats.write_behind_dropped, 1);

        queue.shutdown().await;
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_resolves_after_earlier_operations() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let adapter = remote(store, metrics.clone());
        let queue = WriteBehindQueue::spawn(Arc::clone(&adapter), 16, metrics);

        assert!(queue.enqueue(RemoteOp::Set {
            key: "k".to_string(),
            value: Arc::new(b"v".to_vec()),
            ttl: Duration::ZERO,
            tags: vec![],
        }));
        let done = queue
            .submit(RemoteOp::Delete {
                key: "k".to_string(),
            })
            .await
            .unwrap();

        // The delete saw the queued write, so it removed one key
        assert_eq!(done.await.unwrap(), 1);
        assert!(adapter.get("k").await.is_none());

        queue.shutdown().await;
        assert!(matches!(
            queue.submit(RemoteOp::ClearAll).await,
            Err(RemoteOp::ClearAll)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let metrics = Arc::new(CacheMetrics::new());
        let adapter = remote(Arc::new(MemoryStore::new()), metrics.clone());
        let queue = WriteBehindQueue::spawn(adapter, 4, metrics);

        queue.shutdown().await;
        assert!(!queue.enqueue(RemoteOp::ClearAll));
    }
}
