//! Per-agreement mutual exclusion across the worker pool.
//!
//! Each agreement id maps to one async mutex. A worker holds the lock for
//! the whole read-decide-persist sequence of one work item and releases it
//! before any network send. Locks for distinct ids are independent.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct AgreementLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AgreementLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one agreement id, waiting if a worker already
    /// holds it.
    pub async fn lock(&self, agreement_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(agreement_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop lock entries no one is holding or waiting on. Called from the
    /// sweep driver to keep the table bounded.
    pub fn prune(&self) {
        self.locks
            .retain(|_, mutex| Arc::strong_count(mutex) > 1 || mutex.try_lock().is_err());
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_at_most_one_worker_per_id() {
        let locks = Arc::new(AgreementLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("agreement-a").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_block() {
        let locks = AgreementLocks::new();
        let _a = locks.lock("agreement-a").await;
        // Must complete immediately even though "agreement-a" is held
        tokio::time::timeout(Duration::from_millis(50), locks.lock("agreement-b"))
            .await
            .expect("independent lock acquired");
    }

    #[tokio::test]
    async fn test_prune_drops_idle_entries() {
        let locks = AgreementLocks::new();
        {
            let _guard = locks.lock("agreement-a").await;
            locks.prune();
            assert_eq!(locks.len(), 1);
        }
        locks.prune();
        assert!(locks.is_empty());
    }
}
