//! Keyed async mutex: at most one operation per host, queued FIFO.
//!
//! Tokio's mutex hands the lock to waiters in arrival order, and the owned
//! guard releases on drop, so a panicking workflow can never wedge a host.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct HostLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the host's lock. Concurrent callers queue; they
    /// are not rejected.
    pub async fn acquire(&self, host_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(host_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget a host's lock entry (host deleted). A holder keeps its guard;
    /// future acquires get a fresh lock.
    pub async fn remove(&self, host_id: &str) {
        let mut locks = self.locks.lock().await;
        locks.remove(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_queues_until_release() {
        let locks = Arc::new(HostLocks::new());
        let guard = locks.acquire("h1").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.acquire("h1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should get the lock after release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_hosts_do_not_contend() {
        let locks = HostLocks::new();
        let _a = locks.acquire("h1").await;
        // Completes immediately; a shared lock would deadlock here.
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("h2"))
            .await
            .expect("independent host must not block");
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let locks = Arc::new(HostLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("h1").await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("h1").await;
                order.lock().await.push(i);
            }));
            // Deterministic queueing order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
