//! Per-lead mutual exclusion within one process. Cross-process safety comes
//! from the compare-and-swap on `Lead.version`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LeadLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LeadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a lead.
    pub async fn lock(&self, lead_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(lead_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
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
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_lead_is_serialized() {
        let locks = Arc::new(LeadLocks::new());
        let guard = locks.lock("lead-1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("lead-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_other_leads_do_not_block() {
        let locks = LeadLocks::new();
        let _a = locks.lock("lead-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("lead-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_prune_removes_idle_entries() {
        let locks = LeadLocks::new();
        {
            let _g = locks.lock("lead-1").await;
            locks.prune();
            assert_eq!(locks.len(), 1);
        }
        locks.prune();
        assert!(locks.is_empty());
    }
}
