//! Per-`image_id` serialization

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async lock per `image_id`.
///
/// Two runs for the same id share a working directory and a key prefix, so
/// the second waits for the first to finish. Distinct ids never contend.
#[derive(Debug, Default)]
pub struct ImageLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one run
#[derive(Debug)]
pub struct ImageGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ImageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, image_id: &str) -> ImageGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Forget locks nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(image_id.to_string()).or_default())
        };

        ImageGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Ids with a run in flight or waiting
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(ImageLocks::new());
        let first = locks.acquire("slide-001").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("slide-001").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_contend() {
        let locks = ImageLocks::new();
        let _a = locks.acquire("slide-001").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("slide-002"))
            .await
            .unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let locks = ImageLocks::new();
        drop(locks.acquire("slide-001").await);
        let _b = locks.acquire("slide-002").await;
        assert_eq!(locks.active(), 1);
        assert_eq!(locks.locks.lock().unwrap().len(), 1);
    }
}
