//! Per-swap mutual exclusion.
//!
//! All mutating operations on a given swap id are serialized through one
//! binary semaphore per id. Entries are created lazily and kept for the
//! process lifetime; swap ids are finite and bounded in practice.

use crate::{error::Error, swap::SwapId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<SwapId, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock for `id`, waiting if another handler
    /// holds it. The returned guard releases on every exit path, including
    /// panics and early returns.
    ///
    /// A poisoned registry is a broken invariant and fails the whole call
    /// rather than being silently swallowed.
    pub async fn acquire(&self, id: SwapId) -> anyhow::Result<OwnedMutexGuard<()>> {
        let entry = {
            let mut map = self.inner.lock().map_err(|_| Error::LockRegistry)?;
            Arc::clone(
                map.entry(id)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        Ok(entry.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_mutually_exclusive() {
        let registry = Arc::new(LockRegistry::new());

        let guard = registry.acquire(SwapId(1)).await.unwrap();

        let registry2 = Arc::clone(&registry);
        let contender = tokio::spawn(async move { registry2.acquire(SwapId(1)).await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let registry = LockRegistry::new();

        let _one = registry.acquire(SwapId(1)).await.unwrap();
        let _two = registry.acquire(SwapId(2)).await.unwrap();
    }
}
