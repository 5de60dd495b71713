//! Versioned settings store with change notification.
//!
//! `ConfigStore<T>` holds the current value behind an `RwLock` and bumps a
//! version on every replacement. Workers read the value at the top of each
//! cycle; the scheduled jobs also await [`ConfigWatcher::changed`] so a
//! reloaded schedule replaces the sleep already in progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, watch};

/// Shared, reloadable settings.
pub struct ConfigStore<T> {
    inner: Arc<Shared<T>>,
}

struct Shared<T> {
    value: RwLock<T>,
    version: AtomicU64,
    version_tx: watch::Sender<u64>,
}

/// Notified each time the owning [`ConfigStore`] is replaced.
pub struct ConfigWatcher {
    version_rx: watch::Receiver<u64>,
}

impl<T> ConfigStore<T> {
    pub fn new(initial: T) -> Self {
        let (version_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Shared {
                value: RwLock::new(initial),
                version: AtomicU64::new(0),
                version_tx,
            }),
        }
    }

    /// Swap in a new value and wake every watcher. Returns the new version.
    pub async fn update(&self, value: T) -> u64 {
        {
            let mut guard = self.inner.value.write().await;
            *guard = value;
        }
        let version = self.inner.version.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.inner.version_tx.send(version);
        version
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.value.read().await
    }

    pub fn subscribe(&self) -> ConfigWatcher {
        ConfigWatcher {
            version_rx: self.inner.version_tx.subscribe(),
        }
    }
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConfigWatcher {
    /// Wait for the next update. Errors once the store is gone.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.version_rx.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_bumps_version_and_notifies() {
        let store = ConfigStore::new(1u32);
        let mut watcher = store.subscribe();

        assert_eq!(store.update(2).await, 1);
        watcher.changed().await.unwrap();
        assert_eq!(*store.read().await, 2);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = ConfigStore::new(String::from("a"));
        let other = store.clone();
        assert_eq!(other.update(String::from("b")).await, 1);
        assert_eq!(*store.read().await, "b");
        assert_eq!(store.update(String::from("c")).await, 2);
    }
}
