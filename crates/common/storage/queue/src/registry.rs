// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reference-counted sharing of one [`Store`] per file.
//!
//! SQLite tolerates several pools on one file, but the write gate and the
//! rebuild lock only work when every user in the process goes through the
//! same [`Store`]. The registry hands out that single instance per path and
//! closes it when the last holder releases it.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    config::StoreConfig,
    error::{IoSnafu, Result},
    store::Store,
};

struct Slot {
    store: Arc<Store>,
    refs:  usize,
}

/// Path-keyed registry of open stores. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    slots: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry").finish_non_exhaustive()
    }
}

impl StoreRegistry {
    pub fn new() -> Self { Self::default() }

    /// Return the store for `config.path`, opening it on first use.
    ///
    /// Later callers share the first caller's instance and its settings.
    pub async fn acquire(&self, config: StoreConfig) -> Result<Arc<Store>> {
        let key = registry_key(&config.path)?;
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.get_mut(&key) {
            slot.refs += 1;
            debug!(path = %key.display(), refs = slot.refs, "Store shared");
            return Ok(slot.store.clone());
        }

        let store = Arc::new(Store::open(config).await?);
        slots.insert(
            key,
            Slot {
                store: store.clone(),
                refs:  1,
            },
        );
        Ok(store)
    }

    /// Drop one reference to the store at `path`; the last release closes it.
    /// Returns whether the store was closed.
    pub async fn release(&self, path: &Path) -> Result<bool> {
        let key = registry_key(path)?;
        let mut slots = self.slots.lock().await;

        let Some(slot) = slots.get_mut(&key) else {
            return Ok(false);
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            debug!(path = %key.display(), refs = slot.refs, "Store released");
            return Ok(false);
        }

        if let Some(slot) = slots.remove(&key) {
            slot.store.close().await?;
        }
        Ok(true)
    }

    /// Number of holders of the store at `path`.
    pub async fn refs(&self, path: &Path) -> Result<usize> {
        let key = registry_key(path)?;
        Ok(self.slots.lock().await.get(&key).map_or(0, |slot| slot.refs))
    }

    /// Number of stores currently open through this registry.
    pub async fn len(&self) -> usize { self.slots.lock().await.len() }

    pub async fn is_empty(&self) -> bool { self.slots.lock().await.is_empty() }
}

/// Absolute form of `path`. The file may not exist yet, so this does not
/// resolve symlinks.
fn registry_key(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).context(IoSnafu {
        context: format!("resolving {}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_acquire_shares_one_store_per_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let registry = StoreRegistry::new();

        let a = registry.acquire(StoreConfig::at(&path)).await.unwrap();
        let b = registry.acquire(StoreConfig::at(&path)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.refs(&path).await.unwrap(), 2);

        let other = registry
            .acquire(StoreConfig::at(dir.path().join("other.db")))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_last_release_closes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("refcount.db");
        let registry = StoreRegistry::new();

        let store = registry.acquire(StoreConfig::at(&path)).await.unwrap();
        registry.acquire(StoreConfig::at(&path)).await.unwrap();

        assert!(!registry.release(&path).await.unwrap());
        assert!(!store.is_closed().await);

        assert!(registry.release(&path).await.unwrap());
        assert!(store.is_closed().await);
        assert!(registry.is_empty().await);

        // Releasing an unknown path is a no-op.
        assert!(!registry.release(&path).await.unwrap());
    }
}
