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

//! File level rebuild and crash recovery.
//!
//! Deleting entries frees pages inside the SQLite file but never shrinks it.
//! A rebuild copies the live content into a fresh file:
//!
//! ```text
//! 1. checkpoint the WAL and close every connection
//! 2. rename  store.db -> store.db.bak   (plus -wal / -shm sidecars)
//! 3. open a fresh store.db
//! 4. replay collections, generators and entries from the backup
//! 5. delete store.db.bak
//! ```
//!
//! A failure in steps 2-4 discards the fresh file, renames the backup back
//! and reopens it. If that rollback fails too the store stays closed and the
//! error is fatal. A crash part way leaves the backup on disk, which
//! [`Store::open`] refuses until [`Store::recover`] has run.

use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use snafu::{IntoError, OptionExt, ResultExt};
use sqlx::SqlitePool;
use tokio::sync::RwLockWriteGuard;
use tracing::{error, info, warn};

use super::{Store, StoreState, connect, connect_raw, file_size, path_exists};
use crate::{
    config::{StoreConfig, with_suffix},
    error::{
        IoSnafu, QueueError, RebuildFailedSnafu, RebuildStage, RecoveryRequiredSnafu, Result,
        RollbackFailedSnafu, StorageSnafu, StoreClosedSnafu, TransactionTimeoutSnafu,
    },
};

/// SQLite sidecar files that travel with the main file.
const SIDECARS: [&str; 2] = ["-wal", "-shm"];

/// Outcome of a successful rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Collections replayed into the fresh file.
    pub collections: u64,
    /// Entries replayed into the fresh file.
    pub entries:     u64,
    /// File size before the rebuild, in bytes.
    pub size_before: u64,
    /// File size after the rebuild, in bytes.
    pub size_after:  u64,
}

/// What [`Store::recover`] found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No backup; nothing to do.
    Clean,
    /// The backup was replayed into a fresh store and deleted.
    Replayed { collections: u64, entries: u64 },
    /// The live store was already complete; the leftover backup was deleted.
    StaleBackupRemoved,
}

/// Points of the rebuild cycle where tests can force a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) enum FaultPoint {
    Stage(RebuildStage),
    Rollback,
}

#[derive(Debug, Default)]
struct ReplayStats {
    collections: u64,
    entries:     u64,
}

impl Store {
    /// Rebuild the store file to reclaim space freed by deletions.
    ///
    /// Waits for in-flight transactions and blocks new ones until the fresh
    /// file is live. On error the store is either back on the original file
    /// (`RebuildFailed`) or closed for manual recovery (`RollbackFailed`).
    #[tracing::instrument(
        level = "info",
        skip(self),
        fields(path = %self.config.path.display()),
        err
    )]
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let timeout = self.config.transaction_timeout;
        let mut state = tokio::time::timeout(timeout, self.state.write())
            .await
            .ok()
            .context(TransactionTimeoutSnafu {
                kind: "exclusive",
                timeout,
            })?;
        let pool = state.pool.take().context(StoreClosedSnafu)?;

        let path = self.config.path.clone();
        let backup = self.config.backup_path();

        match path_exists(&backup).await {
            Ok(false) => {}
            Ok(true) => {
                state.pool = Some(pool);
                return Err(RebuildFailedSnafu {
                    path,
                    stage: RebuildStage::Rename,
                }
                .into_error(RecoveryRequiredSnafu { backup }.build()));
            }
            Err(err) => {
                state.pool = Some(pool);
                return Err(RebuildFailedSnafu {
                    path,
                    stage: RebuildStage::Rename,
                }
                .into_error(err));
            }
        }

        if let Err(err) = checkpoint(&pool, &path).await {
            state.pool = Some(pool);
            return Err(RebuildFailedSnafu {
                path,
                stage: RebuildStage::Close,
            }
            .into_error(err));
        }
        pool.close().await;
        let size_before = file_size(&path).await.unwrap_or_default();

        if let Err(err) = move_store_files(&path, &backup).await {
            return Err(self.roll_back(&mut state, RebuildStage::Rename, err).await);
        }

        let reopened = async {
            self.fault(FaultPoint::Stage(RebuildStage::Reopen))?;
            connect(&path, &self.config, true).await
        }
        .await;
        let fresh = match reopened {
            Ok(fresh) => fresh,
            Err(err) => return Err(self.roll_back(&mut state, RebuildStage::Reopen, err).await),
        };

        let replayed = async {
            self.fault(FaultPoint::Stage(RebuildStage::Replay))?;
            replay_from(&backup, &fresh, &self.config).await
        }
        .await;
        let stats = match replayed {
            Ok(stats) => stats,
            Err(err) => {
                fresh.close().await;
                return Err(self.roll_back(&mut state, RebuildStage::Replay, err).await);
            }
        };

        state.pool = Some(fresh);
        drop(state);

        remove_store_files(&backup)
            .await
            .context(RebuildFailedSnafu {
                path: path.clone(),
                stage: RebuildStage::Cleanup,
            })?;

        let size_after = file_size(&path).await.unwrap_or_default();
        info!(
            collections = stats.collections,
            entries = stats.entries,
            size_before,
            size_after,
            "Store rebuilt"
        );

        Ok(RebuildReport {
            collections: stats.collections,
            entries: stats.entries,
            size_before,
            size_after,
        })
    }

    /// Puts the backup back in place and reopens it. Returns the error the
    /// rebuild should surface.
    async fn roll_back(
        &self,
        state: &mut RwLockWriteGuard<'_, StoreState>,
        stage: RebuildStage,
        cause: QueueError,
    ) -> QueueError {
        let path = self.config.path.clone();
        let backup = self.config.backup_path();
        warn!(%stage, error = %cause, "Rebuild failed, rolling back");

        let restored = async {
            self.fault(FaultPoint::Rollback)?;
            if path_exists(&backup).await? {
                remove_store_files(&path).await?;
                move_store_files(&backup, &path).await?;
            }
            connect(&path, &self.config, false).await
        }
        .await;

        match restored {
            Ok(pool) => {
                state.pool = Some(pool);
                info!(path = %path.display(), "Rolled back to the original store");
                RebuildFailedSnafu { path, stage }.into_error(cause)
            }
            Err(rollback) => {
                error!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %rollback,
                    "Rollback failed, store left closed"
                );
                RollbackFailedSnafu {
                    path,
                    backup,
                    stage,
                    cause: cause.to_string(),
                }
                .into_error(rollback)
            }
        }
    }

    /// Fails with an injected IO error if a test armed `point`.
    #[cfg(test)]
    fn fault(&self, point: FaultPoint) -> Result<()> {
        let armed = self
            .faults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&point);
        if armed {
            return Err(IoSnafu {
                context: format!("injected fault at {point:?}"),
            }
            .into_error(std::io::Error::other("injected")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    const fn fault(&self, _point: FaultPoint) -> Result<()> { Ok(()) }

    #[cfg(test)]
    pub(crate) fn arm_faults(&self, points: impl IntoIterator<Item = FaultPoint>) {
        self.faults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(points);
    }

    /// Resolve a backup left behind by an interrupted rebuild.
    ///
    /// - no backup: [`RecoveryOutcome::Clean`]
    /// - backup, and the live file is missing or has no collections: the backup
    ///   is replayed into a fresh live file
    /// - backup, and the live file has content: the replay had finished before
    ///   the crash, so the backup is deleted
    #[tracing::instrument(level = "info", skip_all, fields(path = %config.path.display()), err)]
    pub async fn recover(config: &StoreConfig) -> Result<RecoveryOutcome> {
        let path = &config.path;
        let backup = config.backup_path();
        if !path_exists(&backup).await? {
            return Ok(RecoveryOutcome::Clean);
        }

        if path_exists(path).await? {
            let live = connect(path, config, false).await?;
            let populated = has_collections(&live).await;
            live.close().await;

            if populated? {
                remove_store_files(&backup).await?;
                warn!(backup = %backup.display(), "Removed stale rebuild backup");
                return Ok(RecoveryOutcome::StaleBackupRemoved);
            }
            remove_store_files(path).await?;
        }

        let fresh = connect(path, config, true).await?;
        let stats = replay_from(&backup, &fresh, config).await;
        fresh.close().await;
        let stats = stats?;

        remove_store_files(&backup).await?;
        info!(
            collections = stats.collections,
            entries = stats.entries,
            "Recovered store from rebuild backup"
        );
        Ok(RecoveryOutcome::Replayed {
            collections: stats.collections,
            entries:     stats.entries,
        })
    }
}

async fn checkpoint(pool: &SqlitePool, path: &Path) -> Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(pool)
        .await
        .context(StorageSnafu {
            context: format!("checkpointing {}", path.display()),
        })?;
    Ok(())
}

async fn has_collections(pool: &SqlitePool) -> Result<bool> {
    let populated: i64 = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM collections)")
        .fetch_one(pool)
        .await
        .context(StorageSnafu {
            context: "inspecting live store",
        })?;
    Ok(populated != 0)
}

/// Opens the backup at `backup` and copies its content into `target`.
async fn replay_from(
    backup: &Path,
    target: &SqlitePool,
    config: &StoreConfig,
) -> Result<ReplayStats> {
    let source = connect_raw(backup, config, false).await?;
    let stats = replay(&source, target).await;
    source.close().await;
    stats
}

/// Copies every collection with its generator and every entry from `source`
/// into `target` in a single transaction.
async fn replay(source: &SqlitePool, target: &SqlitePool) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut src = source.begin().await.context(StorageSnafu {
        context: "opening backup snapshot",
    })?;
    let mut dst = target.begin().await.context(StorageSnafu {
        context: "beginning replay transaction",
    })?;

    let collections: Vec<(String, i64)> =
        sqlx::query_as("SELECT name, sequence FROM collections ORDER BY name")
            .fetch_all(&mut *src)
            .await
            .context(StorageSnafu {
                context: "reading backup collections",
            })?;
    for (name, sequence) in &collections {
        sqlx::query(
            "INSERT INTO collections (name, sequence) VALUES (?, ?) ON CONFLICT (name) DO UPDATE \
             SET sequence = excluded.sequence",
        )
        .bind(name)
        .bind(sequence)
        .execute(&mut *dst)
        .await
        .context(StorageSnafu {
            context: format!("replaying collection {name}"),
        })?;
        stats.collections += 1;
    }

    let mut rows = sqlx::query_as::<_, (String, Vec<u8>, Vec<u8>)>(
        "SELECT collection, key, value FROM entries ORDER BY collection, key",
    )
    .fetch(&mut *src);
    while let Some((collection, key, value)) = rows.try_next().await.context(StorageSnafu {
        context: "reading backup entries",
    })? {
        sqlx::query("INSERT OR REPLACE INTO entries (collection, key, value) VALUES (?, ?, ?)")
            .bind(&collection)
            .bind(key)
            .bind(value)
            .execute(&mut *dst)
            .await
            .context(StorageSnafu {
                context: format!("replaying entry of {collection}"),
            })?;
        stats.entries += 1;
    }
    drop(rows);

    dst.commit().await.context(StorageSnafu {
        context: "committing replay",
    })?;
    src.rollback().await.context(StorageSnafu {
        context: "closing backup snapshot",
    })?;

    Ok(stats)
}

fn store_files(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    std::iter::once(path.to_path_buf())
        .chain(SIDECARS.iter().map(|suffix| with_suffix(path, suffix)))
}

/// Renames the main file and any sidecars from `from` to `to`. The main
/// file must exist; sidecars are moved if present.
async fn move_store_files(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::rename(from, to).await.context(IoSnafu {
        context: format!("renaming {} to {}", from.display(), to.display()),
    })?;
    for suffix in SIDECARS {
        let (src, dst) = (with_suffix(from, suffix), with_suffix(to, suffix));
        if path_exists(&src).await? {
            tokio::fs::rename(&src, &dst).await.context(IoSnafu {
                context: format!("renaming {} to {}", src.display(), dst.display()),
            })?;
        }
    }
    Ok(())
}

/// Deletes the main file and its sidecars; missing files are ignored.
async fn remove_store_files(path: &Path) -> Result<()> {
    for file in store_files(path) {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).context(IoSnafu {
                    context: format!("removing {}", file.display()),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    async fn seed(store: &Store, collection: &str, entries: u64) {
        let mut tx = store.begin_write().await.unwrap();
        tx.create_collection(collection).await.unwrap();
        for _ in 0..entries {
            let seq = tx.next_sequence(collection).await.unwrap();
            tx.put(collection, &seq.to_be_bytes(), &[7u8; 512]).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_preserves_content_and_generators() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("rebuild.db"));
        let store = Store::open(config.clone()).await.unwrap();
        seed(&store, "a", 10).await;
        seed(&store, "b", 0).await;

        let report = store.rebuild().await.unwrap();
        assert_eq!(report.collections, 2);
        assert_eq!(report.entries, 10);
        assert!(!config.backup_path().exists());

        let mut tx = store.begin_write().await.unwrap();
        assert_eq!(tx.collections().await.unwrap(), vec!["a", "b"]);
        assert_eq!(tx.count("a").await.unwrap(), 10);
        assert_eq!(tx.next_sequence("a").await.unwrap(), 11);
        assert_eq!(tx.next_sequence("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_shrinks_after_deletes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::at(dir.path().join("shrink.db")))
            .await
            .unwrap();
        seed(&store, "a", 500).await;

        let mut tx = store.begin_write().await.unwrap();
        tx.clear("a").await.unwrap();
        tx.commit().await.unwrap();

        let report = store.rebuild().await.unwrap();
        assert!(report.size_after < report.size_before);
        assert_eq!(report.entries, 0);
    }

    #[tokio::test]
    async fn test_rebuild_refuses_with_existing_backup() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("guard.db"));
        let store = Store::open(config.clone()).await.unwrap();
        seed(&store, "a", 1).await;
        std::fs::write(config.backup_path(), b"leftover").unwrap();

        let err = store.rebuild().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::RebuildFailed {
                stage: RebuildStage::Rename,
                ..
            }
        ));

        // Still usable on the original file.
        let mut tx = store.begin_read().await.unwrap();
        assert_eq!(tx.count("a").await.unwrap(), 1);
    }

    #[test_case(RebuildStage::Reopen ; "reopen")]
    #[test_case(RebuildStage::Replay ; "replay")]
    #[tokio::test]
    async fn test_failed_rebuild_rolls_back_to_original(stage: RebuildStage) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("rollback.db"));
        let store = Store::open(config.clone()).await.unwrap();
        seed(&store, "a", 5).await;
        store.arm_faults([FaultPoint::Stage(stage)]);

        let err = store.rebuild().await.unwrap_err();
        assert!(
            matches!(err, QueueError::RebuildFailed { stage: failed, .. } if failed == stage),
            "unexpected error: {err:?}"
        );
        assert!(!err.is_fatal());
        assert!(!config.backup_path().exists());
        assert!(!store.is_closed().await);

        let mut tx = store.begin_write().await.unwrap();
        assert_eq!(tx.count("a").await.unwrap(), 5);
        assert_eq!(tx.next_sequence("a").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal_and_recoverable() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("fatal.db"));
        let store = Store::open(config.clone()).await.unwrap();
        seed(&store, "a", 4).await;
        store.arm_faults([
            FaultPoint::Stage(RebuildStage::Replay),
            FaultPoint::Rollback,
        ]);

        let err = store.rebuild().await.unwrap_err();
        assert!(err.is_fatal(), "unexpected error: {err:?}");
        assert!(matches!(
            err,
            QueueError::RollbackFailed {
                stage: RebuildStage::Replay,
                ..
            }
        ));
        assert!(store.is_closed().await);
        assert!(config.backup_path().exists());
        assert!(matches!(
            Store::open(config.clone()).await.unwrap_err(),
            QueueError::RecoveryRequired { .. }
        ));

        assert_eq!(
            Store::recover(&config).await.unwrap(),
            RecoveryOutcome::Replayed {
                collections: 1,
                entries:     4,
            }
        );
        let store = Store::open(config).await.unwrap();
        let mut tx = store.begin_read().await.unwrap();
        assert_eq!(tx.count("a").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_recover_clean() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("clean.db"));
        assert_eq!(Store::recover(&config).await.unwrap(), RecoveryOutcome::Clean);
    }

    #[tokio::test]
    async fn test_recover_replays_when_live_file_missing() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("crashed.db"));
        {
            let store = Store::open(config.clone()).await.unwrap();
            seed(&store, "a", 3).await;
            store.close().await.unwrap();
        }
        // Crash right after the rename.
        std::fs::rename(&config.path, config.backup_path()).unwrap();

        let outcome = Store::recover(&config).await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Replayed {
                collections: 1,
                entries:     3,
            }
        );
        assert!(!config.backup_path().exists());

        let store = Store::open(config).await.unwrap();
        let mut tx = store.begin_read().await.unwrap();
        assert_eq!(tx.count("a").await.unwrap(), 3);
        assert_eq!(tx.sequence("a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_recover_removes_stale_backup() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("done.db"));
        {
            let store = Store::open(config.clone()).await.unwrap();
            seed(&store, "a", 2).await;
            store.close().await.unwrap();
        }
        // Crash after the replay, before the backup was deleted.
        std::fs::copy(&config.path, config.backup_path()).unwrap();

        let outcome = Store::recover(&config).await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::StaleBackupRemoved);
        assert!(!config.backup_path().exists());
        Store::open(config).await.unwrap();
    }
}
