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

//! Storage adapter over a single SQLite file.
//!
//! The store exposes named collections of ordered key/value entries plus a
//! persisted auto-increment generator per collection. Every access goes
//! through a transaction:
//!
//! - [`ReadTxn`]: snapshot isolated (WAL mode); any number may run alongside
//!   each other and alongside the writer.
//! - [`WriteTxn`]: exclusive within the process. A write gate admits one
//!   writer at a time; acquisition is bounded by
//!   [`StoreConfig::transaction_timeout`] and expires with the retryable
//!   [`QueueError::TransactionTimeout`](crate::QueueError::TransactionTimeout).
//!
//! Both kinds hold a shared guard on the store state. The file level rebuild
//! in [`rebuild`] takes that guard exclusively, so it waits for in-flight
//! transactions and pauses new ones until the file is live again.

mod rebuild;
mod txn;

use std::{path::Path, sync::Arc, time::Duration};

pub use rebuild::{RebuildReport, RecoveryOutcome};
use snafu::{OptionExt, ResultExt, ensure};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
pub use txn::{Entry, ReadOnly, ReadTxn, ReadWrite, Txn, WriteTxn};

use crate::{
    config::StoreConfig,
    error::{
        IoSnafu, MigrationSnafu, RecoveryRequiredSnafu, Result, StoreClosedSnafu,
        StoreUnavailableSnafu, TransactionTimeoutSnafu, storage_error,
    },
};

/// Mutable state shared by every transaction. `pool` is `None` once the
/// store is closed, or after a rebuild whose rollback failed.
pub(crate) struct StoreState {
    pool: Option<SqlitePool>,
}

/// A disk-backed store of named, ordered collections.
pub struct Store {
    config: StoreConfig,
    state:  Arc<RwLock<StoreState>>,
    writer: Arc<Mutex<()>>,
    #[cfg(test)]
    faults: std::sync::Mutex<Vec<rebuild::FaultPoint>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open the store, creating the file if missing.
    ///
    /// Fails with `RecoveryRequired` if a backup from an interrupted rebuild
    /// is present; run [`Store::recover`] first.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %config.path.display()), err)]
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let backup = config.backup_path();
        ensure!(
            !path_exists(&backup).await?,
            RecoveryRequiredSnafu { backup }
        );

        let pool = connect(&config.path, &config, true).await?;
        info!(path = %config.path.display(), "Store opened");

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(StoreState { pool: Some(pool) })),
            writer: Arc::new(Mutex::new(())),
            #[cfg(test)]
            faults: std::sync::Mutex::default(),
        })
    }

    /// Begin a snapshot read transaction.
    pub async fn begin_read(&self) -> Result<ReadTxn> {
        let timeout = self.config.transaction_timeout;
        let state = tokio::time::timeout(timeout, self.state.clone().read_owned())
            .await
            .ok()
            .context(TransactionTimeoutSnafu {
                kind: "read",
                timeout,
            })?;
        let pool = state.pool.clone().context(StoreClosedSnafu)?;
        let tx = pool
            .begin()
            .await
            .map_err(storage_error("beginning read transaction", timeout))?;
        Ok(Txn::read(tx, timeout, state))
    }

    /// Begin the exclusive write transaction.
    pub async fn begin_write(&self) -> Result<WriteTxn> {
        let timeout = self.config.transaction_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let gate = tokio::time::timeout_at(deadline, self.writer.clone().lock_owned())
            .await
            .ok()
            .context(TransactionTimeoutSnafu {
                kind: "write",
                timeout,
            })?;
        let state = tokio::time::timeout_at(deadline, self.state.clone().read_owned())
            .await
            .ok()
            .context(TransactionTimeoutSnafu {
                kind: "write",
                timeout,
            })?;
        let pool = state.pool.clone().context(StoreClosedSnafu)?;
        let tx = pool
            .begin()
            .await
            .map_err(storage_error("beginning write transaction", timeout))?;
        Ok(Txn::write(tx, timeout, state, gate))
    }

    /// Close the store. Idempotent; later transactions fail with
    /// `StoreClosed`.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(pool) = state.pool.take() {
            pool.close().await;
            info!(path = %self.config.path.display(), "Store closed");
        }
        Ok(())
    }

    /// Whether [`Store::close`] has been called (or a rollback failed).
    pub async fn is_closed(&self) -> bool { self.state.read().await.pool.is_none() }

    pub fn path(&self) -> &Path { &self.config.path }

    pub const fn config(&self) -> &StoreConfig { &self.config }

    /// Size of the store file on disk, in bytes.
    pub async fn file_size(&self) -> Result<u64> { file_size(&self.config.path).await }
}

/// Connects a pool to `path` and applies the embedded migrations.
async fn connect(path: &Path, config: &StoreConfig, create: bool) -> Result<SqlitePool> {
    let pool = connect_raw(path, config, create).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context(MigrationSnafu)?;
    Ok(pool)
}

/// Connects a pool to `path` without touching the schema.
async fn connect_raw(path: &Path, config: &StoreConfig, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(config.busy_timeout);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.transaction_timeout.max(Duration::from_secs(1)))
        .connect_with(options)
        .await
        .context(StoreUnavailableSnafu { path })
}

async fn path_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path).await.context(IoSnafu {
        context: format!("checking {}", path.display()),
    })
}

async fn file_size(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await.context(IoSnafu {
        context: format!("reading metadata of {}", path.display()),
    })?;
    Ok(metadata.len())
}
