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

use std::{marker::PhantomData, time::Duration};

use snafu::{OptionExt, ensure};
use sqlx::{Sqlite, Transaction};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard};

use super::StoreState;
use crate::error::{CollectionNotFoundSnafu, KeyNotFoundSnafu, Result, storage_error};

/// Read-only transaction mode.
#[derive(Debug)]
pub enum ReadOnly {}

/// Exclusive read-write transaction mode.
#[derive(Debug)]
pub enum ReadWrite {}

pub type ReadTxn = Txn<ReadOnly>;
pub type WriteTxn = Txn<ReadWrite>;

/// One key/value entry of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key:   Vec<u8>,
    pub value: Vec<u8>,
}

impl From<(Vec<u8>, Vec<u8>)> for Entry {
    fn from((key, value): (Vec<u8>, Vec<u8>)) -> Self { Self { key, value } }
}

/// A store transaction. Reads are available in both modes, mutation only on
/// [`WriteTxn`]. Dropping a transaction without committing rolls it back.
pub struct Txn<M> {
    tx:      Transaction<'static, Sqlite>,
    timeout: Duration,
    _state:  OwnedRwLockReadGuard<StoreState>,
    _gate:   Option<OwnedMutexGuard<()>>,
    _mode:   PhantomData<M>,
}

impl<M> std::fmt::Debug for Txn<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Txn<ReadOnly> {
    pub(super) fn read(
        tx: Transaction<'static, Sqlite>,
        timeout: Duration,
        state: OwnedRwLockReadGuard<StoreState>,
    ) -> Self {
        Self {
            tx,
            timeout,
            _state: state,
            _gate: None,
            _mode: PhantomData,
        }
    }

    /// Ends the snapshot.
    pub async fn finish(self) -> Result<()> {
        let timeout = self.timeout;
        self.tx
            .rollback()
            .await
            .map_err(storage_error("ending read transaction", timeout))
    }
}

impl<M> Txn<M> {
    pub async fn collection_exists(&mut self, name: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error(format!("looking up collection {name}"), self.timeout))?;
        Ok(found.is_some())
    }

    /// Names of every collection, in byte order.
    pub async fn collections(&mut self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT name FROM collections ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage_error("listing collections", self.timeout))
    }

    /// Last value handed out by the collection's generator, `0` if none.
    pub async fn sequence(&mut self, collection: &str) -> Result<u64> {
        let sequence: Option<i64> =
            sqlx::query_scalar("SELECT sequence FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(storage_error(
                    format!("reading sequence of {collection}"),
                    self.timeout,
                ))?;
        sequence
            .map(from_sql)
            .context(CollectionNotFoundSnafu { collection })
    }

    /// Value stored under `key`. Fails with a not-found error if either the
    /// collection or the key is absent.
    pub async fn get(&mut self, collection: &str, key: &[u8]) -> Result<Vec<u8>> {
        match self.try_get(collection, key).await? {
            Some(value) => Ok(value),
            None => {
                self.require_collection(collection).await?;
                KeyNotFoundSnafu {
                    collection,
                    key: String::from_utf8_lossy(key),
                }
                .fail()
            }
        }
    }

    /// Value stored under `key`, or `None`.
    pub async fn try_get(&mut self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        sqlx::query_scalar("SELECT value FROM entries WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error(format!("reading from {collection}"), self.timeout))
    }

    /// Entry with the smallest key.
    pub async fn first(&mut self, collection: &str) -> Result<Option<Entry>> {
        self.fetch_entry(
            "SELECT key, value FROM entries WHERE collection = ? ORDER BY key ASC LIMIT 1",
            collection,
            None,
        )
        .await
    }

    /// Entry with the largest key.
    pub async fn last(&mut self, collection: &str) -> Result<Option<Entry>> {
        self.fetch_entry(
            "SELECT key, value FROM entries WHERE collection = ? ORDER BY key DESC LIMIT 1",
            collection,
            None,
        )
        .await
    }

    /// First entry whose key sorts strictly after `key`.
    pub async fn seek_after(&mut self, collection: &str, key: &[u8]) -> Result<Option<Entry>> {
        self.fetch_entry(
            "SELECT key, value FROM entries WHERE collection = ? AND key > ? ORDER BY key ASC \
             LIMIT 1",
            collection,
            Some(key),
        )
        .await
    }

    /// The `n`-th entry in key order, zero based.
    pub async fn nth(&mut self, collection: &str, n: u64) -> Result<Option<Entry>> {
        let row: Option<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT key, value FROM entries WHERE collection = ? ORDER BY key ASC LIMIT 1 OFFSET ?",
        )
        .bind(collection)
        .bind(to_sql(n))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error(format!("reading from {collection}"), self.timeout))?;
        Ok(row.map(Entry::from))
    }

    /// Number of entries in the collection.
    pub async fn count(&mut self, collection: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE collection = ?")
            .bind(collection)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(storage_error(format!("counting {collection}"), self.timeout))?;
        Ok(from_sql(count))
    }

    /// Every entry of the collection in key order.
    pub async fn scan(&mut self, collection: &str) -> Result<Vec<Entry>> {
        let rows: Vec<(Vec<u8>, Vec<u8>)> =
            sqlx::query_as("SELECT key, value FROM entries WHERE collection = ? ORDER BY key ASC")
                .bind(collection)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(storage_error(format!("scanning {collection}"), self.timeout))?;
        Ok(rows.into_iter().map(Entry::from).collect())
    }

    /// Entries with keys in `[start, end)`, in key order.
    pub async fn scan_range(
        &mut self,
        collection: &str,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<Entry>> {
        let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT key, value FROM entries WHERE collection = ? AND key >= ? AND key < ? ORDER \
             BY key ASC",
        )
        .bind(collection)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error(format!("scanning {collection}"), self.timeout))?;
        Ok(rows.into_iter().map(Entry::from).collect())
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub async fn scan_prefix(&mut self, collection: &str, prefix: &[u8]) -> Result<Vec<Entry>> {
        if let Some(end) = prefix_upper_bound(prefix) {
            return self.scan_range(collection, prefix, &end).await;
        }
        let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT key, value FROM entries WHERE collection = ? AND key >= ? ORDER BY key ASC",
        )
        .bind(collection)
        .bind(prefix)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error(format!("scanning {collection}"), self.timeout))?;
        Ok(rows.into_iter().map(Entry::from).collect())
    }

    async fn fetch_entry(
        &mut self,
        sql: &'static str,
        collection: &str,
        key: Option<&[u8]>,
    ) -> Result<Option<Entry>> {
        let mut query = sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(sql).bind(collection);
        if let Some(key) = key {
            query = query.bind(key);
        }
        let row = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error(format!("reading from {collection}"), self.timeout))?;
        Ok(row.map(Entry::from))
    }

    async fn require_collection(&mut self, collection: &str) -> Result<()> {
        ensure!(
            self.collection_exists(collection).await?,
            CollectionNotFoundSnafu { collection }
        );
        Ok(())
    }
}

impl Txn<ReadWrite> {
    pub(super) fn write(
        tx: Transaction<'static, Sqlite>,
        timeout: Duration,
        state: OwnedRwLockReadGuard<StoreState>,
        gate: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            tx,
            timeout,
            _state: state,
            _gate: Some(gate),
            _mode: PhantomData,
        }
    }

    /// Creates the collection. Returns `false` if it already existed.
    pub async fn create_collection(&mut self, name: &str) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO collections (name, sequence) VALUES (?, 0)")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error(format!("creating collection {name}"), self.timeout))?;
        Ok(result.rows_affected() == 1)
    }

    /// Drops the collection with all of its entries. Returns `false` if it
    /// did not exist.
    pub async fn drop_collection(&mut self, name: &str) -> Result<bool> {
        self.clear(name).await?;
        let result = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error(format!("dropping collection {name}"), self.timeout))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn put(&mut self, collection: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_collection(collection).await?;
        sqlx::query(
            "INSERT INTO entries (collection, key, value) VALUES (?, ?, ?) ON CONFLICT \
             (collection, key) DO UPDATE SET value = excluded.value",
        )
        .bind(collection)
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error(format!("writing to {collection}"), self.timeout))?;
        Ok(())
    }

    /// Deletes `key`. Returns whether an entry was removed.
    pub async fn delete(&mut self, collection: &str, key: &[u8]) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entries WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error(format!("deleting from {collection}"), self.timeout))?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes every entry with a key `<= key`. Returns the number removed.
    pub async fn delete_through(&mut self, collection: &str, key: &[u8]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entries WHERE collection = ? AND key <= ?")
            .bind(collection)
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error(format!("trimming {collection}"), self.timeout))?;
        Ok(result.rows_affected())
    }

    /// Deletes every entry, keeping the collection and its generator.
    pub async fn clear(&mut self, collection: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entries WHERE collection = ?")
            .bind(collection)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error(format!("clearing {collection}"), self.timeout))?;
        Ok(result.rows_affected())
    }

    /// Advances the collection's generator and returns the new value. The
    /// first call on a fresh collection returns `1`.
    pub async fn next_sequence(&mut self, collection: &str) -> Result<u64> {
        let next: Option<i64> = sqlx::query_scalar(
            "UPDATE collections SET sequence = sequence + 1 WHERE name = ? RETURNING sequence",
        )
        .bind(collection)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error(
            format!("advancing sequence of {collection}"),
            self.timeout,
        ))?;
        next.map(from_sql)
            .context(CollectionNotFoundSnafu { collection })
    }

    pub async fn commit(self) -> Result<()> {
        let timeout = self.timeout;
        self.tx
            .commit()
            .await
            .map_err(storage_error("committing write transaction", timeout))
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (empty or all `0xFF`).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// SQLite integers are signed; sequences and counts never go negative.
#[inline]
fn from_sql(value: i64) -> u64 { u64::try_from(value).unwrap_or_default() }

#[inline]
fn to_sql(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }
