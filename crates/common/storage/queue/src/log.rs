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

//! Append-only record log, one collection per queue.
//!
//! Each record is stored under its 8-byte big-endian sequence, taken from the
//! collection's persisted generator in the same transaction as the write, so
//! sequences stay gap-free and monotonic across restarts. Reads are indexed
//! seeks on the sequence key.

use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use snafu::{OptionExt, ensure};
use tracing::{debug, warn};

use crate::{
    error::{CollectionNotFoundSnafu, CorruptRecordKeySnafu, NoMoreMessagesSnafu, Result},
    keys::{CURSOR_COLLECTION, decode_sequence, sequence_key, validate_queue_name},
    message::Record,
    metrics::MESSAGES_ENQUEUED,
    store::{Entry, ReadTxn, Store},
};

/// Record log over a shared [`Store`].
#[derive(Debug, Clone)]
pub struct LogStore {
    store:   Arc<Store>,
    backoff: ExponentialBuilder,
}

impl LogStore {
    pub fn new(store: Arc<Store>) -> Self {
        let config = store.config();
        let backoff = ExponentialBuilder::default()
            .with_max_times(config.append_attempts.saturating_sub(1))
            .with_min_delay(config.retry_min_delay)
            .with_max_delay(config.retry_max_delay);
        Self { store, backoff }
    }

    /// Append `payload` to `queue`, creating the queue if needed. Returns
    /// the assigned sequence.
    ///
    /// Writer contention is retried with exponential backoff up to the
    /// configured number of attempts.
    pub async fn append(&self, queue: &str, payload: &[u8]) -> Result<u64> {
        validate_queue_name(queue)?;

        let sequence = (|| self.try_append(queue, payload))
            .retry(self.backoff)
            .when(|e| e.is_retryable())
            .notify(|err, delay| {
                warn!(queue, error = %err, ?delay, "Append contended, retrying");
            })
            .await?;

        MESSAGES_ENQUEUED.with_label_values(&[queue]).inc();
        debug!(queue, sequence, bytes = payload.len(), "Record appended");
        Ok(sequence)
    }

    /// Single append attempt.
    async fn try_append(&self, queue: &str, payload: &[u8]) -> Result<u64> {
        let mut tx = self.store.begin_write().await?;
        tx.create_collection(queue).await?;
        let sequence = tx.next_sequence(queue).await?;
        tx.put(queue, &sequence_key(sequence), payload).await?;
        tx.commit().await?;
        Ok(sequence)
    }

    /// First live record with a sequence greater than `offset`.
    pub async fn read_at(&self, queue: &str, offset: u64) -> Result<Record> {
        let mut tx = self.store.begin_read().await?;
        require_queue(&mut tx, queue).await?;
        let entry = tx.seek_after(queue, &sequence_key(offset)).await?;
        into_record(queue, entry)
    }

    /// The `position`-th live record, counting from zero at the oldest
    /// record still stored.
    pub async fn read_position(&self, queue: &str, position: u64) -> Result<Record> {
        let mut tx = self.store.begin_read().await?;
        require_queue(&mut tx, queue).await?;
        let entry = tx.nth(queue, position).await?;
        into_record(queue, entry)
    }

    /// Oldest live record.
    pub async fn read_first(&self, queue: &str) -> Result<Record> {
        let mut tx = self.store.begin_read().await?;
        require_queue(&mut tx, queue).await?;
        let entry = tx.first(queue).await?;
        into_record(queue, entry)
    }

    /// Number of live records.
    pub async fn len(&self, queue: &str) -> Result<u64> {
        let mut tx = self.store.begin_read().await?;
        require_queue(&mut tx, queue).await?;
        tx.count(queue).await
    }

    /// Last sequence handed out, `0` for a queue never appended to. Not
    /// affected by compaction.
    pub async fn last_sequence(&self, queue: &str) -> Result<u64> {
        let mut tx = self.store.begin_read().await?;
        tx.sequence(queue).await
    }

    /// Names of every queue. The cursor collection is not a queue.
    pub async fn queues(&self) -> Result<Vec<String>> {
        let mut tx = self.store.begin_read().await?;
        let mut names = tx.collections().await?;
        names.retain(|name| name != CURSOR_COLLECTION);
        Ok(names)
    }

    pub async fn exists(&self, queue: &str) -> Result<bool> {
        let mut tx = self.store.begin_read().await?;
        tx.collection_exists(queue).await
    }

    /// Create an empty queue. Returns `false` if it already existed.
    pub async fn create(&self, queue: &str) -> Result<bool> {
        validate_queue_name(queue)?;
        let mut tx = self.store.begin_write().await?;
        let created = tx.create_collection(queue).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub const fn store(&self) -> &Arc<Store> { &self.store }
}

async fn require_queue(tx: &mut ReadTxn, queue: &str) -> Result<()> {
    ensure!(
        tx.collection_exists(queue).await?,
        CollectionNotFoundSnafu { collection: queue }
    );
    Ok(())
}

fn into_record(queue: &str, entry: Option<Entry>) -> Result<Record> {
    let entry = entry.context(NoMoreMessagesSnafu { queue })?;
    let sequence = decode_sequence(&entry.key).context(CorruptRecordKeySnafu {
        queue,
        key: format!("{:02x?}", entry.key),
    })?;
    Ok(Record {
        sequence,
        payload: Bytes::from(entry.value),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::{config::StoreConfig, error::QueueError};

    async fn open_log() -> (TempDir, LogStore) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::at(dir.path().join("log.db")))
            .await
            .unwrap();
        (dir, LogStore::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_sequences() {
        let (_dir, log) = open_log().await;
        for expected in 1..=5 {
            assert_eq!(log.append("orders", b"x").await.unwrap(), expected);
        }
        assert_eq!(log.len("orders").await.unwrap(), 5);
        assert_eq!(log.last_sequence("orders").await.unwrap(), 5);
    }

    fn contended_config(dir: &TempDir, append_attempts: usize) -> StoreConfig {
        StoreConfig::builder()
            .path(dir.path().join("contended.db"))
            .transaction_timeout(Duration::from_millis(50))
            .append_attempts(append_attempts)
            .retry_min_delay(Duration::from_millis(5))
            .retry_max_delay(Duration::from_millis(20))
            .build()
    }

    #[tokio::test]
    async fn test_append_retries_until_writer_released() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(contended_config(&dir, 8)).await.unwrap();
        let log = LogStore::new(Arc::new(store));

        let held = log.store().begin_write().await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            drop(held);
        });

        assert_eq!(log.append("q", b"late").await.unwrap(), 1);
        release.await.unwrap();
        assert_eq!(log.read_first("q").await.unwrap().payload, Bytes::from("late"));
    }

    #[tokio::test]
    async fn test_append_gives_up_after_configured_attempts() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(contended_config(&dir, 2)).await.unwrap();
        let log = LogStore::new(Arc::new(store));

        let held = log.store().begin_write().await.unwrap();
        let err = log.append("q", b"never").await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
        drop(held);

        assert!(!log.exists("q").await.unwrap());
        assert_eq!(log.append("q", b"now").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_have_no_gaps_or_duplicates() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::builder()
            .path(dir.path().join("concurrent.db"))
            .transaction_timeout(Duration::from_secs(5))
            .build();
        let log = LogStore::new(Arc::new(Store::open(config).await.unwrap()));

        let tasks: Vec<_> = (0..64u8)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move { log.append("q", &[i]).await.unwrap() })
            })
            .collect();
        let mut sequences = Vec::with_capacity(tasks.len());
        for task in tasks {
            sequences.push(task.await.unwrap());
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=64).collect::<Vec<u64>>());
        assert_eq!(log.len("q").await.unwrap(), 64);
    }

    #[tokio::test]
    async fn test_queues_have_independent_sequences() {
        let (_dir, log) = open_log().await;
        log.append("a", b"1").await.unwrap();
        log.append("a", b"2").await.unwrap();
        assert_eq!(log.append("b", b"1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_at_seeks_past_offset() {
        let (_dir, log) = open_log().await;
        for payload in [b"one", b"two", b"thr"] {
            log.append("q", payload).await.unwrap();
        }

        let record = log.read_at("q", 0).await.unwrap();
        assert_eq!((record.sequence, &record.payload[..]), (1, &b"one"[..]));
        let record = log.read_at("q", 2).await.unwrap();
        assert_eq!((record.sequence, &record.payload[..]), (3, &b"thr"[..]));
        assert!(log.read_at("q", 3).await.unwrap_err().is_no_more_messages());
    }

    #[tokio::test]
    async fn test_reads_on_missing_queue() {
        let (_dir, log) = open_log().await;
        assert!(matches!(
            log.read_at("missing", 0).await.unwrap_err(),
            QueueError::CollectionNotFound { .. }
        ));
        assert!(log.read_first("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_queue_has_no_messages() {
        let (_dir, log) = open_log().await;
        assert!(log.create("empty").await.unwrap());
        assert!(!log.create("empty").await.unwrap());
        assert!(log.read_first("empty").await.unwrap_err().is_no_more_messages());
        assert_eq!(log.last_sequence("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_position_counts_live_records() {
        let (_dir, log) = open_log().await;
        for i in 0..4u8 {
            log.append("q", &[i]).await.unwrap();
        }
        let record = log.read_position("q", 2).await.unwrap();
        assert_eq!(record.sequence, 3);
        assert!(log.read_position("q", 4).await.unwrap_err().is_no_more_messages());
    }

    #[tokio::test]
    async fn test_malformed_record_key_is_not_caught_up() {
        let (_dir, log) = open_log().await;
        log.append("q", b"ok").await.unwrap();
        let mut tx = log.store().begin_write().await.unwrap();
        tx.put("q", b"\xff\xff", b"junk").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(log.read_at("q", 0).await.unwrap().sequence, 1);
        let err = log.read_at("q", 1).await.unwrap_err();
        assert!(matches!(err, QueueError::CorruptRecordKey { .. }));
        assert!(!err.is_no_more_messages());
    }

    #[tokio::test]
    async fn test_queues_exclude_cursor_collection() {
        let (_dir, log) = open_log().await;
        log.append("b", b"x").await.unwrap();
        log.create("a").await.unwrap();
        let mut tx = log.store().begin_write().await.unwrap();
        tx.create_collection(CURSOR_COLLECTION).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(log.queues().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_reserved_queue_name_rejected() {
        let (_dir, log) = open_log().await;
        let err = log.append("__cursors", b"x").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidName { .. }));
    }
}
