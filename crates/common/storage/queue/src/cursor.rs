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

//! Durable per-consumer read positions.
//!
//! A cursor stores the sequence of the last record a consumer acknowledged
//! on a queue (`0` before the first ack). The next delivery is the first
//! live record after it, so cursors stay valid when compaction deletes
//! records below them. All cursors live in the reserved
//! [`CURSOR_COLLECTION`].

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{
    error::Result,
    keys::{
        CURSOR_COLLECTION, cursor_key, cursor_prefix, decode_cursor, encode_cursor,
        split_cursor_key, validate_consumer_id, validate_queue_name,
    },
    store::{Entry, Store, Txn},
};

/// One consumer's position on one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub consumer:   String,
    pub queue:      String,
    /// Sequence of the last acknowledged record, `0` if none.
    pub offset:     u64,
    /// Last time the consumer registered or acknowledged.
    pub touched_at: DateTime<Utc>,
}

/// Cursor persistence over a shared [`Store`].
#[derive(Debug, Clone)]
pub struct CursorStore {
    store: Arc<Store>,
}

impl CursorStore {
    pub const fn new(store: Arc<Store>) -> Self { Self { store } }

    /// Offset of `consumer` on `queue`; `0` if the consumer never registered.
    pub async fn get_offset(&self, consumer: &str, queue: &str) -> Result<u64> {
        validate_consumer_id(consumer)?;
        validate_queue_name(queue)?;

        let key = cursor_key(queue, consumer);
        let mut tx = self.store.begin_read().await?;
        match tx.try_get(CURSOR_COLLECTION, &key).await? {
            Some(value) => Ok(decode_cursor(&key, &value)?.0),
            None => Ok(0),
        }
    }

    /// Like [`CursorStore::get_offset`], but registers the consumer with a
    /// zero cursor if it has none, so compaction holds records for it.
    pub async fn ensure(&self, consumer: &str, queue: &str) -> Result<u64> {
        validate_consumer_id(consumer)?;
        validate_queue_name(queue)?;

        let key = cursor_key(queue, consumer);
        {
            let mut tx = self.store.begin_read().await?;
            if let Some(value) = tx.try_get(CURSOR_COLLECTION, &key).await? {
                return Ok(decode_cursor(&key, &value)?.0);
            }
        }

        let mut tx = self.store.begin_write().await?;
        tx.create_collection(CURSOR_COLLECTION).await?;
        if let Some(value) = tx.try_get(CURSOR_COLLECTION, &key).await? {
            return Ok(decode_cursor(&key, &value)?.0);
        }
        tx.put(CURSOR_COLLECTION, &key, &encode_cursor(0, now_millis()))
            .await?;
        tx.commit().await?;

        info!(queue, consumer, "Consumer registered");
        Ok(0)
    }

    /// Move the cursor forward to `offset`. A smaller offset than the stored
    /// one leaves the position unchanged; the touch time is refreshed either
    /// way.
    pub async fn advance(&self, consumer: &str, queue: &str, offset: u64) -> Result<u64> {
        validate_consumer_id(consumer)?;
        validate_queue_name(queue)?;

        let key = cursor_key(queue, consumer);
        let mut tx = self.store.begin_write().await?;
        tx.create_collection(CURSOR_COLLECTION).await?;
        let current = match tx.try_get(CURSOR_COLLECTION, &key).await? {
            Some(value) => decode_cursor(&key, &value)?.0,
            None => 0,
        };
        let next = current.max(offset);
        tx.put(CURSOR_COLLECTION, &key, &encode_cursor(next, now_millis()))
            .await?;
        tx.commit().await?;

        debug!(queue, consumer, from = current, to = next, "Cursor advanced");
        Ok(next)
    }

    /// Every cursor registered on `queue`, ordered by consumer id.
    pub async fn consumers(&self, queue: &str) -> Result<Vec<Cursor>> {
        validate_queue_name(queue)?;
        let mut tx = self.store.begin_read().await?;
        let entries = tx
            .scan_prefix(CURSOR_COLLECTION, &cursor_prefix(queue))
            .await?;
        entries.iter().filter_map(decode_entry).collect()
    }

    /// Every cursor of every queue.
    pub async fn all(&self) -> Result<Vec<Cursor>> {
        let mut tx = self.store.begin_read().await?;
        let entries = tx.scan(CURSOR_COLLECTION).await?;
        entries.iter().filter_map(decode_entry).collect()
    }

    /// Smallest offset among the queue's cursors, `None` if no consumer is
    /// registered.
    pub async fn min_offset(&self, queue: &str) -> Result<Option<u64>> {
        validate_queue_name(queue)?;
        let mut tx = self.store.begin_read().await?;
        min_offset_in(&mut tx, queue).await
    }

    /// Remove one consumer's cursor. Returns whether it existed.
    pub async fn evict(&self, consumer: &str, queue: &str) -> Result<bool> {
        validate_consumer_id(consumer)?;
        validate_queue_name(queue)?;

        let mut tx = self.store.begin_write().await?;
        let removed = tx
            .delete(CURSOR_COLLECTION, &cursor_key(queue, consumer))
            .await?;
        tx.commit().await?;

        if removed {
            info!(queue, consumer, "Consumer evicted");
        }
        Ok(removed)
    }

    /// Remove every cursor not touched within `max_idle`. Returns the number
    /// removed.
    pub async fn evict_idle(&self, max_idle: Duration) -> Result<u64> {
        let idle_millis = i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(idle_millis);

        let mut tx = self.store.begin_write().await?;
        let mut removed = 0;
        for entry in tx.scan(CURSOR_COLLECTION).await? {
            let (_, touched_at) = decode_cursor(&entry.key, &entry.value)?;
            if touched_at < cutoff && tx.delete(CURSOR_COLLECTION, &entry.key).await? {
                removed += 1;
            }
        }
        tx.commit().await?;

        if removed > 0 {
            info!(removed, ?max_idle, "Evicted idle consumers");
        }
        Ok(removed)
    }
}

/// Smallest cursor offset on `queue` as seen by `tx`.
pub(crate) async fn min_offset_in<M>(tx: &mut Txn<M>, queue: &str) -> Result<Option<u64>> {
    let entries = tx
        .scan_prefix(CURSOR_COLLECTION, &cursor_prefix(queue))
        .await?;
    let mut min = None;
    for entry in &entries {
        let (offset, _) = decode_cursor(&entry.key, &entry.value)?;
        min = Some(min.map_or(offset, |m: u64| m.min(offset)));
    }
    Ok(min)
}

/// Decodes a stored cursor. Keys that do not split into a queue and a
/// consumer are skipped; malformed values are errors.
fn decode_entry(entry: &Entry) -> Option<Result<Cursor>> {
    let (queue, consumer) = split_cursor_key(&entry.key)?;
    Some(
        decode_cursor(&entry.key, &entry.value).map(|(offset, touched)| Cursor {
            consumer,
            queue,
            offset,
            touched_at: DateTime::from_timestamp_millis(touched).unwrap_or_default(),
        }),
    )
}

fn now_millis() -> i64 { Utc::now().timestamp_millis() }
