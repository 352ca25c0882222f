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

//! Typed handle on one queue.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Arc::new(Store::open(StoreConfig::at("/var/lib/burrow.db")).await?);
//! let queue: Queue<Order> = Queue::open(store, "orders", JsonCodec).await?;
//!
//! queue.enqueue(&order).await?;
//!
//! let delivered = queue.dequeue("billing").await?;
//! process(delivered.value())?;
//! delivered.ack().await?;
//! ```

use std::{marker::PhantomData, sync::Arc};

use snafu::ensure;
use tokio::sync::Mutex;

use crate::{
    codec::{Codec, JsonCodec},
    cursor::{Cursor, CursorStore},
    error::{CollectionNotFoundSnafu, Result},
    keys::validate_queue_name,
    log::LogStore,
    message::{Delivered, InFlight},
    metrics::MESSAGES_DEQUEUED,
    store::Store,
};

/// Lock and in-flight set for one queue name.
///
/// Every handle holding the same lane is serialized against the others, and
/// concurrent dequeues by one consumer through it never see the same
/// unsettled record.
#[derive(Debug, Default)]
pub(crate) struct Lane {
    pub(crate) lock:      Mutex<()>,
    pub(crate) in_flight: InFlight,
}

/// A named queue bound to a payload codec.
///
/// Enqueue and dequeue on one handle are serialized by the handle's lock, and
/// a record delivered to a consumer is skipped by that consumer's other
/// dequeues until it is settled or dropped. Handles opened through the same
/// [`Broker`](crate::Broker) share this state. Handles opened separately
/// are not serialized against each other; the store's transactions keep each
/// operation atomic, but two such handles may deliver the same record to the
/// same consumer.
pub struct Queue<T, C = JsonCodec> {
    /// Queue name, also the collection name.
    name:    String,
    codec:   C,
    log:     LogStore,
    cursors: CursorStore,
    lane:    Arc<Lane>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> std::fmt::Debug for Queue<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T, C: Codec<T>> Queue<T, C> {
    /// Bind a handle to `name`, creating the queue if it does not exist.
    pub async fn open(store: Arc<Store>, name: impl Into<String>, codec: C) -> Result<Self> {
        Self::with_lane(store, name, codec, Arc::default()).await
    }

    pub(crate) async fn with_lane(
        store: Arc<Store>,
        name: impl Into<String>,
        codec: C,
        lane: Arc<Lane>,
    ) -> Result<Self> {
        let name = name.into();
        validate_queue_name(&name)?;

        let log = LogStore::new(store.clone());
        log.create(&name).await?;

        Ok(Self {
            name,
            codec,
            log,
            cursors: CursorStore::new(store),
            lane,
            _marker: PhantomData,
        })
    }

    /// Encode and append `value`. Returns the assigned sequence.
    pub async fn enqueue(&self, value: &T) -> Result<u64> {
        let payload = self.codec.encode(value)?;
        let _guard = self.lane.lock.lock().await;
        self.log.append(&self.name, &payload).await
    }

    /// Next record for `consumer`, without moving its cursor.
    ///
    /// The first call registers the consumer. Records this consumer already
    /// holds unsettled are skipped. Returns `NoMoreMessages` once nothing
    /// is left to hand out.
    pub async fn dequeue(&self, consumer: &str) -> Result<Delivered<T>> {
        let _guard = self.lane.lock.lock().await;
        deliver(
            &self.log,
            &self.cursors,
            &self.codec,
            &self.lane.in_flight,
            &self.name,
            consumer,
        )
        .await
    }

    /// Sequence of the last record `consumer` acknowledged.
    pub async fn progress(&self, consumer: &str) -> Result<u64> {
        self.cursors.get_offset(consumer, &self.name).await
    }

    /// Cursors of every registered consumer.
    pub async fn consumers(&self) -> Result<Vec<Cursor>> {
        self.cursors.consumers(&self.name).await
    }

    /// Number of live records.
    pub async fn len(&self) -> Result<u64> { self.log.len(&self.name).await }

    pub async fn is_empty(&self) -> Result<bool> { Ok(self.len().await? == 0) }

    /// Last sequence handed out.
    pub async fn last_sequence(&self) -> Result<u64> { self.log.last_sequence(&self.name).await }

    pub fn name(&self) -> &str { &self.name }
}

/// Registers `consumer` if needed and reads its next record that is not
/// already in flight. Callers hold the lane lock.
pub(crate) async fn deliver<T, C: Codec<T>>(
    log: &LogStore,
    cursors: &CursorStore,
    codec: &C,
    in_flight: &InFlight,
    queue: &str,
    consumer: &str,
) -> Result<Delivered<T>> {
    ensure!(
        log.exists(queue).await?,
        CollectionNotFoundSnafu { collection: queue }
    );
    let mut after = cursors.ensure(consumer, queue).await?;
    let record = loop {
        let record = log.read_at(queue, after).await?;
        if !in_flight.contains(consumer, record.sequence) {
            break record;
        }
        after = record.sequence;
    };
    let value = codec.decode(&record.payload)?;
    let lease = in_flight.lease(consumer, record.sequence);

    MESSAGES_DEQUEUED.with_label_values(&[queue]).inc();
    Ok(Delivered::new(
        record,
        value,
        queue,
        consumer,
        cursors.clone(),
        lease,
    ))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::*;
    use crate::{codec::RawCodec, config::StoreConfig};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
    }

    async fn open_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::at(dir.path().join("queue.db")))
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn test_dequeue_then_ack_moves_on() {
        let (_dir, store) = open_store().await;
        let queue: Queue<Job> = Queue::open(store, "jobs", JsonCodec).await.unwrap();
        queue.enqueue(&Job { id: 1 }).await.unwrap();
        queue.enqueue(&Job { id: 2 }).await.unwrap();

        let first = queue.dequeue("w").await.unwrap();
        assert_eq!(first.value(), &Job { id: 1 });
        first.ack().await.unwrap();
        assert_eq!(queue.progress("w").await.unwrap(), 1);

        let second = queue.dequeue("w").await.unwrap();
        assert_eq!(second.value(), &Job { id: 2 });
        second.ack().await.unwrap();

        assert!(queue.dequeue("w").await.unwrap_err().is_no_more_messages());
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let (_dir, store) = open_store().await;
        let queue: Queue<Job> = Queue::open(store, "jobs", JsonCodec).await.unwrap();
        queue.enqueue(&Job { id: 7 }).await.unwrap();

        let delivered = queue.dequeue("w").await.unwrap();
        delivered.nack();
        delivered.ack().await.unwrap();
        assert_eq!(queue.progress("w").await.unwrap(), 0);

        let again = queue.dequeue("w").await.unwrap();
        assert_eq!(again.sequence(), delivered.sequence());
        assert_eq!(again.value(), &Job { id: 7 });
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let (_dir, store) = open_store().await;
        let queue: Queue<Bytes, RawCodec> = Queue::open(store, "raw", RawCodec).await.unwrap();
        for payload in ["a", "b", "c"] {
            queue.enqueue(&Bytes::from(payload)).await.unwrap();
        }

        let delivered = queue.dequeue("w").await.unwrap();
        delivered.ack().await.unwrap();
        delivered.ack().await.unwrap();
        assert!(delivered.is_settled());
        assert_eq!(queue.progress("w").await.unwrap(), 1);
        assert_eq!(queue.dequeue("w").await.unwrap().value(), &Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_concurrent_dequeues_by_one_consumer_get_distinct_records() {
        let (_dir, store) = open_store().await;
        let queue: Arc<Queue<Job>> =
            Arc::new(Queue::open(store, "jobs", JsonCodec).await.unwrap());
        for id in 1..=3 {
            queue.enqueue(&Job { id }).await.unwrap();
        }

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue("c").await.unwrap() })
            })
            .collect();
        let mut delivered = Vec::new();
        for task in tasks {
            delivered.push(task.await.unwrap());
        }
        let mut sequences: Vec<_> = delivered.iter().map(Delivered::sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2]);

        let third = queue.dequeue("c").await.unwrap();
        assert_eq!(third.sequence(), 3);
        assert!(queue.dequeue("c").await.unwrap_err().is_no_more_messages());

        // Another consumer is not affected.
        assert_eq!(queue.dequeue("other").await.unwrap().sequence(), 1);
    }

    #[tokio::test]
    async fn test_unsettled_record_is_released_for_redelivery() {
        let (_dir, store) = open_store().await;
        let queue: Queue<Job> = Queue::open(store, "jobs", JsonCodec).await.unwrap();
        for id in 1..=3 {
            queue.enqueue(&Job { id }).await.unwrap();
        }

        let first = queue.dequeue("c").await.unwrap();
        let second = queue.dequeue("c").await.unwrap();
        assert_eq!((first.sequence(), second.sequence()), (1, 2));

        // Nack puts the record back while the other one is still held.
        first.nack();
        let again = queue.dequeue("c").await.unwrap();
        assert_eq!(again.sequence(), 1);

        // Dropping without settling releases it too.
        drop(again);
        assert_eq!(queue.dequeue("c").await.unwrap().sequence(), 1);
        assert_eq!(queue.lane.in_flight.held("c"), vec![2]);

        second.ack().await.unwrap();
        assert!(queue.lane.in_flight.held("c").is_empty());
        assert_eq!(queue.progress("c").await.unwrap(), 2);
        assert_eq!(queue.dequeue("c").await.unwrap().sequence(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_acks_settle_once() {
        let (_dir, store) = open_store().await;
        let queue: Queue<Job> = Queue::open(store, "jobs", JsonCodec).await.unwrap();
        queue.enqueue(&Job { id: 1 }).await.unwrap();

        let delivered = queue.dequeue("c").await.unwrap();
        let (first, second) = tokio::join!(delivered.ack(), delivered.ack());
        first.unwrap();
        second.unwrap();
        assert!(delivered.is_settled());
        assert_eq!(queue.progress("c").await.unwrap(), 1);

        // Nack after a completed ack changes nothing.
        delivered.nack();
        assert_eq!(queue.progress("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_reports_no_messages() {
        let (_dir, store) = open_store().await;
        let queue: Queue<Job> = Queue::open(store, "idle", JsonCodec).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
        assert!(queue.dequeue("w").await.unwrap_err().is_no_more_messages());
        assert_eq!(queue.consumers().await.unwrap().len(), 1);
    }
}
