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

//! Entry point tying the store, queues, cursors and compaction together.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = StoreRegistry::new();
//! let broker = Broker::open(&registry, StoreConfig::at("burrow.db"), CompactionConfig::default())
//!     .await?;
//!
//! broker.enqueue("orders", &order).await?;
//! let delivered: Delivered<Order> = broker.dequeue("orders", "billing").await?;
//! delivered.ack().await?;
//!
//! broker.compact().await?;
//! broker.close().await?;
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::info;

use crate::{
    codec::{Codec, JsonCodec},
    compaction::{CompactionReport, Compactor},
    config::{CompactionConfig, StoreConfig, WorkerConfig},
    cursor::{Cursor, CursorStore},
    error::Result,
    keys::validate_queue_name,
    log::LogStore,
    message::Delivered,
    queue::{Lane, Queue, deliver},
    registry::StoreRegistry,
    store::{RebuildReport, Store},
    worker::{self, CompactionHandle},
};

/// A set of queues sharing one store file.
///
/// `enqueue`/`dequeue` on the broker encode payloads as JSON; use
/// [`Broker::queue`] for another codec. The broker keeps one lock per queue
/// name, shared by its own `enqueue`/`dequeue` and by every handle it hands
/// out, so all of them are serialized per queue and concurrent dequeues by
/// one consumer never receive the same unsettled record.
#[derive(Debug)]
pub struct Broker {
    store:     Arc<Store>,
    registry:  StoreRegistry,
    log:       LogStore,
    cursors:   CursorStore,
    compactor: Arc<Compactor>,
    lanes:     Mutex<HashMap<String, Arc<Lane>>>,
    closed:    AtomicBool,
}

impl Broker {
    /// Open the store at `config.path` through `registry`. Brokers opened on
    /// the same path through the same registry share one store.
    pub async fn open(
        registry: &StoreRegistry,
        config: StoreConfig,
        compaction: CompactionConfig,
    ) -> Result<Self> {
        let store = registry.acquire(config).await?;
        info!(path = %store.path().display(), "Broker opened");

        Ok(Self {
            log: LogStore::new(store.clone()),
            cursors: CursorStore::new(store.clone()),
            compactor: Arc::new(Compactor::new(store.clone(), compaction)),
            registry: registry.clone(),
            store,
            lanes: Mutex::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Create an empty queue. Returns `false` if it already existed.
    pub async fn create_queue(&self, name: &str) -> Result<bool> { self.log.create(name).await }

    /// Append `value` to queue `name` as JSON, creating the queue if needed.
    pub async fn enqueue<T>(&self, name: &str, value: &T) -> Result<u64>
    where
        T: Serialize + DeserializeOwned,
    {
        validate_queue_name(name)?;
        let payload = Codec::<T>::encode(&JsonCodec, value)?;
        let lane = self.lane(name);
        let _guard = lane.lock.lock().await;
        self.log.append(name, &payload).await
    }

    /// Next JSON message on `name` for `consumer`.
    pub async fn dequeue<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        consumer: &str,
    ) -> Result<Delivered<T>> {
        validate_queue_name(name)?;
        let lane = self.lane(name);
        let _guard = lane.lock.lock().await;
        deliver(
            &self.log,
            &self.cursors,
            &JsonCodec,
            &lane.in_flight,
            name,
            consumer,
        )
        .await
    }

    /// Sequence of the last record `consumer` acknowledged on `name`.
    pub async fn progress(&self, consumer: &str, name: &str) -> Result<u64> {
        self.cursors.get_offset(consumer, name).await
    }

    /// Typed handle on `name` with its own codec, creating the queue if
    /// needed. The handle shares the broker's lock for `name`.
    pub async fn queue<T, C: Codec<T>>(&self, name: &str, codec: C) -> Result<Queue<T, C>> {
        validate_queue_name(name)?;
        Queue::with_lane(self.store.clone(), name, codec, self.lane(name)).await
    }

    /// Names of every queue.
    pub async fn queues(&self) -> Result<Vec<String>> { self.log.queues().await }

    /// Number of live records in `name`.
    pub async fn len(&self, name: &str) -> Result<u64> { self.log.len(name).await }

    /// Last sequence handed out on `name`.
    pub async fn last_sequence(&self, name: &str) -> Result<u64> {
        self.log.last_sequence(name).await
    }

    /// Cursors registered on `name`.
    pub async fn consumers(&self, name: &str) -> Result<Vec<Cursor>> {
        self.cursors.consumers(name).await
    }

    /// Forget `consumer`'s cursor on `name` so it no longer holds back
    /// compaction.
    pub async fn evict_consumer(&self, consumer: &str, name: &str) -> Result<bool> {
        self.cursors.evict(consumer, name).await
    }

    /// Forget every cursor idle for longer than `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) -> Result<u64> {
        self.cursors.evict_idle(max_idle).await
    }

    /// Run one compaction pass now.
    pub async fn compact(&self) -> Result<CompactionReport> { self.compactor.compact().await }

    /// Rebuild the store file now, regardless of the compaction schedule.
    pub async fn rebuild(&self) -> Result<RebuildReport> { self.store.rebuild().await }

    /// Start background compaction sharing this broker's compactor.
    pub fn spawn_compaction(&self, config: WorkerConfig) -> CompactionHandle {
        worker::spawn(self.compactor.clone(), config)
    }

    pub const fn store(&self) -> &Arc<Store> { &self.store }

    fn lane(&self, name: &str) -> Arc<Lane> {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Release the broker's hold on the store. The store closes when its last
    /// holder in the registry releases it. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let closed = self.registry.release(self.store.path()).await?;
        info!(path = %self.store.path().display(), store_closed = closed, "Broker closed");
        Ok(())
    }
}
