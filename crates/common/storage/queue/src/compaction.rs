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

//! Reclaiming records every registered consumer has acknowledged.
//!
//! A pass looks at each queue on its own, in one write transaction:
//!
//! | cursors on the queue              | action                         |
//! |-----------------------------------|--------------------------------|
//! | none                              | untouched                      |
//! | min offset `0`                    | untouched                      |
//! | `0 < min < last sequence`         | trim records `<= min`          |
//! | `min >= last sequence`            | reset: delete every record     |
//!
//! Neither action touches the queue's sequence generator, so sequences stay
//! monotonic and cursors stay valid. Every `rebuild_every` passes the store
//! file is rebuilt to hand the freed pages back to the filesystem.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info};

use crate::{
    config::CompactionConfig,
    cursor::min_offset_in,
    error::Result,
    keys::{CURSOR_COLLECTION, sequence_key},
    metrics::{COMPACTION_DURATION_SECONDS, RECORDS_COMPACTED, STORE_REBUILDS},
    store::{RebuildReport, Store},
};

/// What a compaction pass did to one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CompactionAction {
    /// No consumer is registered on the queue.
    NoConsumers,
    /// Nothing at or below the minimum cursor was left to delete.
    Kept,
    /// Records up to the minimum cursor were deleted.
    Trimmed,
    /// Every consumer had caught up; all records were deleted.
    Reset,
}

/// Per-queue result of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCompaction {
    pub queue:         String,
    pub action:        CompactionAction,
    /// Records deleted.
    pub deleted:       u64,
    /// Smallest cursor offset at the time of the pass.
    pub min_offset:    Option<u64>,
    pub last_sequence: u64,
}

/// Result of [`Compactor::compact`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// 1-based number of this pass since the compactor was created.
    pub pass:    u64,
    pub queues:  Vec<QueueCompaction>,
    /// Present when this pass also rebuilt the store file.
    pub rebuild: Option<RebuildReport>,
}

impl CompactionReport {
    /// Records deleted across all queues.
    pub fn deleted(&self) -> u64 { self.queues.iter().map(|q| q.deleted).sum() }
}

/// Runs compaction passes over every queue of a store.
#[derive(Debug)]
pub struct Compactor {
    store:  Arc<Store>,
    config: CompactionConfig,
    passes: AtomicU64,
}

impl Compactor {
    pub const fn new(store: Arc<Store>, config: CompactionConfig) -> Self {
        Self {
            store,
            config,
            passes: AtomicU64::new(0),
        }
    }

    /// Trim or reset every queue, then rebuild the file if this pass is due.
    ///
    /// Stops at the first failing queue. A rebuild error is returned as is;
    /// queues compacted before it stay compacted.
    pub async fn compact(&self) -> Result<CompactionReport> {
        let timer = COMPACTION_DURATION_SECONDS.start_timer();
        let pass = self.passes.fetch_add(1, Ordering::AcqRel) + 1;

        let names = {
            let mut tx = self.store.begin_read().await?;
            tx.collections().await?
        };

        let mut report = CompactionReport {
            pass,
            ..CompactionReport::default()
        };
        for name in names.iter().filter(|name| *name != CURSOR_COLLECTION) {
            report.queues.push(self.compact_queue(name).await?);
        }

        if self.rebuild_due(pass) {
            match self.store.rebuild().await {
                Ok(rebuild) => {
                    STORE_REBUILDS.with_label_values(&["ok"]).inc();
                    report.rebuild = Some(rebuild);
                }
                Err(err) => {
                    let outcome = if err.is_fatal() {
                        "rollback_failed"
                    } else {
                        "rolled_back"
                    };
                    STORE_REBUILDS.with_label_values(&[outcome]).inc();
                    return Err(err);
                }
            }
        }

        timer.observe_duration();
        info!(
            pass,
            queues = report.queues.len(),
            deleted = report.deleted(),
            rebuilt = report.rebuild.is_some(),
            "Compaction pass finished"
        );
        Ok(report)
    }

    /// Compact a single queue in one write transaction.
    pub async fn compact_queue(&self, queue: &str) -> Result<QueueCompaction> {
        let mut tx = self.store.begin_write().await?;
        let last_sequence = tx.sequence(queue).await?;
        let min_offset = min_offset_in(&mut tx, queue).await?;

        let (action, deleted) = match min_offset {
            None => (CompactionAction::NoConsumers, 0),
            Some(0) => (CompactionAction::Kept, 0),
            Some(min) if min >= last_sequence => {
                (CompactionAction::Reset, tx.clear(queue).await?)
            }
            Some(min) => (
                CompactionAction::Trimmed,
                tx.delete_through(queue, &sequence_key(min)).await?,
            ),
        };
        tx.commit().await?;

        let action = if deleted == 0 && action != CompactionAction::NoConsumers {
            CompactionAction::Kept
        } else {
            action
        };
        if deleted > 0 {
            RECORDS_COMPACTED.with_label_values(&[queue]).inc_by(deleted);
        }
        debug!(queue, %action, deleted, ?min_offset, last_sequence, "Queue compacted");

        Ok(QueueCompaction {
            queue: queue.to_owned(),
            action,
            deleted,
            min_offset,
            last_sequence,
        })
    }

    /// Number of passes run so far.
    pub fn passes(&self) -> u64 { self.passes.load(Ordering::Acquire) }

    pub const fn store(&self) -> &Arc<Store> { &self.store }

    fn rebuild_due(&self, pass: u64) -> bool {
        let every = u64::from(self.config.rebuild_every);
        every > 0 && pass % every == 0
    }
}
