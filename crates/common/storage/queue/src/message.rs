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

//! Message types.
//!
//! - [`Record`]: one stored log entry, as read back from a queue
//! - [`Delivered`]: a record handed to a consumer, with the decoded value and
//!   the `ack`/`nack` settlement that drives the consumer's cursor

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    cursor::CursorStore,
    error::Result,
    metrics::{MESSAGES_ACKED, MESSAGES_NACKED},
};

/// A record read from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Sequence assigned at append time. Strictly increasing per queue and
    /// never reused, including across restarts and compaction.
    pub sequence: u64,

    /// Encoded payload as stored.
    pub payload: Bytes,
}

/// Sequences currently handed out, per consumer, for one queue.
///
/// A dequeue skips sequences held here so that concurrent dequeues by the
/// same consumer see different records. Entries are held by a [`Lease`] and
/// removed when it drops.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight(Arc<Mutex<HashMap<String, BTreeSet<u64>>>>);

impl InFlight {
    pub(crate) fn contains(&self, consumer: &str, sequence: u64) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer)
            .is_some_and(|held| held.contains(&sequence))
    }

    pub(crate) fn lease(&self, consumer: &str, sequence: u64) -> Lease {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(consumer.to_owned())
            .or_default()
            .insert(sequence);
        Lease {
            in_flight: self.clone(),
            consumer: consumer.to_owned(),
            sequence,
        }
    }

    fn release(&self, consumer: &str, sequence: u64) {
        let mut held = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sequences) = held.get_mut(consumer) {
            sequences.remove(&sequence);
            if sequences.is_empty() {
                held.remove(consumer);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn held(&self, consumer: &str) -> Vec<u64> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer)
            .map(|held| held.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Marks one sequence as in flight until dropped.
#[derive(Debug)]
pub(crate) struct Lease {
    in_flight: InFlight,
    consumer:  String,
    sequence:  u64,
}

impl Drop for Lease {
    fn drop(&mut self) { self.in_flight.release(&self.consumer, self.sequence); }
}

/// A message in flight to one consumer.
///
/// Nothing is persisted while the message is in flight. [`Delivered::ack`]
/// moves the consumer's cursor past the record; [`Delivered::nack`] (or just
/// dropping the handle) leaves the cursor where it was, so the next dequeue by
/// the same consumer returns the same record again. Until then, other
/// dequeues by the same consumer through the same handle skip it.
///
/// A handle settles once: after the first successful `ack` or any `nack`,
/// further calls are no-ops. Settlement is serialized, so a second `ack`
/// waits for the first one and reports success only once the cursor has
/// actually moved.
#[derive(Debug)]
pub struct Delivered<T> {
    record:    Record,
    value:     T,
    queue:     String,
    consumer:  String,
    cursors:   CursorStore,
    processed: AtomicBool,
    lease:     tokio::sync::Mutex<Option<Lease>>,
}

impl<T> Delivered<T> {
    pub(crate) fn new(
        record: Record,
        value: T,
        queue: impl Into<String>,
        consumer: impl Into<String>,
        cursors: CursorStore,
        lease: Lease,
    ) -> Self {
        Self {
            record,
            value,
            queue: queue.into(),
            consumer: consumer.into(),
            cursors,
            processed: AtomicBool::new(false),
            lease: tokio::sync::Mutex::new(Some(lease)),
        }
    }

    pub const fn sequence(&self) -> u64 { self.record.sequence }

    pub const fn value(&self) -> &T { &self.value }

    pub fn into_value(self) -> T { self.value }

    pub const fn record(&self) -> &Record { &self.record }

    pub fn queue(&self) -> &str { &self.queue }

    pub fn consumer(&self) -> &str { &self.consumer }

    /// Whether the handle has been acked or nacked.
    pub fn is_settled(&self) -> bool { self.processed.load(Ordering::Acquire) }

    /// Acknowledge the message, advancing the consumer's cursor to its
    /// sequence.
    ///
    /// Idempotent. If the cursor update fails the handle is left unsettled
    /// so the ack can be retried, and the record is released for other
    /// dequeues by the same consumer.
    pub async fn ack(&self) -> Result<()> {
        let mut lease = self.lease.lock().await;
        if self.is_settled() {
            return Ok(());
        }

        if let Err(err) = self
            .cursors
            .advance(&self.consumer, &self.queue, self.record.sequence)
            .await
        {
            lease.take();
            return Err(err);
        }
        self.processed.store(true, Ordering::Release);
        lease.take();

        MESSAGES_ACKED.with_label_values(&[self.queue.as_str()]).inc();
        debug!(
            queue = %self.queue,
            consumer = %self.consumer,
            sequence = self.record.sequence,
            "Message acked"
        );
        Ok(())
    }

    /// Give the message back. The cursor is untouched and the handle is
    /// settled, so a later `ack` on it does nothing.
    ///
    /// A `nack` issued while an `ack` on the same handle is still running is
    /// ignored; the `ack` decides the outcome.
    pub fn nack(&self) {
        let Ok(mut lease) = self.lease.try_lock() else {
            return;
        };
        if self.processed.swap(true, Ordering::AcqRel) {
            return;
        }
        lease.take();

        MESSAGES_NACKED.with_label_values(&[self.queue.as_str()]).inc();
        debug!(
            queue = %self.queue,
            consumer = %self.consumer,
            sequence = self.record.sequence,
            "Message nacked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_releases_on_drop() {
        let in_flight = InFlight::default();
        let first = in_flight.lease("c", 1);
        let second = in_flight.lease("c", 2);
        let _other = in_flight.lease("d", 1);
        assert_eq!(in_flight.held("c"), vec![1, 2]);

        drop(first);
        assert!(!in_flight.contains("c", 1));
        assert!(in_flight.contains("c", 2));
        assert!(in_flight.contains("d", 1));

        drop(second);
        assert!(in_flight.held("c").is_empty());
    }
}
