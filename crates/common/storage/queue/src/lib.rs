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

//! Durable single-process message queue over one SQLite file.
//!
//! Producers append records to named queues. Every consumer keeps its own
//! cursor per queue and settles each delivery with `ack` (advance) or `nack`
//! (redeliver). A compactor deletes records every registered consumer has
//! acknowledged and periodically rebuilds the file to reclaim the space.

pub mod broker;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod cursor;
pub mod error;
mod keys;
pub mod log;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

pub use broker::Broker;
pub use codec::{Codec, JsonCodec, RawCodec};
pub use compaction::{CompactionAction, CompactionReport, Compactor, QueueCompaction};
pub use config::{BACKUP_SUFFIX, CompactionConfig, StoreConfig, WorkerConfig};
pub use cursor::{Cursor, CursorStore};
pub use error::{QueueError, RebuildStage, Result};
pub use keys::CURSOR_COLLECTION;
pub use log::LogStore;
pub use message::{Delivered, Record};
pub use queue::Queue;
pub use registry::StoreRegistry;
pub use store::{RebuildReport, RecoveryOutcome, Store};
pub use worker::{CompactionHandle, Trigger, WorkerExit};
