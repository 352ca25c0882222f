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

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use smart_default::SmartDefault;

use crate::worker::Trigger;

/// Suffix appended to the store path for the rebuild backup.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Store configuration
#[derive(Debug, Clone, SmartDefault, bon::Builder)]
pub struct StoreConfig {
    /// Path to the SQLite store file
    #[default(_code = "PathBuf::from(\"burrow.db\")")]
    #[builder(default = PathBuf::from("burrow.db"), into)]
    pub path: PathBuf,

    /// How long to wait for a read or write transaction before giving up with
    /// a retryable timeout (default: 1 second)
    #[default(_code = "Duration::from_secs(1)")]
    #[builder(default = Duration::from_secs(1))]
    pub transaction_timeout: Duration,

    /// SQLite busy timeout for lock contention from outside this process
    /// (default: 5 seconds)
    #[default(_code = "Duration::from_secs(5)")]
    #[builder(default = Duration::from_secs(5))]
    pub busy_timeout: Duration,

    /// Maximum number of connections in the pool
    #[default = 8]
    #[builder(default = 8)]
    pub max_connections: u32,

    /// Attempts made by an append before a timeout is surfaced
    #[default = 3]
    #[builder(default = 3)]
    pub append_attempts: usize,

    /// Smallest backoff between append attempts (default: 10ms)
    #[default(_code = "Duration::from_millis(10)")]
    #[builder(default = Duration::from_millis(10))]
    pub retry_min_delay: Duration,

    /// Largest backoff between append attempts (default: 200ms)
    #[default(_code = "Duration::from_millis(200)")]
    #[builder(default = Duration::from_millis(200))]
    pub retry_max_delay: Duration,
}

impl StoreConfig {
    /// Config for a store at `path` with every other setting defaulted.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Path of the rebuild backup, `<path>.bak`.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf { with_suffix(&self.path, BACKUP_SUFFIX) }
}

/// Compaction configuration
#[derive(Debug, Clone, SmartDefault, bon::Builder)]
pub struct CompactionConfig {
    /// Rebuild the store file every N compaction passes. `1` rebuilds after
    /// every pass, `0` never rebuilds.
    #[default = 1]
    #[builder(default = 1)]
    pub rebuild_every: u32,
}

/// Compaction worker configuration
#[derive(Debug, Clone, SmartDefault, bon::Builder)]
pub struct WorkerConfig {
    /// When compaction runs (default: every 60 seconds or on demand)
    #[default(_code = "Trigger::IntervalOrNotify(Duration::from_secs(60))")]
    #[builder(default = Trigger::IntervalOrNotify(Duration::from_secs(60)))]
    pub trigger: Trigger,

    /// How long shutdown waits for a running pass (default: 30 seconds)
    #[default(_code = "Duration::from_secs(30)")]
    #[builder(default = Duration::from_secs(30))]
    pub shutdown_timeout: Duration,
}

/// Appends `suffix` to the full file name (`a.db` -> `a.db.bak`).
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
