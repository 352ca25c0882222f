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

use std::{path::PathBuf, time::Duration};

use snafu::{IntoError, Snafu};

/// Stage of the store rebuild cycle at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RebuildStage {
    /// Closing the live store before the rename.
    Close,
    /// Renaming the live file to the backup path.
    Rename,
    /// Opening the fresh store at the original path.
    Reopen,
    /// Copying collections and entries out of the backup.
    Replay,
    /// Deleting the backup after a successful replay.
    Cleanup,
}

/// Queue operation errors.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum QueueError {
    #[snafu(display("Collection {collection} not found"))]
    CollectionNotFound {
        collection: String,
        #[snafu(implicit)]
        loc:        snafu::Location,
    },

    #[snafu(display("Key {key} not found in collection {collection}"))]
    KeyNotFound {
        collection: String,
        key:        String,
        #[snafu(implicit)]
        loc:        snafu::Location,
    },

    #[snafu(display("No more messages in queue {queue}"))]
    NoMoreMessages {
        queue: String,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Record key {key} in queue {queue} is not an 8-byte sequence"))]
    CorruptRecordKey {
        queue: String,
        key:   String,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Invalid progress value stored for cursor {key}"))]
    InvalidProgress {
        key: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Invalid name {name:?}: {reason}"))]
    InvalidName {
        name:   String,
        reason: &'static str,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Timed out after {timeout:?} waiting for a {kind} transaction"))]
    TransactionTimeout {
        kind:    &'static str,
        timeout: Duration,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("Rebuild of {} failed during {stage}", path.display()))]
    RebuildFailed {
        path:   PathBuf,
        stage:  RebuildStage,
        #[snafu(source(from(QueueError, Box::new)))]
        source: Box<QueueError>,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display(
        "Rollback of {} from {} failed after a {stage} error ({cause}); manual recovery required",
        path.display(),
        backup.display()
    ))]
    RollbackFailed {
        path:   PathBuf,
        backup: PathBuf,
        stage:  RebuildStage,
        cause:  String,
        #[snafu(source(from(QueueError, Box::new)))]
        source: Box<QueueError>,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display(
        "Backup {} from an interrupted rebuild exists; run recovery before opening",
        backup.display()
    ))]
    RecoveryRequired {
        backup: PathBuf,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to open store at {}", path.display()))]
    StoreUnavailable {
        path:   PathBuf,
        source: sqlx::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Store is closed"))]
    StoreClosed {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Storage error while {context}"))]
    Storage {
        context: String,
        source:  sqlx::Error,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("IO error while {context}"))]
    Io {
        context: String,
        source:  std::io::Error,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("Failed to apply store migrations"))]
    Migration {
        source: sqlx::migrate::MigrateError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to encode/decode payload"))]
    Codec {
        source: Box<dyn std::error::Error + Send + Sync>,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

impl QueueError {
    /// Only writer contention is worth retrying; everything else is surfaced
    /// to the caller as is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool { matches!(self, Self::TransactionTimeout { .. }) }

    /// Consumer has caught up with the queue.
    #[must_use]
    pub const fn is_no_more_messages(&self) -> bool { matches!(self, Self::NoMoreMessages { .. }) }

    /// Collection or key absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CollectionNotFound { .. } | Self::KeyNotFound { .. }
        )
    }

    /// A rollback failure leaves the store in need of manual recovery.
    #[must_use]
    pub const fn is_fatal(&self) -> bool { matches!(self, Self::RollbackFailed { .. }) }
}

/// Wraps a codec failure of any error type.
pub(crate) fn codec_error<E>(err: E) -> QueueError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CodecSnafu.into_error(Box::new(err))
}

/// Wraps a sqlx failure with the operation it interrupted. SQLite reports
/// lock contention from other connections as `SQLITE_BUSY`, which is mapped
/// to the retryable timeout.
pub(crate) fn storage_error(
    context: impl Into<String>,
    timeout: Duration,
) -> impl FnOnce(sqlx::Error) -> QueueError {
    let context = context.into();
    move |err| {
        let busy = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == "5" || code == "517");
        if busy {
            TransactionTimeoutSnafu {
                kind: "sqlite",
                timeout,
            }
            .build()
        } else {
            StorageSnafu { context }.into_error(err)
        }
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use snafu::IntoError;

    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = TransactionTimeoutSnafu {
            kind:    "write",
            timeout: Duration::from_secs(1),
        }
        .build();
        assert!(timeout.is_retryable());

        let drained = NoMoreMessagesSnafu { queue: "q" }.build();
        assert!(!drained.is_retryable());
        assert!(drained.is_no_more_messages());

        let missing = CollectionNotFoundSnafu { collection: "q" }.build();
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn rebuild_error_keeps_stage_and_cause() {
        let inner = StoreClosedSnafu.build();
        let err = RebuildFailedSnafu {
            path:  PathBuf::from("/tmp/burrow.db"),
            stage: RebuildStage::Replay,
        }
        .into_error(inner);

        assert_eq!(err.to_string(), "Rebuild of /tmp/burrow.db failed during replay");
        assert!(!err.is_fatal());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Store is closed");
    }

    #[test]
    fn rollback_failure_is_fatal() {
        let err = RollbackFailedSnafu {
            path:   PathBuf::from("/tmp/burrow.db"),
            backup: PathBuf::from("/tmp/burrow.db.bak"),
            stage:  RebuildStage::Reopen,
            cause:  "disk full",
        }
        .into_error(StoreClosedSnafu.build());
        assert!(err.is_fatal());
    }
}
