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

//! Background compaction.
//!
//! [`spawn`] starts a tokio task that runs [`Compactor::compact`] whenever
//! its [`Trigger`] fires. Failures that leave the store usable are logged and
//! the worker waits for the next trigger. A failed rebuild rollback closes the
//! store, so the worker stops and reports the error from
//! [`CompactionHandle::shutdown`].

use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{compaction::Compactor, config::WorkerConfig, error::QueueError};

/// When the compaction worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Run once immediately, then idle until shutdown.
    Once,
    /// Run only when [`CompactionHandle::notify`] is called.
    Notify,
    /// Run at a fixed interval, starting immediately.
    Interval(Duration),
    /// Run at a fixed interval or when notified. A notification resets the
    /// interval.
    IntervalOrNotify(Duration),
}

/// Why the worker task ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// Shut down on request.
    Cancelled,
    /// Stopped after an error that left the store unusable.
    Fatal(QueueError),
    /// The task panicked or did not stop within the shutdown timeout.
    Aborted,
}

/// Control handle for a running compaction worker.
#[derive(Debug)]
pub struct CompactionHandle {
    notify:           Arc<Notify>,
    cancel:           CancellationToken,
    join:             JoinHandle<WorkerExit>,
    shutdown_timeout: Duration,
}

impl CompactionHandle {
    /// Request a pass. Ignored unless the trigger accepts notifications; a
    /// request made while a pass is running queues one more pass.
    pub fn notify(&self) { self.notify.notify_one(); }

    /// Whether the worker task has ended.
    pub fn is_finished(&self) -> bool { self.join.is_finished() }

    /// Stop the worker and wait for the current pass to finish.
    pub async fn shutdown(self) -> WorkerExit {
        self.cancel.cancel();
        let mut join = self.join;
        match tokio::time::timeout(self.shutdown_timeout, &mut join).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(err)) => {
                error!(error = %err, "Compaction worker panicked");
                WorkerExit::Aborted
            }
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Compaction worker did not stop in time");
                join.abort();
                WorkerExit::Aborted
            }
        }
    }
}

/// Start the compaction worker on the current tokio runtime.
pub fn spawn(compactor: Arc<Compactor>, config: WorkerConfig) -> CompactionHandle {
    let notify = Arc::new(Notify::new());
    let cancel = CancellationToken::new();
    let ctx = WorkerContext {
        notify: notify.clone(),
        cancel: cancel.clone(),
    };
    let driver = TriggerDriver::new(config.trigger);

    let join = tokio::spawn(run(compactor, driver, ctx));
    info!(trigger = ?config.trigger, "Compaction worker started");

    CompactionHandle {
        notify,
        cancel,
        join,
        shutdown_timeout: config.shutdown_timeout,
    }
}

async fn run(
    compactor: Arc<Compactor>,
    mut driver: TriggerDriver,
    ctx: WorkerContext,
) -> WorkerExit {
    while driver.wait_next(&ctx).await {
        match compactor.compact().await {
            Ok(report) => info!(
                pass = report.pass,
                deleted = report.deleted(),
                rebuilt = report.rebuild.is_some(),
                "Compaction run finished"
            ),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Compaction worker stopping");
                return WorkerExit::Fatal(err);
            }
            Err(err) => warn!(error = %err, "Compaction run failed, retrying on next trigger"),
        }
    }
    info!("Compaction worker stopped");
    WorkerExit::Cancelled
}

struct WorkerContext {
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

enum TriggerDriver {
    Once { executed: bool },
    Notify,
    Interval(tokio::time::Interval),
    IntervalOrNotify(tokio::time::Interval),
}

impl TriggerDriver {
    fn new(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Once => Self::Once { executed: false },
            Trigger::Notify => Self::Notify,
            Trigger::Interval(period) => Self::Interval(interval(period)),
            Trigger::IntervalOrNotify(period) => Self::IntervalOrNotify(interval(period)),
        }
    }

    /// Wait for the next run. Returns false if the worker should stop.
    async fn wait_next(&mut self, ctx: &WorkerContext) -> bool {
        match self {
            Self::Once { executed } => {
                if *executed {
                    ctx.cancel.cancelled().await;
                    false
                } else {
                    *executed = true;
                    !ctx.cancel.is_cancelled()
                }
            }
            Self::Notify => tokio::select! {
                () = ctx.notify.notified() => true,
                () = ctx.cancel.cancelled() => false,
            },
            Self::Interval(interval) => tokio::select! {
                _ = interval.tick() => true,
                () = ctx.cancel.cancelled() => false,
            },
            Self::IntervalOrNotify(interval) => tokio::select! {
                _ = interval.tick() => true,
                () = ctx.notify.notified() => {
                    interval.reset();
                    true
                },
                () = ctx.cancel.cancelled() => false,
            },
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::{CompactionConfig, StoreConfig},
        store::Store,
    };

    async fn compactor() -> (TempDir, Arc<Compactor>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::at(dir.path().join("worker.db")))
            .await
            .unwrap();
        let compactor = Compactor::new(
            Arc::new(store),
            CompactionConfig::builder().rebuild_every(0).build(),
        );
        (dir, Arc::new(compactor))
    }

    async fn wait_for_passes(compactor: &Compactor, passes: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while compactor.passes() < passes {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_once_runs_a_single_pass() {
        let (_dir, compactor) = compactor().await;
        let handle = spawn(
            compactor.clone(),
            WorkerConfig::builder().trigger(Trigger::Once).build(),
        );
        wait_for_passes(&compactor, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(compactor.passes(), 1);
        assert!(matches!(handle.shutdown().await, WorkerExit::Cancelled));
    }

    #[tokio::test]
    async fn test_notify_runs_on_demand() {
        let (_dir, compactor) = compactor().await;
        let handle = spawn(
            compactor.clone(),
            WorkerConfig::builder().trigger(Trigger::Notify).build(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(compactor.passes(), 0);

        handle.notify();
        wait_for_passes(&compactor, 1).await;
        handle.notify();
        wait_for_passes(&compactor, 2).await;
        assert!(matches!(handle.shutdown().await, WorkerExit::Cancelled));
    }

    #[tokio::test]
    async fn test_interval_keeps_running() {
        let (_dir, compactor) = compactor().await;
        let handle = spawn(
            compactor.clone(),
            WorkerConfig::builder()
                .trigger(Trigger::Interval(Duration::from_millis(20)))
                .build(),
        );
        wait_for_passes(&compactor, 3).await;
        assert!(!handle.is_finished());
        assert!(matches!(handle.shutdown().await, WorkerExit::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_store_is_not_fatal() {
        let (_dir, compactor) = compactor().await;
        compactor.store().close().await.unwrap();
        let handle = spawn(
            compactor.clone(),
            WorkerConfig::builder()
                .trigger(Trigger::Interval(Duration::from_millis(20)))
                .build(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        assert!(matches!(handle.shutdown().await, WorkerExit::Cancelled));
    }
}
