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
    path::{Path, PathBuf},
    time::Duration,
};

use burrow_common_storage_queue::{
    Broker, CompactionConfig, CompactionReport, QueueError, RecoveryOutcome, Store, StoreConfig,
    StoreRegistry, Trigger, WorkerConfig, WorkerExit,
};
use burrow_common_telemetry::{
    logging::{LogFormat, LoggingOptions, init_global_logging},
    panic_hook::set_panic_hook,
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Whatever, whatever};
use tracing::info;

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "burrow",
about = "Inspect and maintain burrow queue stores",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Clone, Args)]
struct GlobalArgs {
    /// Store file to operate on.
    #[arg(long, global = true, default_value = "burrow.db")]
    db: PathBuf,

    /// Log filter, e.g. `info,burrow_common_storage_queue=debug`. Defaults to
    /// RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write rolling log files to this directory.
    #[arg(long, global = true)]
    log_dir: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,
}

impl GlobalArgs {
    fn logging_options(&self) -> LoggingOptions {
        LoggingOptions::builder()
            .dir(self.log_dir.clone().unwrap_or_default())
            .maybe_level(self.log_level.clone())
            .log_format(if self.json_logs {
                LogFormat::Json
            } else {
                LogFormat::Text
            })
            .build()
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Demo(DemoArgs),
    Queues(QueuesArgs),
    Progress(ProgressArgs),
    Compact(CompactArgs),
    Rebuild(RebuildArgs),
    Recover(RecoverArgs),
    Evict(EvictArgs),
}

#[derive(Debug, Serialize, Deserialize)]
struct DemoMessage {
    id:      u64,
    content: String,
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Enqueue a batch of messages, drain it with several consumers, then compact.
Each cycle prints the live record count and the store file size, which stay
bounded when every consumer keeps up.
Examples:

burrow demo --db /tmp/demo.db
burrow demo --db /tmp/demo.db --messages 1000 --cycles 5

")]
struct DemoArgs {
    #[arg(long, default_value = "struct_queue")]
    queue: String,

    #[arg(long, default_value_t = 130)]
    messages: u64,

    #[arg(long, default_value_t = 1)]
    cycles: u32,

    #[arg(long, value_delimiter = ',', default_value = "consumer1,consumer2,consumer6")]
    consumers: Vec<String>,
}

impl DemoArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let broker = open_broker(db, CompactionConfig::default()).await?;

        for cycle in 1..=self.cycles {
            for i in 1..=self.messages {
                let message = DemoMessage {
                    id:      i,
                    content: format!("Message #{i}"),
                };
                broker
                    .enqueue(&self.queue, &message)
                    .await
                    .whatever_context("enqueue failed")?;
            }

            for consumer in &self.consumers {
                let drained = drain(&broker, &self.queue, consumer).await?;
                info!(cycle, consumer = %consumer, drained, "Consumer drained queue");
            }

            let report = broker.compact().await.whatever_context("compaction failed")?;
            let live = broker
                .len(&self.queue)
                .await
                .whatever_context("failed to count records")?;
            let size = broker
                .store()
                .file_size()
                .await
                .whatever_context("failed to stat store file")?;
            println!(
                "cycle {cycle}: deleted {} records, {live} live, store file {size} bytes",
                report.deleted()
            );
        }

        broker.close().await.whatever_context("failed to close store")
    }
}

async fn drain(broker: &Broker, queue: &str, consumer: &str) -> Result<u64, Whatever> {
    let mut drained = 0;
    loop {
        match broker.dequeue::<DemoMessage>(queue, consumer).await {
            Ok(delivered) => {
                delivered.ack().await.whatever_context("ack failed")?;
                drained += 1;
            }
            Err(err) if err.is_no_more_messages() => return Ok(drained),
            Err(err) => return Err(err).whatever_context("dequeue failed"),
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

List queues with their live record count and last sequence.
Examples:

burrow queues --db /var/lib/burrow.db

")]
struct QueuesArgs {}

impl QueuesArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let broker = open_broker(db, CompactionConfig::default()).await?;
        for name in broker.queues().await.whatever_context("failed to list queues")? {
            let live = broker.len(&name).await.whatever_context("failed to count records")?;
            let last = broker
                .last_sequence(&name)
                .await
                .whatever_context("failed to read sequence")?;
            println!("{name}\tlive={live}\tlast_sequence={last}");
        }
        broker.close().await.whatever_context("failed to close store")
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Show consumer cursors: the last acknowledged sequence per consumer.
Examples:

burrow progress --db /var/lib/burrow.db
burrow progress --db /var/lib/burrow.db --queue struct_queue

")]
struct ProgressArgs {
    /// Only this queue.
    #[arg(long)]
    queue: Option<String>,
}

impl ProgressArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let broker = open_broker(db, CompactionConfig::default()).await?;
        let queues = match &self.queue {
            Some(queue) => vec![queue.clone()],
            None => broker.queues().await.whatever_context("failed to list queues")?,
        };
        for queue in queues {
            let last = broker
                .last_sequence(&queue)
                .await
                .with_whatever_context(|_| format!("unknown queue {queue}"))?;
            for cursor in broker
                .consumers(&queue)
                .await
                .whatever_context("failed to read cursors")?
            {
                println!(
                    "{queue}\t{}\tacked={}\tbehind={}\ttouched_at={}",
                    cursor.consumer,
                    cursor.offset,
                    last.saturating_sub(cursor.offset),
                    cursor.touched_at.to_rfc3339()
                );
            }
        }
        broker.close().await.whatever_context("failed to close store")
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Run compaction: delete records every consumer has acknowledged and rebuild the
store file. With --interval, keep running in the background until Ctrl-C.
Examples:

burrow compact --db /var/lib/burrow.db
burrow compact --db /var/lib/burrow.db --interval 60 --rebuild-every 10

")]
struct CompactArgs {
    /// Rebuild the store file every N passes; 0 never rebuilds.
    #[arg(long, default_value_t = 1)]
    rebuild_every: u32,

    /// Seconds between passes. Runs a single pass when omitted.
    #[arg(long)]
    interval: Option<u64>,
}

impl CompactArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let compaction = CompactionConfig::builder()
            .rebuild_every(self.rebuild_every)
            .build();
        let broker = open_broker(db, compaction).await?;

        match self.interval {
            None => {
                let report = broker.compact().await.whatever_context("compaction failed")?;
                print_report(&report);
            }
            Some(secs) => {
                let handle = broker.spawn_compaction(
                    WorkerConfig::builder()
                        .trigger(Trigger::Interval(Duration::from_secs(secs)))
                        .build(),
                );
                tokio::signal::ctrl_c()
                    .await
                    .whatever_context("failed to listen for Ctrl-C")?;
                if let WorkerExit::Fatal(err) = handle.shutdown().await {
                    return Err(err).whatever_context("compaction worker stopped");
                }
            }
        }
        broker.close().await.whatever_context("failed to close store")
    }
}

fn print_report(report: &CompactionReport) {
    for queue in &report.queues {
        println!(
            "{}\t{}\tdeleted={}\tlast_sequence={}",
            queue.queue, queue.action, queue.deleted, queue.last_sequence
        );
    }
    if let Some(rebuild) = &report.rebuild {
        println!(
            "rebuilt: {} -> {} bytes",
            rebuild.size_before, rebuild.size_after
        );
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Rebuild the store file now to hand freed pages back to the filesystem.
Examples:

burrow rebuild --db /var/lib/burrow.db

")]
struct RebuildArgs {}

impl RebuildArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let broker = open_broker(db, CompactionConfig::default()).await?;
        let report = broker.rebuild().await.whatever_context("rebuild failed")?;
        println!(
            "rebuilt {} collections, {} entries: {} -> {} bytes",
            report.collections, report.entries, report.size_before, report.size_after
        );
        broker.close().await.whatever_context("failed to close store")
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Repair a store left behind by an interrupted rebuild. Safe to run on a
healthy store.
Examples:

burrow recover --db /var/lib/burrow.db

")]
struct RecoverArgs {}

impl RecoverArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let outcome = Store::recover(&StoreConfig::at(db))
            .await
            .whatever_context("recovery failed")?;
        match outcome {
            RecoveryOutcome::Clean => println!("no interrupted rebuild found"),
            RecoveryOutcome::StaleBackupRemoved => println!("removed stale backup"),
            RecoveryOutcome::Replayed {
                collections,
                entries,
            } => println!("restored {collections} collections, {entries} entries from backup"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Forget consumer cursors so they no longer hold back compaction.
Examples:

burrow evict --db /var/lib/burrow.db --queue struct_queue --consumer consumer6
burrow evict --db /var/lib/burrow.db --idle-secs 86400

")]
struct EvictArgs {
    #[arg(long, requires = "consumer")]
    queue: Option<String>,

    #[arg(long, requires = "queue")]
    consumer: Option<String>,

    /// Evict every cursor not touched for this many seconds.
    #[arg(long, conflicts_with_all = ["queue", "consumer"])]
    idle_secs: Option<u64>,
}

impl EvictArgs {
    async fn run(&self, db: &Path) -> Result<(), Whatever> {
        let broker = open_broker(db, CompactionConfig::default()).await?;
        match (&self.queue, &self.consumer, self.idle_secs) {
            (Some(queue), Some(consumer), None) => {
                let evicted = broker
                    .evict_consumer(consumer, queue)
                    .await
                    .whatever_context("eviction failed")?;
                println!("evicted {consumer} from {queue}: {evicted}");
            }
            (None, None, Some(secs)) => {
                let evicted = broker
                    .evict_idle(Duration::from_secs(secs))
                    .await
                    .whatever_context("eviction failed")?;
                println!("evicted {evicted}");
            }
            _ => whatever!("pass --queue with --consumer, or --idle-secs"),
        }
        broker.close().await.whatever_context("failed to close store")
    }
}

async fn open_broker(db: &Path, compaction: CompactionConfig) -> Result<Broker, Whatever> {
    match Broker::open(&StoreRegistry::new(), StoreConfig::at(db), compaction).await {
        Ok(broker) => Ok(broker),
        Err(QueueError::RecoveryRequired { backup, .. }) => whatever!(
            "store {} has an interrupted rebuild (backup {}); run `burrow recover` first",
            db.display(),
            backup.display()
        ),
        Err(err) => Err(err).with_whatever_context(|_| format!("failed to open {}", db.display())),
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let _guards = init_global_logging("burrow", &cli.global.logging_options())
        .whatever_context("failed to initialize logging")?;
    set_panic_hook();

    let db = cli.global.db.as_path();
    match cli.commands {
        Commands::Demo(args) => args.run(db).await,
        Commands::Queues(args) => args.run(db).await,
        Commands::Progress(args) => args.run(db).await,
        Commands::Compact(args) => args.run(db).await,
        Commands::Rebuild(args) => args.run(db).await,
        Commands::Recover(args) => args.run(db).await,
        Commands::Evict(args) => args.run(db).await,
    }
}
