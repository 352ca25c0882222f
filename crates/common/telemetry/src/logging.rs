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

//! Global `tracing` subscriber setup.
//!
//! [`init_global_logging`] installs one subscriber made of:
//!
//! - a reloadable target filter (see [`reload_level`]),
//! - a stdout layer, unless `append_stdout` is off,
//! - an hourly rolling file layer and an error-only rolling file layer when
//!   `dir` is set.
//!
//! Records emitted through the `log` crate are forwarded into `tracing`.

use std::{
    env,
    io::IsTerminal,
    sync::{
        Mutex, Once, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, fmt::MakeWriter, layer::SubscriberExt, registry::LookupSpan,
    reload,
};

/// Default directory for log files, relative to the working directory.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Filter used when neither `level` nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

static RELOAD_HANDLE: OnceLock<reload::Handle<filter::Targets, Registry>> = OnceLock::new();

static STARTED: AtomicBool = AtomicBool::new(false);

static UT_LOG_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoggingError {
    #[snafu(display("Failed to forward log records into tracing"))]
    LogBridge {
        source: tracing_log::log::SetLoggerError,
    },

    #[snafu(display("Failed to create rolling log file in {dir}"))]
    Appender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("Invalid log level filter '{level}'"))]
    InvalidLevel {
        level:  String,
        source: filter::ParseError,
    },

    #[snafu(display("A global tracing subscriber is already installed"))]
    SetSubscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },

    #[snafu(display("Logging has not been initialized"))]
    NotInitialized,

    #[snafu(display("Failed to reload log filter"))]
    Reload { source: reload::Error },
}

/// Deserialize a string field, treating the empty string as
/// `T::default()`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Ok(T::default());
    }
    T::deserialize(de::value::StrDeserializer::new(&s))
        .map_err(|e: de::value::Error| de::Error::custom(format!("invalid value '{s}': {e}")))
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rolling log files. Empty disables file output.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Target filter such as `"info,burrow_common_storage_queue=debug"`.
    /// Falls back to `RUST_LOG`, then `info`.
    pub level: Option<String>,

    #[serde(deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log kind. 720 hourly files is 30 days.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span and span list.
    Json,
    #[default]
    Text,
}

/// Install the global subscriber described by `opts`.
///
/// Log files are named after `app_name`. The returned guards flush the
/// non-blocking writers when dropped, so keep them alive for the life of the
/// process. Only the first call installs anything; later calls return no
/// guards.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    if STARTED.swap(true, Ordering::AcqRel) {
        return Ok(Vec::new());
    }
    let mut guards = Vec::new();

    let level = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_owned());
    let targets = level
        .parse::<filter::Targets>()
        .context(InvalidLevelSnafu { level: &level })?;
    let (dyn_filter, reload_handle) = reload::Layer::new(targets);

    let stdout_layer = if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        Some(fmt_layer(
            writer,
            opts.log_format,
            std::io::stdout().is_terminal(),
        ))
    } else {
        None
    };

    let (file_layer, err_file_layer) = if opts.dir.is_empty() {
        (None, None)
    } else {
        let (writer, guard) = tracing_appender::non_blocking(rolling_appender(app_name, opts)?);
        guards.push(guard);
        let file_layer = fmt_layer(writer, opts.log_format, false);

        let err_appender = rolling_appender(&format!("{app_name}-err"), opts)?;
        let (writer, guard) = tracing_appender::non_blocking(err_appender);
        guards.push(guard);
        let err_file_layer = error_layer(writer, opts.log_format);

        (Some(file_layer), Some(err_file_layer))
    };

    let subscriber = Registry::default()
        .with(dyn_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(err_file_layer);

    LogTracer::init().context(LogBridgeSnafu)?;
    tracing::subscriber::set_global_default(subscriber).context(SetSubscriberSnafu)?;
    let _ = RELOAD_HANDLE.set(reload_handle);

    tracing::info!(
        app = app_name,
        level = %level,
        format = %opts.log_format,
        dir = %opts.dir,
        "Logging initialized"
    );
    Ok(guards)
}

/// Replace the active target filter of the global subscriber.
pub fn reload_level(level: &str) -> Result<(), LoggingError> {
    let targets = level
        .parse::<filter::Targets>()
        .context(InvalidLevelSnafu { level })?;
    let handle = RELOAD_HANDLE.get().context(NotInitializedSnafu)?;
    handle.reload(targets).context(ReloadSnafu)?;
    tracing::info!(level, "Log level reloaded");
    Ok(())
}

/// Logging for tests, safe to call from every test.
///
/// Writes to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) at
/// `UNITTEST_LOG_LEVEL` (default `debug,sqlx=warn`). The writer guards live
/// for the rest of the test process.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_owned());
        let level =
            env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug,sqlx=warn".to_owned());
        let opts = LoggingOptions::builder()
            .dir(dir.clone())
            .level(level)
            .append_stdout(false)
            .build();

        match init_global_logging("unittest", &opts) {
            Ok(guards) => {
                UT_LOG_GUARDS
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(guards);
                tracing::info!("logs dir = {}", dir);
            }
            Err(err) => eprintln!("unit test logging disabled: {err}"),
        }
    });
}

fn rolling_appender(
    prefix: &str,
    opts: &LoggingOptions,
) -> Result<RollingFileAppender, LoggingError> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .context(AppenderSnafu { dir: &opts.dir })
}

fn fmt_layer<S, W>(writer: W, format: LogFormat, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

fn error_layer<S, W>(writer: W, format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt_layer::<S, W>(writer, format, false)
        .with_filter(filter::LevelFilter::ERROR)
        .boxed()
}
