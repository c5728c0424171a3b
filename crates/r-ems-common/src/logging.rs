//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the hub runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Environment variables consulted for the filter directive, first match wins.
const FILTER_VARS: [&str; 2] = ["R_EMS_LOG", "RUST_LOG"];
const FALLBACK_DIRECTIVE: &str = "info";

/// Keeps the background writers of the hub's two sinks alive for the whole process.
struct HubSinks {
    _console: WorkerGuard,
    _file: WorkerGuard,
}

static SINKS: OnceCell<HubSinks> = OnceCell::new();

/// Console output format. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the hub subscriber: console output in `config.format` plus a daily rolling
/// JSON file `<prefix>.log` under `config.directory`.
///
/// The filter comes from `R_EMS_LOG`, then `RUST_LOG`, then `info`. Later calls are no-ops.
pub fn init_tracing(binary: &str, config: &LoggingConfig) -> Result<()> {
    if SINKS.get().is_some() {
        return Ok(());
    }
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory.display()))?;

    let file_name = log_file_name(binary, config);
    let (file, file_guard) = tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (console, console_guard) = tracing_appender::non_blocking(std::io::stdout());

    let (directive, source) = filter_directive(|var| std::env::var(var).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("ignoring {source} directive {directive:?} ({err}), logging at {FALLBACK_DIRECTIVE}");
        EnvFilter::new(FALLBACK_DIRECTIVE)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(config.format, console))
        .with(file_layer(file))
        .try_init()
        .is_ok();
    if !installed {
        // Another subscriber owns the process (tests, embedding binaries).
        return Ok(());
    }
    let _ = SINKS.set(HubSinks {
        _console: console_guard,
        _file: file_guard,
    });

    info!(
        binary,
        directory = %config.directory.display(),
        file = %file_name,
        filter = %directive,
        filter_source = source,
        "logging ready"
    );
    Ok(())
}

fn log_file_name(binary: &str, config: &LoggingConfig) -> String {
    format!("{}.log", config.file_prefix.as_deref().unwrap_or(binary))
}

/// Directive and the variable it came from. Blank values are skipped.
fn filter_directive(lookup: impl Fn(&str) -> Option<String>) -> (String, &'static str) {
    FILTER_VARS
        .iter()
        .find_map(|var| {
            lookup(var)
                .filter(|value| !value.trim().is_empty())
                .map(|value| (value, *var))
        })
        .unwrap_or_else(|| (FALLBACK_DIRECTIVE.to_owned(), "default"))
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

fn file_layer<S>(writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .json()
        .with_writer(writer)
        .boxed()
}
