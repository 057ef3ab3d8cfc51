//! Logging for the command line tool: text or JSON events on stderr or in a
//! log file, optionally mirrored to the systemd journal.
use std::fs::OpenOptions;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

use crate::GlobalOpts;

const SYSLOG_IDENTIFIER: &str = "appctl";

#[derive(clap::ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Debug builds log everything useful for development, release builds only errors
const DEFAULT_LOG_LEVEL: Level = if cfg!(debug_assertions) {
    Level::DEBUG
} else {
    Level::ERROR
};

// `--log-level` wins over `--debug` when both are given
fn log_level(opts: &GlobalOpts) -> Level {
    match opts.log_level {
        Some(level) => level,
        None if opts.debug => Level::DEBUG,
        None => DEFAULT_LOG_LEVEL,
    }
}

pub fn init(opts: &GlobalOpts) -> Result<()> {
    let writer = match &opts.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path:?}"))?;
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let events = match opts.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .with_writer(writer)
            .boxed(),
    };

    let journald = if opts.systemd_log {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_syslog_identifier(SYSLOG_IDENTIFIER.to_owned())),
            Err(err) => {
                // not fatal, e.g. no journald inside a build container
                eprintln!("failed to initialize journald logging: {err:?}");
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(events)
        .with(journald)
        .with(LevelFilter::from_level(log_level(opts)))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))
}
