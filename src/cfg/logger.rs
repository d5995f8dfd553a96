// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, path::Path};

use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::cfg::config::Config;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

fn level_for(verbosity: i8) -> &'static str {
    match verbosity {
        i8::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initializes the tracing subscriber.
///
/// Foreground runs log to stderr; daemonized runs append to the configured
/// log file. The `SOCKSLINK_LOG` environment variable overrides the
/// verbosity-derived filter. Must be called before daemonizing: the file
/// appender writes synchronously, so the file descriptor survives the
/// fork.
pub fn init_logger(cfg: &Config) -> Result<()> {
    let filter = match std::env::var("SOCKSLINK_LOG") {
        Ok(value) if !value.is_empty() => {
            EnvFilter::try_new(value).context("invalid SOCKSLINK_LOG filter")?
        },
        _ => EnvFilter::try_new(level_for(cfg.verbosity)).context("invalid log filter")?,
    };

    if cfg.foreground {
        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()));
        // try_init: tests may initialize more than once.
        let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
    } else {
        let dir = cfg.log_file.parent().unwrap_or_else(|| Path::new("."));
        let name = cfg
            .log_file
            .file_name()
            .context("log-file has no file name")?;
        let appender = tracing_appender::rolling::never(dir, name);
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()));
        let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
    }

    Ok(())
}
