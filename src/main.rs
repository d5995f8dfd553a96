// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use sockslink::{
    cfg::{cli::Cli, config::Config, logger::init_logger},
    daemonize::{daemonize, drop_privileges, open_pidfile, set_max_fds, write_pid},
    server::sockslink::SocksLink,
};
use tracing::error;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_cli(cli)?;
    init_logger(&cfg)?;

    if let Err(e) = run(cfg) {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

fn run(cfg: Config) -> Result<()> {
    if let Some(max_fds) = cfg.max_fds {
        set_max_fds(max_fds)?;
    }

    let sl = SocksLink::new(cfg);
    sl.bind()?;

    // Grab the pid-file while still privileged and before forking; the pid
    // itself is only known (and written) after the fork.
    let pidfile = match &sl.cfg.pidfile {
        Some(path) => Some(open_pidfile(path)?),
        None => None,
    };

    if !sl.cfg.foreground {
        daemonize()?;
    }

    drop_privileges(sl.cfg.user.as_deref(), sl.cfg.group.as_deref()).with_context(|| {
        format!(
            "failed to drop privileges ({}:{})",
            sl.cfg.user.as_deref().unwrap_or("<none>"),
            sl.cfg.group.as_deref().unwrap_or("<none>")
        )
    })?;

    if let Some(pidfile) = pidfile {
        write_pid(pidfile)?;
    }

    // The runtime is built here, after the fork: forking a live runtime is
    // not an option.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("can't initialize the runtime")?;
    let result = runtime.block_on(sl.clone().run());

    if let Some(path) = &sl.cfg.pidfile {
        let _ = fs::remove_file(path);
    }
    result
}
