// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Signal bridge: turns process signals into control-plane actions on the
//! relay. SIGPIPE is already ignored by the runtime, and SIGCHLD is
//! subsumed by each helper supervisor awaiting its own subprocess.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use crate::server::sockslink::SocksLink;

/// Runs until the daemon is shutting down: SIGINT (or an explicit
/// `begin_exit`) returns, SIGHUP replaces the helper pool, SIGUSR1 dumps
/// the current state to stdout.
pub async fn run(sl: Arc<SocksLink>) -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("can't install SIGINT handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("can't install SIGHUP handler")?;
    let mut user1 =
        signal(SignalKind::user_defined1()).context("can't install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = sl.shutdown.cancelled() => break,
            _ = interrupt.recv() => {
                info!("SIGINT received, exiting");
                sl.begin_exit();
                break;
            },
            _ = hangup.recv() => {
                if let Some(pool) = &sl.pool {
                    info!("SIGHUP received, replacing helpers");
                    pool.reload();
                }
            },
            _ = user1.recv() => sl.dump_state(),
        }
    }
    Ok(())
}
