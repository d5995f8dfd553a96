// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The helper pool: spawns up to `helpers_max` subprocesses, dispatches
//! authorization requests round-robin, and refills the pool whenever a
//! helper goes away.

use std::{
    collections::VecDeque,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::{process::Command, sync::Notify, sync::oneshot, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::HELPERS_REFILL_POOL_TIMEOUT,
    helper::process::{Helper, supervise},
    models::helper_line::{HelperReply, HelperRequest},
};

pub(crate) struct PoolInner {
    command: PathBuf,
    helpers_max: usize,
    /// Rotation order for round-robin dispatch.
    helpers: StdMutex<VecDeque<Arc<Helper>>>,
    /// Count of helpers that are running and not dying.
    running: AtomicUsize,
    refill: Notify,
    shutdown: CancellationToken,
}

impl PoolInner {
    pub(crate) fn unlink(&self, helper: &Arc<Helper>) {
        self.helpers
            .lock()
            .expect("helper list poisoned")
            .retain(|h| !Arc::ptr_eq(h, helper));
    }

    pub(crate) fn note_stopped(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn request_refill(&self) {
        self.refill.notify_one();
    }
}

/// One helper's slice of the SIGUSR1 state dump.
#[derive(Debug, Serialize)]
pub struct HelperDump {
    pub pid: u32,
    pub running: bool,
    pub dying: bool,
    pub queued: usize,
}

pub struct HelperPool {
    inner: Arc<PoolInner>,
}

impl HelperPool {
    pub fn new(command: PathBuf, helpers_max: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                command,
                helpers_max,
                helpers: StdMutex::new(VecDeque::new()),
                running: AtomicUsize::new(0),
                refill: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Launches the refill task and asks it for the initial spawn.
    pub fn start(&self) {
        debug!("starting {} helpers", self.inner.helpers_max);
        tokio::spawn(refill_loop(self.inner.clone()));
        self.inner.refill.notify_one();
    }

    /// Stops the refill task and every helper. Supervisors finish the
    /// SIGTERM/SIGKILL ladder in the background.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        for helper in self.snapshot() {
            helper.begin_stop();
        }
    }

    /// SIGHUP: replace every helper. Current helpers are torn down (their
    /// queued sessions disconnect) and the refill task spawns fresh ones.
    pub fn reload(&self) {
        info!("replacing helpers");
        for helper in self.snapshot() {
            helper.begin_stop();
        }
        self.inner.refill.notify_one();
    }

    pub fn helpers_running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> bool {
        self.helpers_running() > 0
    }

    /// Pids of the live helpers, rotation order.
    pub fn helper_pids(&self) -> Vec<u32> {
        self.snapshot().iter().map(|h| h.pid).collect()
    }

    pub fn dump(&self) -> Vec<HelperDump> {
        self.snapshot()
            .iter()
            .map(|h| HelperDump {
                pid: h.pid,
                running: h.is_running(),
                dying: h.is_dying(),
                queued: h.queue_len(),
            })
            .collect()
    }

    /// Picks a helper round-robin and writes one request line; the returned
    /// receiver yields this request's reply. Fails when no helper can take
    /// the call, arming a refill either way.
    pub async fn call(
        &self,
        request: &HelperRequest,
    ) -> Result<(Arc<Helper>, oneshot::Receiver<HelperReply>)> {
        let Some(helper) = self.round_robin() else {
            self.inner.refill.notify_one();
            bail!("no helper available");
        };
        if helper.is_dying() {
            self.inner.refill.notify_one();
            bail!("helper[{}] is dying", helper.pid);
        }

        let line = request.encode();
        let rx = helper.send_request(&line).await?;
        Ok((helper, rx))
    }

    fn round_robin(&self) -> Option<Arc<Helper>> {
        let mut helpers = self.inner.helpers.lock().expect("helper list poisoned");
        if helpers.len() > 1 {
            let head = helpers.pop_front()?;
            helpers.push_back(head);
            helpers.back().cloned()
        } else {
            helpers.front().cloned()
        }
    }

    fn snapshot(&self) -> Vec<Arc<Helper>> {
        self.inner
            .helpers
            .lock()
            .expect("helper list poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

fn spawn_one(inner: &Arc<PoolInner>) -> Result<()> {
    let mut child = Command::new(&inner.command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("can't spawn helper {}", inner.command.display()))?;

    let pid = child.id().context("spawned helper has no pid")?;
    let stdin = child.stdin.take().context("helper stdin not piped")?;
    let stdout = child.stdout.take().context("helper stdout not piped")?;
    let stderr = child.stderr.take().context("helper stderr not piped")?;

    let helper = Arc::new(Helper::new(pid, stdin));
    inner
        .helpers
        .lock()
        .expect("helper list poisoned")
        .push_back(helper.clone());
    inner.running.fetch_add(1, Ordering::SeqCst);

    info!("helper[{pid}] started ({})", inner.command.display());
    tokio::spawn(supervise(inner.clone(), helper, child, stdout, stderr));
    Ok(())
}

/// Tops the pool back up to `helpers_max`, on a fixed tick and whenever a
/// teardown or failed dispatch pokes the notifier.
async fn refill_loop(inner: Arc<PoolInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.refill.notified() => {},
            _ = sleep(HELPERS_REFILL_POOL_TIMEOUT) => {},
        }

        while !inner.shutdown.is_cancelled()
            && inner.running.load(Ordering::SeqCst) < inner.helpers_max
        {
            if let Err(e) = spawn_one(&inner) {
                warn!("error while starting helper: {e:#}");
                break;
            }
        }
    }
}
