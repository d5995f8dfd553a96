// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single helper subprocess and its supervisor task.
//!
//! The helper answers one newline-terminated reply on stdout per request
//! line written to its stdin; replies pair 1:1 with the FIFO of waiting
//! sessions in arrival order. stderr is not part of the protocol and is
//! forwarded to the log at error level.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{Mutex, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    cfg::config::{HELPER_AUTH_TIMEOUT, HELPER_STARTUP_TIMEOUT},
    helper::pool::PoolInner,
    models::helper_line::HelperReply,
};

#[derive(Debug)]
pub struct Helper {
    pub pid: u32,
    stdin: Mutex<ChildStdin>,
    /// Reply senders, one per in-flight request, in request order.
    queue: StdMutex<VecDeque<oneshot::Sender<HelperReply>>>,
    /// True once the first request has been accepted on stdin.
    served: AtomicBool,
    /// Counted in the pool's `helpers_running` while true.
    running: AtomicBool,
    /// Set once the subprocess is known to have exited.
    dying: AtomicBool,
    stop: CancellationToken,
}

impl Helper {
    pub(crate) fn new(pid: u32, stdin: ChildStdin) -> Self {
        Self {
            pid,
            stdin: Mutex::new(stdin),
            queue: StdMutex::new(VecDeque::new()),
            served: AtomicBool::new(false),
            running: AtomicBool::new(true),
            dying: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    /// Asks the supervisor to tear this helper down.
    pub fn begin_stop(&self) {
        self.stop.cancel();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("helper queue poisoned").len()
    }

    fn dequeue(&self) -> Option<oneshot::Sender<HelperReply>> {
        self.queue
            .lock()
            .expect("helper queue poisoned")
            .pop_front()
    }

    /// Drops every queued sender; the paired sessions observe a closed
    /// channel and disconnect.
    fn fail_pending(&self) {
        let mut queue = self.queue.lock().expect("helper queue poisoned");
        if !queue.is_empty() {
            debug!(
                "helper[{}] dropping {} queued client(s)",
                self.pid,
                queue.len()
            );
        }
        queue.clear();
    }

    /// Writes one request line and enqueues the session at the FIFO tail.
    ///
    /// The stdin lock is held across enqueue and write so concurrent
    /// requests keep the FIFO in the same order as the lines on the wire.
    /// The first write uses the startup timeout; either timeout or a write
    /// error tears the helper down.
    pub(crate) async fn send_request(
        self: &Arc<Self>,
        line: &str,
    ) -> Result<oneshot::Receiver<HelperReply>> {
        let mut stdin = self.stdin.lock().await;

        let write_timeout = if self.served.swap(true, Ordering::SeqCst) {
            HELPER_AUTH_TIMEOUT
        } else {
            HELPER_STARTUP_TIMEOUT
        };

        let (tx, rx) = oneshot::channel();
        self.queue
            .lock()
            .expect("helper queue poisoned")
            .push_back(tx);

        match timeout(write_timeout, stdin.write_all(line.as_bytes())).await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => {
                self.begin_stop();
                Err(e).with_context(|| format!("helper[{}] stdin write failed", self.pid))
            },
            Err(_) => {
                self.begin_stop();
                bail!("helper[{}] stdin write timeout", self.pid)
            },
        }
    }
}

async fn log_stderr(pid: u32, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        error!("helper[{pid}]: {line}");
    }
}

/// Owns the subprocess for its whole life: pairs stdout replies with the
/// FIFO, then tears the helper down on EOF, timeout, desync or an explicit
/// stop.
pub(crate) async fn supervise(
    pool: Arc<PoolInner>,
    helper: Arc<Helper>,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
) {
    let pid = helper.pid;
    let stderr_task = tokio::spawn(log_stderr(pid, stderr));
    let mut lines = BufReader::new(stdout).lines();

    loop {
        // Arm the read timeout only while replies are owed, like the
        // per-operation timeout on the helper's pipes.
        let pending = helper.queue_len() > 0;
        let next = tokio::select! {
            _ = helper.stop.cancelled() => break,
            res = async {
                if pending {
                    timeout(HELPER_AUTH_TIMEOUT, lines.next_line()).await.ok()
                } else {
                    Some(lines.next_line().await)
                }
            } => res,
        };

        let line = match next {
            None => {
                warn!("helper[{pid}] authentication timeout");
                break;
            },
            Some(Ok(Some(line))) => line,
            Some(Ok(None)) => {
                debug!("helper[{pid}] died");
                break;
            },
            Some(Err(e)) => {
                warn!("helper[{pid}] stdout read error: {e}");
                break;
            },
        };

        match helper.dequeue() {
            None => {
                error!("helper[{pid}] sent data, but no clients in auth queue, ignoring data");
            },
            Some(tx) => match HelperReply::parse(&line) {
                // The session may have given up in the meantime; a failed
                // send is its cancellation, not an error.
                Ok(reply) => {
                    let _ = tx.send(reply);
                },
                Err(e) => {
                    // Malformed reply: the paired session is disconnected
                    // (sender dropped), the helper stays up.
                    error!("helper[{pid}] sent an invalid answer: {e:#}");
                },
            },
        }
    }

    stderr_task.abort();
    teardown(&pool, &helper, &mut child).await;
}

/// `helper_stop`: unlink, fix the running counter, disconnect queued
/// sessions, then make sure the subprocess is dead and reaped.
async fn teardown(pool: &Arc<PoolInner>, helper: &Arc<Helper>, child: &mut Child) {
    let pid = helper.pid;
    debug!("helper[{pid}] stopping");

    pool.unlink(helper);
    if helper.running.swap(false, Ordering::SeqCst) {
        pool.note_stopped();
    }
    helper.fail_pending();

    let mut reaped = matches!(child.try_wait(), Ok(Some(_)));
    if reaped {
        helper.dying.store(true, Ordering::SeqCst);
    }

    if !helper.is_dying() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        for _ in 0..2 {
            if matches!(child.try_wait(), Ok(Some(_))) {
                reaped = true;
                break;
            }
            // Give the helper a moment to finish its stuff.
            sleep(Duration::from_millis(100)).await;
        }
        if !reaped {
            let _ = child.start_kill();
        }
    }

    if !reaped {
        // Unlike the C SIGCHLD dance, wait() both blocks until the
        // subprocess is gone and reaps it.
        let _ = child.wait().await;
    }
    helper.dying.store(true, Ordering::SeqCst);

    pool.request_refill();
    debug!("helper[{pid}] stopped");
}
