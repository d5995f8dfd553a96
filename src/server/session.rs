// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::{
        config::{SOCKS_IO_TIMEOUT, SOCKS_STREAM_BUFSIZ},
        enums::AuthMethod,
    },
    models::common::AUTH_METHOD_INVALID,
};

/// Runs one socket operation for a session: bounded by the given
/// inactivity timeout, abandoned as soon as the daemon starts shutting
/// down.
pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => bail!("{label} cancelled"),
        res = timeout(io_timeout, fut) => match res {
            Ok(io) => io.with_context(|| format!("{label} failed")),
            Err(_) => bail!("{label} timeout"),
        },
    }
}

/// Cached RFC 1929 credentials, each field bounded to 255 bytes by the wire
/// format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

/// Where a session currently sits in its state machine; mirrored into the
/// registry so SIGUSR1 can report it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    ClientInit = 0,
    ClientAuth = 1,
    HelperWait = 2,
    Connect = 3,
    Negotiate = 4,
    UpstreamAuth = 5,
    Splice = 6,
}

impl SessionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionPhase::ClientInit,
            1 => SessionPhase::ClientAuth,
            2 => SessionPhase::HelperWait,
            3 => SessionPhase::Connect,
            4 => SessionPhase::Negotiate,
            5 => SessionPhase::UpstreamAuth,
            _ => SessionPhase::Splice,
        }
    }
}

/// Registry entry for a live session. The owning task updates it as the
/// state machine advances; readers are the SIGUSR1 dump and tests.
#[derive(Debug)]
pub struct SessionEntry {
    pub peer: SocketAddr,
    phase: AtomicU8,
    method: AtomicU8,
}

impl SessionEntry {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            phase: AtomicU8::new(SessionPhase::ClientInit as u8),
            method: AtomicU8::new(AUTH_METHOD_INVALID),
        }
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn set_method(&self, method: AuthMethod) {
        self.method.store(method.code(), Ordering::Relaxed);
    }

    pub fn method(&self) -> Option<AuthMethod> {
        AuthMethod::from_code(self.method.load(Ordering::Relaxed))
    }
}

/// Symmetric byte copy between client and next-hop, with a per-direction
/// idle timeout. Returns once either side half-closes; a timeout or socket
/// error is an `Err` and drops the session without draining.
///
/// `pending` carries bytes the client pipelined behind its handshake; they
/// are flushed to the server before any socket read.
pub async fn splice(
    client: &mut TcpStream,
    server: &mut TcpStream,
    pending: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut cr, mut cw) = client.split();
    let (mut sr, mut sw) = server.split();

    if !pending.is_empty() {
        sw.write_all(&pending[..])
            .await
            .context("flushing pipelined bytes")?;
        pending.clear();
    }

    let mut cbuf = vec![0u8; SOCKS_STREAM_BUFSIZ];
    let mut sbuf = vec![0u8; SOCKS_STREAM_BUFSIZ];
    let mut client_deadline = Instant::now() + SOCKS_IO_TIMEOUT;
    let mut server_deadline = Instant::now() + SOCKS_IO_TIMEOUT;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled"),
            res = cr.read(&mut cbuf) => {
                let n = res.context("client read")?;
                if n == 0 {
                    debug!("client disconnected");
                    break;
                }
                sw.write_all(&cbuf[..n]).await.context("remote server write")?;
                client_deadline = Instant::now() + SOCKS_IO_TIMEOUT;
            },
            res = sr.read(&mut sbuf) => {
                let n = res.context("remote server read")?;
                if n == 0 {
                    debug!("remote server disconnected");
                    break;
                }
                cw.write_all(&sbuf[..n]).await.context("client write")?;
                server_deadline = Instant::now() + SOCKS_IO_TIMEOUT;
            },
            _ = sleep_until(client_deadline) => bail!("client timeout"),
            _ = sleep_until(server_deadline) => bail!("remote server timeout"),
        }
    }

    // Half-close from either side terminates the session once pending
    // writes are flushed; write_all above already drained them.
    let _ = cw.shutdown().await;
    let _ = sw.shutdown().await;
    Ok(())
}
