// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-process relay state: listeners, live sessions, the helper pool
//! and the lifecycle tying them together.

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, ensure};
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::{
    cfg::config::Config,
    helper::pool::{HelperDump, HelperPool},
    server::{
        listener,
        session::{SessionEntry, SessionPhase},
        signals,
    },
    state_machine::{common::StateMachineCtx, session_states::SessionCtx},
};

pub struct SocksLink {
    pub cfg: Config,
    pub pool: Option<HelperPool>,

    /// Live sessions, keyed by a monotonically increasing id. Entries are
    /// inserted on accept and removed by the session task's drop guard.
    sessions: DashMap<u64, Arc<SessionEntry>>,
    session_seq: AtomicU64,

    /// Bound listen sockets, parked here between `bind` and `run`.
    listeners: StdMutex<Vec<StdTcpListener>>,
    bound: StdMutex<Vec<SocketAddr>>,

    pub(crate) shutdown: CancellationToken,
    exiting: AtomicBool,
}

impl SocksLink {
    pub fn new(cfg: Config) -> Arc<Self> {
        let pool = cfg
            .helper_command
            .as_ref()
            .map(|cmd| HelperPool::new(cmd.clone(), cfg.helpers_max));
        Arc::new(Self {
            cfg,
            pool,
            sessions: DashMap::new(),
            session_seq: AtomicU64::new(1),
            listeners: StdMutex::new(Vec::new()),
            bound: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            exiting: AtomicBool::new(false),
        })
    }

    /// Binds every configured listen address. Must be called before `run`;
    /// kept separate so the binary can bind before daemonizing and
    /// dropping privileges.
    pub fn bind(&self) -> Result<()> {
        let listeners = listener::bind_all(&self.cfg)?;
        *self.bound.lock().expect("listener list poisoned") = listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect();
        *self.listeners.lock().expect("listener list poisoned") = listeners;
        Ok(())
    }

    /// Addresses actually bound (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().expect("listener list poisoned").clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Breaks the run loop; the normal-termination path.
    pub fn begin_exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    /// Serves until SIGINT or `begin_exit`. Consumes the bound listeners,
    /// starts the helper pool and the signal bridge, then tears everything
    /// down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listeners =
            std::mem::take(&mut *self.listeners.lock().expect("listener list poisoned"));
        ensure!(!listeners.is_empty(), "bind() must be called before run()");

        let mut accepts = JoinSet::new();
        for std_listener in listeners {
            let listener =
                TcpListener::from_std(std_listener).context("can't register listener")?;
            accepts.spawn(accept_loop(self.clone(), listener));
        }

        if let Some(pool) = &self.pool {
            pool.start();
        }

        debug!("entering loop");
        signals::run(self.clone()).await?;
        debug!("loop exited");

        self.stop();
        while accepts.join_next().await.is_some() {}
        Ok(())
    }

    /// Disconnects sessions, closes listeners and stops the pool. Sessions
    /// observe the cancelled token and unlink themselves.
    pub fn stop(&self) {
        info!("stopping sockslink");
        self.shutdown.cancel();
        if let Some(pool) = &self.pool {
            pool.stop();
        }
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.session_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(SessionEntry::new(peer));
        self.sessions.insert(id, entry.clone());

        let srv = self.clone();
        let span = debug_span!("session", id, peer = %peer);
        tokio::spawn(
            async move {
                info!("client connected");
                let guard = SessionGuard {
                    srv: srv.clone(),
                    id,
                };
                let mut ctx = SessionCtx::new(srv, stream, peer, entry);
                match ctx.execute().await {
                    Ok(()) => debug!("session finished"),
                    Err(e) => debug!("session ended: {e:#}"),
                }
                drop(guard);
            }
            .instrument(span),
        );
    }

    /// SIGUSR1: dump listeners, configuration, sessions and helpers to
    /// stdout.
    pub fn dump_state(&self) {
        let dump = StateDump {
            listen: self.local_addrs().iter().map(|a| a.to_string()).collect(),
            config: &self.cfg,
            sessions: self
                .sessions
                .iter()
                .map(|entry| SessionDump {
                    id: *entry.key(),
                    peer: entry.value().peer.to_string(),
                    phase: entry.value().phase(),
                    method: entry.value().method().map(|m| m.to_string()),
                })
                .collect(),
            helpers: self.pool.as_ref().map(|p| p.dump()).unwrap_or_default(),
            helpers_running: self.pool.as_ref().map(|p| p.helpers_running()).unwrap_or(0),
        };
        match serde_json::to_string_pretty(&dump) {
            Ok(text) => println!("{text}"),
            Err(e) => warn!("can't serialize state dump: {e}"),
        }
    }
}

/// Removes the session from the registry when its task ends, however it
/// ends.
struct SessionGuard {
    srv: Arc<SocksLink>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.srv.sessions.remove(&self.id);
    }
}

async fn accept_loop(sl: Arc<SocksLink>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = sl.shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => sl.spawn_session(stream, peer),
                Err(e) => warn!("accept failed: {e}"),
            },
        }
    }
}

#[derive(Serialize)]
struct SessionDump {
    id: u64,
    peer: String,
    phase: SessionPhase,
    method: Option<String>,
}

#[derive(Serialize)]
struct StateDump<'a> {
    listen: Vec<String>,
    config: &'a Config,
    sessions: Vec<SessionDump>,
    helpers: Vec<HelperDump>,
    helpers_running: usize,
}
