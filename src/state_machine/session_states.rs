// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection state machine.
//!
//! One accepted client walks Init → (Auth) → PreUpstream → (HelperWait) →
//! Connect → (Negotiate → (UpstreamAuth)) → Splice. The client-side read
//! buffer lives in the context, so a state that needs more bytes decodes
//! from the buffer first and only then reads from the socket: bytes the
//! client pipelined behind its handshake are handled synchronously by the
//! next state instead of waiting for another readiness event.

use std::{net::SocketAddr, pin::Pin, sync::Arc};

use anyhow::{Context, Result, anyhow, ensure};
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::{
        config::{HELPER_AUTH_TIMEOUT, NextHop, SOCKS5_AUTH_TIMEOUT},
        enums::AuthMethod,
    },
    helper::process::Helper,
    models::{
        common::{AUTH_METHOD_INVALID, AUTH_STATUS_FAILURE, AUTH_STATUS_SUCCESS},
        helper_line::{HelperReply, HelperRequest},
        method_select::{MethodSelect, choose_method},
        user_auth::UserAuth,
    },
    server::{
        session::{Credentials, SessionEntry, SessionPhase, io_with_timeout, splice},
        sockslink::SocksLink,
    },
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
};

/// Everything one session owns: both sockets, the buffered client bytes,
/// the negotiated methods and credentials for each side, and the pending
/// helper reply while enqueued.
pub struct SessionCtx {
    pub srv: Arc<SocksLink>,
    pub peer: SocketAddr,
    pub entry: Arc<SessionEntry>,

    client: TcpStream,
    /// Client bytes decoded incrementally; whatever survives the handshake
    /// is flushed to the next hop before splicing.
    rbuf: BytesMut,

    /// Method negotiated with the client.
    method: Option<AuthMethod>,
    /// Credentials the client presented.
    creds: Option<Credentials>,

    /// Method to negotiate with the next hop (helper may override).
    server_method: AuthMethod,
    server_creds: Option<Credentials>,
    /// Helper-provided next hop; `None` falls back to the static one.
    next_hop: Option<NextHop>,
    upstream: Option<TcpStream>,

    helper_rx: Option<oneshot::Receiver<HelperReply>>,
    helper_ref: Option<Arc<Helper>>,

    cancel: CancellationToken,
    state: Option<SessionStates>,
}

impl SessionCtx {
    pub fn new(
        srv: Arc<SocksLink>,
        client: TcpStream,
        peer: SocketAddr,
        entry: Arc<SessionEntry>,
    ) -> Self {
        let cancel = srv.shutdown.clone();
        // Pipe mode skips all SOCKS5 processing on both sides.
        let state = if srv.cfg.pipe {
            Some(SessionStates::Connect(Connect))
        } else {
            Some(SessionStates::Init(Init))
        };
        Self {
            srv,
            peer,
            entry,
            client,
            rbuf: BytesMut::with_capacity(1024),
            method: None,
            creds: None,
            server_method: AuthMethod::None,
            server_creds: None,
            next_hop: None,
            upstream: None,
            helper_rx: None,
            helper_ref: None,
            cancel,
            state,
        }
    }

    /// Reads more handshake bytes; EOF or inactivity here ends the session.
    async fn fill_rbuf(&mut self) -> Result<()> {
        let n = io_with_timeout(
            "client read",
            self.client.read_buf(&mut self.rbuf),
            SOCKS5_AUTH_TIMEOUT,
            &self.cancel,
        )
        .await?;
        ensure!(n > 0, "client closed during handshake");
        Ok(())
    }

    async fn write_client(&mut self, bytes: &[u8]) -> Result<()> {
        io_with_timeout(
            "client write",
            self.client.write_all(bytes),
            SOCKS5_AUTH_TIMEOUT,
            &self.cancel,
        )
        .await
    }

    async fn write_upstream(&mut self, bytes: &[u8]) -> Result<()> {
        let upstream = self.upstream.as_mut().context("no upstream connection")?;
        io_with_timeout(
            "remote server write",
            upstream.write_all(bytes),
            SOCKS5_AUTH_TIMEOUT,
            &self.cancel,
        )
        .await
    }

    async fn read_upstream_pair(&mut self, label: &'static str) -> Result<[u8; 2]> {
        let upstream = self.upstream.as_mut().context("no upstream connection")?;
        let mut raw = [0u8; 2];
        io_with_timeout(
            label,
            upstream.read_exact(&mut raw),
            SOCKS5_AUTH_TIMEOUT,
            &self.cancel,
        )
        .await?;
        Ok(raw)
    }

    /// A USERNAME client is owed a sub-negotiation status before the relay
    /// starts (or refuses) to splice; NONE clients get nothing here.
    async fn notify_client_auth(&mut self, status: u8) -> Result<()> {
        if self.method == Some(AuthMethod::Username) {
            self.write_client(&UserAuth::encode_reply(status)).await?;
        }
        Ok(())
    }

    /// Flushes the refusal reply (already written with `write_all`) behind
    /// a FIN so the client sees it before the close.
    async fn drain_close(&mut self) {
        let _ = self.client.shutdown().await;
    }
}

/// Waiting for the client's method-select record.
#[derive(Debug)]
pub struct Init;

/// Waiting for the client's RFC 1929 sub-negotiation.
#[derive(Debug)]
pub struct Auth;

/// Client side settled; decide between the static next hop and a helper.
#[derive(Debug)]
pub struct PreUpstream;

/// Enqueued on a helper, client reads suspended.
#[derive(Debug)]
pub struct HelperWait;

/// Connecting to the next hop.
#[derive(Debug)]
pub struct Connect;

/// Waiting for the next hop's method-select reply.
#[derive(Debug)]
pub struct Negotiate;

/// Waiting for the next hop's sub-negotiation status.
#[derive(Debug)]
pub struct UpstreamAuth;

/// Relaying bytes in both directions.
#[derive(Debug)]
pub struct Splice;

#[derive(Debug)]
pub enum SessionStates {
    Init(Init),
    Auth(Auth),
    PreUpstream(PreUpstream),
    HelperWait(HelperWait),
    Connect(Connect),
    Negotiate(Negotiate),
    UpstreamAuth(UpstreamAuth),
    Splice(Splice),
}

type SessionStepOut = Transition<SessionStates, Result<()>>;

impl StateMachine<SessionCtx, SessionStepOut> for Init {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            loop {
                match MethodSelect::decode(&mut ctx.rbuf) {
                    Err(e) => {
                        let _ = ctx
                            .write_client(&MethodSelect::encode_reply(AUTH_METHOD_INVALID))
                            .await;
                        ctx.drain_close().await;
                        return Transition::Done(Err(e.into()));
                    },
                    Ok(Some(select)) => {
                        let Some(method) = choose_method(&ctx.srv.cfg.methods, &select.methods)
                        else {
                            debug!("no matching authentication method found");
                            let _ = ctx
                                .write_client(&MethodSelect::encode_reply(AUTH_METHOD_INVALID))
                                .await;
                            ctx.drain_close().await;
                            return Transition::Done(Ok(()));
                        };

                        debug!("using 0x{:02x} authentication method", method.code());
                        ctx.method = Some(method);
                        ctx.entry.set_method(method);
                        if let Err(e) = ctx
                            .write_client(&MethodSelect::encode_reply(method.code()))
                            .await
                        {
                            return Transition::Done(Err(e));
                        }
                        return match method {
                            AuthMethod::None => Transition::Next(
                                SessionStates::PreUpstream(PreUpstream),
                                Ok(()),
                            ),
                            AuthMethod::Username => {
                                Transition::Next(SessionStates::Auth(Auth), Ok(()))
                            },
                        };
                    },
                    Ok(None) => {
                        if let Err(e) = ctx.fill_rbuf().await {
                            return Transition::Done(Err(e));
                        }
                    },
                }
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Auth {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            loop {
                match UserAuth::decode(&mut ctx.rbuf) {
                    Err(e) => {
                        let _ = ctx
                            .write_client(&MethodSelect::encode_reply(AUTH_METHOD_INVALID))
                            .await;
                        ctx.drain_close().await;
                        return Transition::Done(Err(e.into()));
                    },
                    Ok(Some(auth)) => {
                        // No status yet: acceptance is deferred until the
                        // helper or the next hop validates.
                        ctx.creds = Some(Credentials {
                            username: auth.username,
                            password: auth.password,
                        });
                        return Transition::Next(
                            SessionStates::PreUpstream(PreUpstream),
                            Ok(()),
                        );
                    },
                    Ok(None) => {
                        if let Err(e) = ctx.fill_rbuf().await {
                            return Transition::Done(Err(e));
                        }
                    },
                }
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for PreUpstream {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            // Default upstream stance: replay the client's method and
            // credentials. A helper reply may override both.
            ctx.server_method = ctx.method.unwrap_or(AuthMethod::None);
            ctx.server_creds = ctx.creds.clone();

            let Some(pool) = ctx.srv.pool.as_ref() else {
                return Transition::Next(SessionStates::Connect(Connect), Ok(()));
            };

            let request = HelperRequest {
                source: ctx.peer.ip(),
                method: ctx.method.unwrap_or(AuthMethod::None),
                username: ctx.creds.as_ref().map(|c| c.username.clone()),
                password: ctx.creds.as_ref().map(|c| c.password.clone()),
            };

            // While enqueued the session does not touch its client socket;
            // pipelined request bytes stay buffered for the splice.
            match pool.call(&request).await {
                Ok((helper, rx)) => {
                    ctx.helper_ref = Some(helper);
                    ctx.helper_rx = Some(rx);
                    Transition::Next(SessionStates::HelperWait(HelperWait), Ok(()))
                },
                Err(e) => {
                    ctx.drain_close().await;
                    Transition::Done(Err(e.context("helper call failed")))
                },
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for HelperWait {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let rx = match ctx.helper_rx.take() {
                Some(rx) => rx,
                None => return Transition::Done(Err(anyhow!("no pending helper request"))),
            };

            let reply = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Transition::Done(Err(anyhow!("cancelled")));
                },
                res = timeout(HELPER_AUTH_TIMEOUT, rx) => res,
            };

            match reply {
                Err(_) => {
                    // The helper owes a reply and failed to deliver in
                    // time; it goes down with the session.
                    if let Some(helper) = ctx.helper_ref.take() {
                        helper.begin_stop();
                    }
                    Transition::Done(Err(anyhow!("helper authentication timeout")))
                },
                Ok(Err(_)) => {
                    ctx.helper_ref = None;
                    Transition::Done(Err(anyhow!("helper died while authenticating")))
                },
                Ok(Ok(HelperReply::Err(message))) => {
                    ctx.helper_ref = None;
                    debug!(
                        "helper authentication error: {}",
                        message.as_deref().unwrap_or("(no message)")
                    );
                    let _ = ctx.notify_client_auth(AUTH_STATUS_FAILURE).await;
                    ctx.drain_close().await;
                    Transition::Done(Ok(()))
                },
                Ok(Ok(HelperReply::Ok(route))) => {
                    ctx.helper_ref = None;
                    if route.next_hop.is_none() && ctx.srv.cfg.next_hop.is_none() {
                        return Transition::Done(Err(anyhow!(
                            "helper did not send a valid next-hop and no default \
                             route is set with --next-hop"
                        )));
                    }
                    ctx.next_hop = route.next_hop;
                    ctx.server_method = route.method;
                    ctx.server_creds = match (route.username, route.password) {
                        (Some(username), Some(password)) => Some(Credentials {
                            username,
                            password,
                        }),
                        _ => None,
                    };
                    Transition::Next(SessionStates::Connect(Connect), Ok(()))
                },
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Connect {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let hop = ctx.next_hop.clone().or_else(|| ctx.srv.cfg.next_hop.clone());
            let Some(hop) = hop else {
                return Transition::Done(Err(anyhow!("no next-hop configured")));
            };

            let stream = match io_with_timeout(
                "remote server connect",
                TcpStream::connect((hop.host.as_str(), hop.port)),
                SOCKS5_AUTH_TIMEOUT,
                &ctx.cancel,
            )
            .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    return Transition::Done(Err(
                        e.context(format!("can't connect to remote server {hop}"))
                    ));
                },
            };
            debug!("remote server connected");
            ctx.upstream = Some(stream);

            if ctx.srv.cfg.pipe {
                return Transition::Next(SessionStates::Splice(Splice), Ok(()));
            }

            let offer = MethodSelect::encode_offer(ctx.server_method.code());
            if let Err(e) = ctx.write_upstream(&offer).await {
                return Transition::Done(Err(e));
            }
            Transition::Next(SessionStates::Negotiate(Negotiate), Ok(()))
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Negotiate {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let raw = match ctx.read_upstream_pair("remote server method-select").await {
                Ok(raw) => raw,
                Err(e) => return Transition::Done(Err(e)),
            };
            let method = match MethodSelect::parse_reply(raw) {
                Ok(method) => method,
                Err(e) => return Transition::Done(Err(e.into())),
            };
            if method != ctx.server_method.code() {
                return Transition::Done(Err(anyhow!(
                    "remote server picked method 0x{method:02x}, expected 0x{:02x}",
                    ctx.server_method.code()
                )));
            }

            match ctx.server_method {
                AuthMethod::Username => {
                    let creds = match ctx.server_creds.clone() {
                        Some(creds) => creds,
                        None => {
                            return Transition::Done(Err(anyhow!(
                                "username method negotiated without credentials"
                            )));
                        },
                    };
                    let record = match UserAuth::encode(&creds.username, &creds.password) {
                        Ok(record) => record,
                        Err(e) => return Transition::Done(Err(e)),
                    };
                    if let Err(e) = ctx.write_upstream(&record).await {
                        return Transition::Done(Err(e));
                    }
                    Transition::Next(SessionStates::UpstreamAuth(UpstreamAuth), Ok(()))
                },
                AuthMethod::None => {
                    if let Err(e) = ctx.notify_client_auth(AUTH_STATUS_SUCCESS).await {
                        return Transition::Done(Err(e));
                    }
                    Transition::Next(SessionStates::Splice(Splice), Ok(()))
                },
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for UpstreamAuth {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let raw = match ctx.read_upstream_pair("remote server auth reply").await {
                Ok(raw) => raw,
                Err(e) => return Transition::Done(Err(e)),
            };
            let status = match UserAuth::parse_reply(raw) {
                Ok(status) => status,
                Err(e) => return Transition::Done(Err(e.into())),
            };
            if status != AUTH_STATUS_SUCCESS {
                return Transition::Done(Err(anyhow!(
                    "remote server rejected credentials (status 0x{status:02x})"
                )));
            }

            if let Err(e) = ctx.notify_client_auth(AUTH_STATUS_SUCCESS).await {
                return Transition::Done(Err(e));
            }
            Transition::Next(SessionStates::Splice(Splice), Ok(()))
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Splice {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionStepOut: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            let upstream = match ctx.upstream.as_mut() {
                Some(upstream) => upstream,
                None => return Transition::Done(Err(anyhow!("no upstream connection"))),
            };
            let result = splice(&mut ctx.client, upstream, &mut ctx.rbuf, &ctx.cancel).await;
            Transition::Done(result)
        })
    }
}

impl StateMachineCtx<()> for SessionCtx {
    async fn execute(&mut self) -> Result<()> {
        loop {
            let state = self.state.take().context("state must be set for session")?;
            let trans = match state {
                SessionStates::Init(mut s) => {
                    self.entry.set_phase(SessionPhase::ClientInit);
                    s.step(self).await
                },
                SessionStates::Auth(mut s) => {
                    self.entry.set_phase(SessionPhase::ClientAuth);
                    s.step(self).await
                },
                SessionStates::PreUpstream(mut s) => s.step(self).await,
                SessionStates::HelperWait(mut s) => {
                    self.entry.set_phase(SessionPhase::HelperWait);
                    s.step(self).await
                },
                SessionStates::Connect(mut s) => {
                    self.entry.set_phase(SessionPhase::Connect);
                    s.step(self).await
                },
                SessionStates::Negotiate(mut s) => {
                    self.entry.set_phase(SessionPhase::Negotiate);
                    s.step(self).await
                },
                SessionStates::UpstreamAuth(mut s) => {
                    self.entry.set_phase(SessionPhase::UpstreamAuth);
                    s.step(self).await
                },
                SessionStates::Splice(mut s) => {
                    self.entry.set_phase(SessionPhase::Splice);
                    s.step(self).await
                },
            };

            match trans {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(())) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => return r,
            }
        }
    }
}
