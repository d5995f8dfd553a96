// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};

use anyhow::{Context, Result, ensure};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::cfg::config::{Config, LISTEN_BACKLOG, LISTEN_FDS_MAX};

/// Binds every configured listen address.
///
/// Each address may resolve to several socket addresses; a failure to bind
/// one of them is logged and skipped. Startup only fails when nothing could
/// be bound at all.
pub fn bind_all(cfg: &Config) -> Result<Vec<StdTcpListener>> {
    let mut listeners = Vec::new();

    for address in &cfg.addresses {
        let resolved = match (address.as_str(), cfg.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                warn!("can't resolve {address} port {}: {e}", cfg.port);
                continue;
            },
        };

        for addr in resolved {
            if listeners.len() >= LISTEN_FDS_MAX {
                warn!(
                    "skipping address, can't listen on more than {LISTEN_FDS_MAX} sockets"
                );
                break;
            }
            match bind_one(cfg, addr) {
                Ok(listener) => {
                    info!("listening on {addr}");
                    listeners.push(listener);
                },
                Err(e) => warn!("can't listen on {addr}: {e:#}"),
            }
        }
    }

    ensure!(!listeners.is_empty(), "can't listen on any specified interface");
    Ok(listeners)
}

fn bind_one(cfg: &Config, addr: SocketAddr) -> Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("can't create socket")?;

    socket
        .set_reuse_address(true)
        .context("can't reuse address")?;
    if addr.is_ipv6() {
        // Without this, the "::" wildcard would shadow the v4 listener.
        socket.set_only_v6(true).context("can't set v6only flag")?;
    }
    socket
        .set_nonblocking(true)
        .context("can't set socket non-blocking")?;
    if let Some(iface) = &cfg.interface {
        socket
            .bind_device(Some(iface.as_bytes()))
            .with_context(|| format!("can't bind to device {iface}"))?;
    }

    socket.bind(&addr.into()).context("bind failed")?;
    socket.listen(LISTEN_BACKLOG).context("listen failed")?;
    Ok(socket.into())
}
