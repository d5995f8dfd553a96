// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Line protocol spoken with authentication/routing helpers.
//!
//! One request per line on the helper's stdin, one reply per line on its
//! stdout; username, password and error tokens are urlencoded; a next-hop
//! of `default` means "use the static next-hop":
//!
//! ```text
//! stdin>  SOURCE-IP METHOD [USERNAME [PASSWORD]]
//! stdout< OK NEXT-HOP NEXT-HOP-PORT METHOD [USERNAME [PASSWORD]]
//! stdout< ERR [MESSAGE]
//! ```
//!
//! stderr carries free-form diagnostics and is not part of the protocol.

use std::net::IpAddr;

use anyhow::{Context, Result, bail, ensure};

use crate::{
    cfg::{config::NextHop, enums::AuthMethod},
    models::common::AUTH_FIELD_MAX,
    utils::{urldecode, urlencode},
};

/// One authorization request, written to the helper's stdin.
#[derive(Debug, Clone)]
pub struct HelperRequest {
    pub source: IpAddr,
    pub method: AuthMethod,
    pub username: Option<Vec<u8>>,
    pub password: Option<Vec<u8>>,
}

impl HelperRequest {
    /// Renders the newline-terminated request line. Credentials are only
    /// sent for the `username` method.
    pub fn encode(&self) -> String {
        let mut line = format!("{} {}", self.source, self.method);
        if self.method == AuthMethod::Username {
            let uname = self.username.as_deref().unwrap_or_default();
            let passwd = self.password.as_deref().unwrap_or_default();
            line.push(' ');
            line.push_str(&urlencode(uname));
            line.push(' ');
            line.push_str(&urlencode(passwd));
        }
        line.push('\n');
        line
    }
}

/// Next hop and upstream credentials extracted from an `OK` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperRoute {
    /// `None` means the helper answered `default`: use the static next-hop.
    pub next_hop: Option<NextHop>,
    pub method: AuthMethod,
    pub username: Option<Vec<u8>>,
    pub password: Option<Vec<u8>>,
}

/// A parsed helper reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperReply {
    Ok(HelperRoute),
    Err(Option<String>),
}

impl HelperReply {
    /// Tokenizes one stdout line (runs of whitespace collapse) and parses
    /// it. The first token alone decides between `OK` and `ERR`; anything
    /// else is a protocol violation.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("OK") => {
                let host = tokens.next().context("OK reply missing next-hop")?;
                let port = tokens.next().context("OK reply missing next-hop port")?;
                let next_hop = if host == "default" {
                    None
                } else {
                    let port = port
                        .parse::<u16>()
                        .with_context(|| format!("invalid next-hop port {port:?}"))?;
                    Some(NextHop {
                        host: host.to_string(),
                        port,
                    })
                };

                let method = tokens.next().context("OK reply missing method")?;
                let route = match method {
                    "none" => {
                        ensure!(
                            tokens.next().is_none(),
                            "unexpected credentials after method \"none\""
                        );
                        HelperRoute {
                            next_hop,
                            method: AuthMethod::None,
                            username: None,
                            password: None,
                        }
                    },
                    "username" => {
                        let uname = tokens.next().context("method \"username\" missing username")?;
                        let passwd = tokens.next().context("method \"username\" missing password")?;
                        ensure!(
                            tokens.next().is_none(),
                            "trailing tokens after credentials"
                        );
                        let username = urldecode(uname)?;
                        let password = urldecode(passwd)?;
                        ensure!(
                            username.len() <= AUTH_FIELD_MAX && password.len() <= AUTH_FIELD_MAX,
                            "credentials longer than {AUTH_FIELD_MAX} bytes"
                        );
                        HelperRoute {
                            next_hop,
                            method: AuthMethod::Username,
                            username: Some(username),
                            password: Some(password),
                        }
                    },
                    other => bail!("invalid authentication method {other:?}"),
                };
                Ok(HelperReply::Ok(route))
            },
            Some("ERR") => {
                let message = match tokens.next() {
                    Some(tok) => Some(String::from_utf8_lossy(&urldecode(tok)?).into_owned()),
                    None => None,
                };
                Ok(HelperReply::Err(message))
            },
            Some(other) => bail!("invalid answer (not starting with OK or ERR): {other:?}"),
            None => bail!("empty answer"),
        }
    }
}
