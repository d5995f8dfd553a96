// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RFC 1929 username/password sub-negotiation.
//!
//! ```text
//! client> 0x01 ULEN UNAME PLEN PASSWD
//! server< 0x01 STATUS
//! ```
//!
//! Credentials are raw byte strings, not UTF-8; they are relayed to the
//! helper and the next hop without inspection.

use anyhow::{Result, ensure};
use bytes::BytesMut;

use crate::models::common::{AUTH_FIELD_MAX, AUTH_SUBNEG_VER, DecodeError};

/// A decoded sub-negotiation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuth {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl UserAuth {
    /// Incremental decode; `Ok(None)` until `2 + ulen + 1 + plen` bytes are
    /// buffered. The version byte is checked as soon as it is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let ver = buf[0];
        if ver != AUTH_SUBNEG_VER {
            return Err(DecodeError::BadAuthVersion(ver));
        }
        let ulen = buf[1] as usize;
        if buf.len() < 2 + ulen + 1 {
            return Ok(None);
        }
        let plen = buf[2 + ulen] as usize;
        if buf.len() < 2 + ulen + 1 + plen {
            return Ok(None);
        }
        let record = buf.split_to(2 + ulen + 1 + plen);
        Ok(Some(Self {
            username: record[2..2 + ulen].to_vec(),
            password: record[2 + ulen + 1..].to_vec(),
        }))
    }

    /// Encodes the record for the next-hop server.
    pub fn encode(username: &[u8], password: &[u8]) -> Result<Vec<u8>> {
        ensure!(
            username.len() <= AUTH_FIELD_MAX,
            "username longer than {AUTH_FIELD_MAX} bytes"
        );
        ensure!(
            password.len() <= AUTH_FIELD_MAX,
            "password longer than {AUTH_FIELD_MAX} bytes"
        );
        let mut out = Vec::with_capacity(3 + username.len() + password.len());
        out.push(AUTH_SUBNEG_VER);
        out.push(username.len() as u8);
        out.extend_from_slice(username);
        out.push(password.len() as u8);
        out.extend_from_slice(password);
        Ok(out)
    }

    /// `0x01, STATUS` reply relayed to the client.
    pub fn encode_reply(status: u8) -> [u8; 2] {
        [AUTH_SUBNEG_VER, status]
    }

    /// Parses the next-hop server's `VER, STATUS` reply.
    pub fn parse_reply(raw: [u8; 2]) -> Result<u8, DecodeError> {
        if raw[0] != AUTH_SUBNEG_VER {
            return Err(DecodeError::BadAuthVersion(raw[0]));
        }
        Ok(raw[1])
    }
}
