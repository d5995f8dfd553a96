// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RFC 1928 §3 method-select exchange.
//!
//! ```text
//! client> VER NMETHODS METHODS[...]
//! server< VER METHOD
//! ```

use bytes::BytesMut;

use crate::{
    cfg::enums::AuthMethod,
    models::common::{DecodeError, SOCKS5_VER},
};

/// The client's opening record: the list of authentication methods it
/// offers.
#[derive(Debug, PartialEq, Eq)]
pub struct MethodSelect {
    pub methods: Vec<u8>,
}

impl MethodSelect {
    /// Incremental decode. Returns `Ok(None)` until the whole record is
    /// buffered; consumes exactly the record's bytes on success, so
    /// pipelined data stays in `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let ver = buf[0];
        if ver != SOCKS5_VER {
            return Err(DecodeError::BadSocksVersion(ver));
        }
        let nmethods = buf[1] as usize;
        if buf.len() < 2 + nmethods {
            return Ok(None);
        }
        let record = buf.split_to(2 + nmethods);
        Ok(Some(Self {
            methods: record[2..].to_vec(),
        }))
    }

    /// `VER, METHOD` reply sent back to the client.
    pub fn encode_reply(method: u8) -> [u8; 2] {
        [SOCKS5_VER, method]
    }

    /// Single-method offer sent to the next-hop server.
    pub fn encode_offer(method: u8) -> [u8; 3] {
        [SOCKS5_VER, 1, method]
    }

    /// Parses the next-hop server's `VER, METHOD` reply.
    pub fn parse_reply(raw: [u8; 2]) -> Result<u8, DecodeError> {
        if raw[0] != SOCKS5_VER {
            return Err(DecodeError::BadSocksVersion(raw[0]));
        }
        Ok(raw[1])
    }
}

/// Intersects the server's ordered preference list with the methods the
/// client offered; the first preference present in the offer wins.
pub fn choose_method(prefs: &[AuthMethod], offered: &[u8]) -> Option<AuthMethod> {
    prefs
        .iter()
        .copied()
        .find(|m| offered.contains(&m.code()))
}
