// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Constants shared by the SOCKS5 handshake codecs.
//!
//! RFC 1928 §3 (method-select) and RFC 1929 (username/password
//! sub-negotiation). Everything past the authentication phase is spliced
//! verbatim, so no request/reply records are modelled here.

use thiserror::Error;

/// SOCKS protocol version byte.
pub const SOCKS5_VER: u8 = 0x05;

/// No authentication required.
pub const AUTH_METHOD_NONE: u8 = 0x00;
/// GSSAPI. Never offered by this relay, listed for completeness.
pub const AUTH_METHOD_GSSAPI: u8 = 0x01;
/// Username/password (RFC 1929).
pub const AUTH_METHOD_USERNAME: u8 = 0x02;
/// "No acceptable methods" marker.
pub const AUTH_METHOD_INVALID: u8 = 0xFF;

/// Version byte of the RFC 1929 sub-negotiation.
pub const AUTH_SUBNEG_VER: u8 = 0x01;
/// Sub-negotiation status: success.
pub const AUTH_STATUS_SUCCESS: u8 = 0x00;
/// Sub-negotiation status: failure (any non-zero value means failure; this
/// is the one we emit).
pub const AUTH_STATUS_FAILURE: u8 = 0xFF;

/// Maximum length of the RFC 1929 username and password fields.
pub const AUTH_FIELD_MAX: usize = 255;

/// Returned when a handshake record carries the wrong version byte.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported SOCKS version 0x{0:02x}")]
    BadSocksVersion(u8),
    #[error("unsupported auth sub-negotiation version 0x{0:02x}")]
    BadAuthVersion(u8),
}
