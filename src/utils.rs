// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use anyhow::{Context, Result, bail, ensure};

/// Percent-encodes every byte that is not ASCII alphanumeric as `%hh`
/// (lowercase hex).
///
/// The helper protocol separates tokens with single spaces, so username,
/// password and error-message tokens go through this before hitting the
/// wire.
pub fn urlencode(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            write!(&mut out, "%{b:02x}").expect("writing to String cannot fail");
        }
    }
    out
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%hh` escapes (case-insensitive hex); any other byte is copied
/// through verbatim. A truncated escape or a non-hex digit is an error.
pub fn urldecode(src: &str) -> Result<Vec<u8>> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            ensure!(i + 2 < bytes.len(), "truncated %-escape in {src:?}");
            match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => bail!("invalid %-escape in {src:?}"),
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Splits `host`, `host:port` or `[v6]:port` into an address and a port,
/// falling back to `default_port` when the string carries none.
pub fn parse_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, service) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .with_context(|| format!("missing ']' in address {s:?}"))?;
        match rest.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if rest.is_empty() => (host, None),
            None => bail!("garbage after ']' in address {s:?}"),
        }
    } else {
        match s.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (s, None),
        }
    };
    ensure!(!host.is_empty(), "empty host in address {s:?}");
    let port = match service {
        Some(p) => p
            .parse::<u16>()
            .with_context(|| format!("invalid port in address {s:?}"))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}
