// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Serialize;

use crate::models::common::{AUTH_METHOD_NONE, AUTH_METHOD_USERNAME};

/// Client authentication methods this relay can negotiate.
///
/// The order in which methods appear on the command line defines the
/// preference order during method-select; at most two may be configured.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "username")]
    Username,
}

impl AuthMethod {
    /// RFC 1928 method code.
    pub const fn code(self) -> u8 {
        match self {
            AuthMethod::None => AUTH_METHOD_NONE,
            AuthMethod::Username => AUTH_METHOD_USERNAME,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            AUTH_METHOD_NONE => Some(AuthMethod::None),
            AUTH_METHOD_USERNAME => Some(AuthMethod::Username),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::None => "none",
            AuthMethod::Username => "username",
        })
    }
}

impl FromStr for AuthMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthMethod::None),
            "username" => Ok(AuthMethod::Username),
            other => bail!("unknown authentication method {other:?}"),
        }
    }
}
