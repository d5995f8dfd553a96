// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Relay SOCKS5 connections.
#[derive(Debug, Parser)]
#[command(name = "sockslinkd", version, about = "Relay SOCKS5 connections")]
pub struct Cli {
    /// Listen on this address; may be repeated (default: 0.0.0.0 and ::).
    #[arg(short = 'l', long = "listen", value_name = "addr")]
    pub listen: Vec<String>,

    /// TCP port (default: 1080).
    #[arg(short = 'p', long = "port", value_name = "port")]
    pub port: Option<u16>,

    /// Bind listen sockets to this interface (SO_BINDTODEVICE).
    #[arg(short = 'i', long = "interface", value_name = "iface")]
    pub interface: Option<String>,

    /// Default route when not specified by the helper; use ':' to give a
    /// non-standard port ('192.168.0.1:1081' or '[::1]:1081').
    #[arg(short = 'n', long = "next-hop", value_name = "next")]
    pub next_hop: Option<String>,

    /// Path to the authentication and routing helper.
    #[arg(short = 'H', long = "helper", value_name = "helper")]
    pub helper: Option<PathBuf>,

    /// Number of helper instances to keep running (default: 1).
    #[arg(short = 'j', long = "helpers-max", value_name = "num")]
    pub helpers_max: Option<usize>,

    /// Enable this method; argument order defines preference. "none" and
    /// "username" are available.
    #[arg(short = 'm', long = "method", value_name = "method")]
    pub method: Vec<String>,

    /// Do nothing, just relay connections to the next hop.
    #[arg(short = 'P', long = "pipe")]
    pub pipe: bool,

    /// Maximum number of open file descriptors (root only),
    /// = (clients * 2) + (helpers * 3) + 1.
    #[arg(short = 'd', long = "max-fds", value_name = "num")]
    pub max_fds: Option<u64>,

    /// Don't go to background.
    #[arg(short = 'D', long = "foreground")]
    pub foreground: bool,

    /// Write the pid to this file (default: /var/run/sockslinkd.pid).
    #[arg(long = "pidfile", value_name = "file")]
    pub pidfile: Option<PathBuf>,

    /// Change to this user after startup.
    #[arg(short = 'u', long = "user", value_name = "username")]
    pub user: Option<String>,

    /// Change to this group after startup.
    #[arg(short = 'g', long = "group", value_name = "group")]
    pub group: Option<String>,

    /// Be more verbose.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Be more quiet.
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    pub quiet: u8,

    /// Config file path ("key = value" lines, '#' comments).
    #[arg(short = 'c', long = "conf", value_name = "path")]
    pub conf: Option<PathBuf>,
}
