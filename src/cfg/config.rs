// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, fs, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use nix::unistd::Uid;
use serde::Serialize;

use crate::{cfg::cli::Cli, cfg::enums::AuthMethod, utils::parse_host_port};

/// Inactivity timeout for every handshake step (client method-select and
/// sub-negotiation, upstream connect and negotiation).
pub const SOCKS5_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-direction idle timeout once a session is splicing bytes.
pub const SOCKS_IO_TIMEOUT: Duration = Duration::from_secs(600);
/// How long a session (and the helper's pipes) may wait for a helper reply.
pub const HELPER_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Write timeout for the first request to a freshly spawned helper.
pub const HELPER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Period of the pool refill tick.
pub const HELPERS_REFILL_POOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Splice copy buffer, one per direction.
pub const SOCKS_STREAM_BUFSIZ: usize = 16 * 1024;
/// Hard cap on listen sockets.
pub const LISTEN_FDS_MAX: usize = 256;
/// listen(2) backlog.
pub const LISTEN_BACKLOG: i32 = 5;

pub const DEFAULT_PORT: u16 = 1080;
pub const DEFAULT_PIDFILE: &str = "/var/run/sockslinkd.pid";
pub const DEFAULT_LOG_FILE: &str = "/var/log/sockslinkd.log";

/// A next-hop SOCKS5 server address, resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextHop {
    pub host: String,
    pub port: u16,
}

impl FromStr for NextHop {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = parse_host_port(s, DEFAULT_PORT)?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub addresses: Vec<String>,
    pub port: u16,
    pub interface: Option<String>,
    pub next_hop: Option<NextHop>,
    pub helper_command: Option<PathBuf>,
    /// Helper pool size; 0 when no helper is configured.
    pub helpers_max: usize,
    /// Ordered method preference list, at most two entries.
    pub methods: Vec<AuthMethod>,
    pub pipe: bool,
    pub max_fds: Option<u64>,
    pub foreground: bool,
    pub pidfile: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// -v bumps, -q lowers; 0 is the default level.
    pub verbosity: i8,
    pub log_file: PathBuf,
}

impl Config {
    /// Merges command-line flags over the optional config file and applies
    /// defaults and validation. Flags win over file values.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.conf {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("can't read config file {}", path.display()))?;
                ConfFile::parse(&text)
                    .with_context(|| format!("config file {}", path.display()))?
            },
            None => ConfFile::default(),
        };

        let addresses = if !cli.listen.is_empty() {
            cli.listen
        } else if !file.listen.is_empty() {
            file.listen
        } else {
            vec!["0.0.0.0".to_string(), "::".to_string()]
        };
        ensure!(
            addresses.len() <= LISTEN_FDS_MAX,
            "can't listen on more than {LISTEN_FDS_MAX} addresses"
        );

        let next_hop = match cli.next_hop.as_deref().or(file.next_hop.as_deref()) {
            Some(s) => Some(s.parse::<NextHop>().context("invalid --next-hop")?),
            None => None,
        };

        let helper_command = cli.helper.or(file.helper);
        if let Some(helper) = &helper_command {
            let md = fs::metadata(helper).with_context(|| {
                format!("can't get helper's information: {}", helper.display())
            })?;
            ensure!(
                md.is_file(),
                "helper is not a regular file: {}",
                helper.display()
            );
        }
        // A helper without an explicit pool size gets one instance; an
        // explicit 0 is clamped to 1 as well.
        let helpers_max = match &helper_command {
            Some(_) => cli
                .helpers_max
                .or(file.helpers_max)
                .unwrap_or(1)
                .max(1),
            None => 0,
        };

        let mut methods = Vec::new();
        let requested = if !cli.method.is_empty() {
            cli.method
        } else {
            file.methods
        };
        for name in &requested {
            let method: AuthMethod = name.parse()?;
            ensure!(!methods.contains(&method), "method {method} already set");
            methods.push(method);
        }
        ensure!(
            methods.len() <= 2,
            "at most two authentication methods may be configured"
        );
        if methods.is_empty() {
            methods.push(AuthMethod::None);
            if helper_command.is_some() {
                methods.push(AuthMethod::Username);
            }
        }

        let max_fds = cli.max_fds.or(file.max_fds);
        if max_fds.is_some() {
            ensure!(
                Uid::effective().is_root(),
                "can only set the maximum number of fds when root"
            );
        }

        let pipe = cli.pipe || file.pipe.unwrap_or(false);
        let foreground = cli.foreground || file.foreground.unwrap_or(false);
        let pidfile = cli
            .pidfile
            .or(file.pidfile)
            .or_else(|| (!foreground).then(|| PathBuf::from(DEFAULT_PIDFILE)));

        let verbosity = if cli.verbose != 0 || cli.quiet != 0 {
            cli.verbose as i8 - cli.quiet as i8
        } else {
            file.verbose.unwrap_or(0) - file.quiet.unwrap_or(0)
        };

        let cfg = Self {
            addresses,
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            interface: cli.interface.or(file.interface),
            next_hop,
            helper_command,
            helpers_max,
            methods,
            pipe,
            max_fds,
            foreground,
            pidfile,
            user: cli.user.or(file.user),
            group: cli.group.or(file.group),
            verbosity,
            log_file: file.log_file.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        };

        if cfg.pipe {
            ensure!(cfg.next_hop.is_some(), "--pipe requires --next-hop");
        }
        if !cfg.pipe && cfg.helper_command.is_none() {
            ensure!(
                cfg.next_hop.is_some(),
                "either --next-hop or --helper is required"
            );
        }

        Ok(cfg)
    }
}

/// Options read from the `key = value` config file. One option per line,
/// `#` starts a comment line; `listen` and `method` may repeat, anything
/// else may appear at most once.
#[derive(Debug, Default)]
pub struct ConfFile {
    pub listen: Vec<String>,
    pub port: Option<u16>,
    pub interface: Option<String>,
    pub next_hop: Option<String>,
    pub helper: Option<PathBuf>,
    pub helpers_max: Option<usize>,
    pub methods: Vec<String>,
    pub pipe: Option<bool>,
    pub max_fds: Option<u64>,
    pub foreground: Option<bool>,
    pub pidfile: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub verbose: Option<i8>,
    pub quiet: Option<i8>,
    pub log_file: Option<PathBuf>,
}

fn parse_bool(value: &str, lineno: usize) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => bail!("line {lineno}: invalid boolean {value:?}"),
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str, lineno: usize) -> Result<()> {
    ensure!(slot.is_none(), "line {lineno}: duplicate option {key:?}");
    *slot = Some(value);
    Ok(())
}

impl ConfFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut out = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("line {lineno}: expected \"key = value\""))?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "listen" => out.listen.push(value.to_string()),
                "method" => out.methods.push(value.to_string()),
                "port" => {
                    let port = value
                        .parse()
                        .with_context(|| format!("line {lineno}: invalid port {value:?}"))?;
                    set_once(&mut out.port, port, key, lineno)?;
                },
                "interface" => set_once(&mut out.interface, value.to_string(), key, lineno)?,
                "next-hop" => set_once(&mut out.next_hop, value.to_string(), key, lineno)?,
                "helper" => set_once(&mut out.helper, PathBuf::from(value), key, lineno)?,
                "helpers-max" => {
                    let n = value.parse().with_context(|| {
                        format!("line {lineno}: invalid argument for helpers-max {value:?}")
                    })?;
                    set_once(&mut out.helpers_max, n, key, lineno)?;
                },
                "pipe" => set_once(&mut out.pipe, parse_bool(value, lineno)?, key, lineno)?,
                "max-fds" => {
                    let n = value.parse().with_context(|| {
                        format!("line {lineno}: invalid argument for max-fds {value:?}")
                    })?;
                    set_once(&mut out.max_fds, n, key, lineno)?;
                },
                "foreground" => {
                    set_once(&mut out.foreground, parse_bool(value, lineno)?, key, lineno)?
                },
                "pidfile" => set_once(&mut out.pidfile, PathBuf::from(value), key, lineno)?,
                "user" => set_once(&mut out.user, value.to_string(), key, lineno)?,
                "group" => set_once(&mut out.group, value.to_string(), key, lineno)?,
                "verbose" => {
                    let n = value.parse().with_context(|| {
                        format!("line {lineno}: invalid verbose level {value:?}")
                    })?;
                    set_once(&mut out.verbose, n, key, lineno)?;
                },
                "quiet" => {
                    let n = value.parse().with_context(|| {
                        format!("line {lineno}: invalid quiet level {value:?}")
                    })?;
                    set_once(&mut out.quiet, n, key, lineno)?;
                },
                "log-file" => set_once(&mut out.log_file, PathBuf::from(value), key, lineno)?,
                other => bail!("line {lineno}: unknown option {other:?}"),
            }
        }

        Ok(out)
    }
}
