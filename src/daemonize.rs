// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Detaching, privilege dropping, pid-file handling and the fd limit.
//!
//! Everything here is process-global and must run before the tokio runtime
//! is built: `daemonize` forks, and forking with live runtime threads is
//! not an option.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::fd::AsRawFd,
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use anyhow::{Context, Result, ensure};
use nix::{
    sys::resource::{Resource, setrlimit},
    unistd::{ForkResult, Gid, Group, Uid, User, dup2, fork, setgid, setgroups, setsid, setuid},
};
use tracing::debug;

/// Forks to the background: the parent exits, the child becomes a session
/// leader, chdirs to `/` and points the std streams at `/dev/null`.
pub fn daemonize() -> Result<()> {
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    setsid().context("setsid failed")?;
    std::env::set_current_dir("/").context("chdir(/) failed")?;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("can't open /dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).context("can't redirect std fd")?;
    }
    Ok(())
}

/// setgroups/setgid/setuid by name. A no-op without names; resolving or
/// switching failures are fatal (running on with half-dropped privileges
/// is worse than not starting).
pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if user.is_none() && group.is_none() {
        return Ok(());
    }

    let group = match group {
        Some(name) => Some(
            Group::from_name(name)
                .with_context(|| format!("can't look up group {name:?}"))?
                .with_context(|| format!("unknown group {name:?}"))?,
        ),
        None => None,
    };
    let user = match user {
        Some(name) => Some(
            User::from_name(name)
                .with_context(|| format!("can't look up user {name:?}"))?
                .with_context(|| format!("unknown user {name:?}"))?,
        ),
        None => None,
    };

    let gid: Option<Gid> = group.map(|g| g.gid).or_else(|| user.as_ref().map(|u| u.gid));
    if let Some(gid) = gid {
        setgroups(&[gid]).context("setgroups failed")?;
        setgid(gid).context("setgid failed")?;
    }
    if let Some(user) = user {
        setuid(user.uid).context("setuid failed")?;
    }
    Ok(())
}

/// Raises `RLIMIT_NOFILE` to `max_fds`; root only.
pub fn set_max_fds(max_fds: u64) -> Result<()> {
    ensure!(
        Uid::effective().is_root(),
        "can only set the maximum number of fds when root"
    );
    setrlimit(Resource::RLIMIT_NOFILE, max_fds, max_fds)
        .context("can't raise RLIMIT_NOFILE")?;
    debug!("can open up to {max_fds} fds");
    Ok(())
}

/// Opens the pid-file with `O_EXCL`; when the path already exists and is a
/// regular file (a stale pid-file), it is truncated instead. Anything else
/// sitting on the path fails startup.
pub fn open_pidfile(path: &Path) -> Result<File> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let md = fs::metadata(path).context("stating existing pid-file failed")?;
            ensure!(
                md.is_file(),
                "pid-file exists and isn't a regular file: {}",
                path.display()
            );
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(path)
                .context("opening pid-file failed")
        },
        Err(e) => Err(e).context("opening pid-file failed"),
    }
}

/// Writes the daemon pid. Called after the fork, so the pid is final.
pub fn write_pid(mut pidfile: File) -> Result<()> {
    write!(pidfile, "{}", std::process::id()).context("writing pid-file failed")
}
