// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Read-only view of the OS process table.

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }
        "/proc".into()
    })
}

pub(crate) fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// The pid exists in the process table (possibly as a zombie, possibly
/// owned by another user).
pub fn pid_exists(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match signal::kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Single-letter scheduler state from `/proc/<pid>/stat`, e.g. `R`, `S`, `Z`.
fn stat_state(pid: u32) -> Option<char> {
    let stat = fs::read_to_string(root_path().join(pid.to_string()).join("stat")).ok()?;
    // The command name is parenthesized and may itself contain ')'.
    let after = stat.rfind(')')?;
    stat.get(after + 1..)?.trim_start().chars().next()
}

pub fn is_zombie(pid: u32) -> bool {
    matches!(stat_state(pid), Some('Z') | Some('X'))
}

/// Arguments of a process, or `None` when unreadable or empty.
pub fn cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = fs::read(root_path().join(pid.to_string()).join("cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    (!args.is_empty()).then_some(args)
}

/// Does the command line look like one of ours: either an argument naming
/// the expected binary, or an argument equal to the rendered config path.
pub fn cmdline_matches(args: &[String], binary: Option<&Path>, config: Option<&Path>) -> bool {
    let binary_name = binary.and_then(Path::file_name);
    args.iter().any(|arg| {
        let arg = Path::new(arg);
        binary_name.is_some_and(|name| arg.file_name() == Some(name)) || config == Some(arg)
    })
}

/// The process is running (not a zombie) and, when the process table is
/// readable, still runs what we spawned.
pub fn is_alive(pid: u32, binary: Option<&Path>, config: Option<&Path>) -> bool {
    if !pid_exists(pid) || is_zombie(pid) {
        return false;
    }
    if binary.is_none() && config.is_none() {
        return true;
    }
    if !root_path().join(pid.to_string()).exists() {
        // No procfs (or pid hidden from us): the signal probe is all we have.
        return true;
    }
    match cmdline(pid) {
        Some(args) => cmdline_matches(&args, binary, config),
        None => false,
    }
}

/// Every live process with a readable command line.
pub fn scan() -> Vec<(u32, Vec<String>)> {
    let Ok(entries) = fs::read_dir(root_path()) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| !is_zombie(*pid))
        .filter_map(|pid| Some((pid, cmdline(pid)?)))
        .collect()
}
