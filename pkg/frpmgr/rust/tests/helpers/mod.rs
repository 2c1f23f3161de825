// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Stands in for frps/frpc: answers `--version`, otherwise idles until
/// SIGTERM.
pub const FAKE_FRP: &str = r#"#!/bin/sh
case "$1" in
--version) echo "0.61.1" ;;
*) trap 'exit 0' TERM; while :; do sleep 0.1; done ;;
esac
"#;

/// Like [`FAKE_FRP`] but ignores SIGTERM.
pub const STUBBORN_FRP: &str = r#"#!/bin/sh
case "$1" in
--version) echo "0.61.1" ;;
*) trap '' TERM; while :; do sleep 0.1; done ;;
esac
"#;

/// A valid client tunnel named `name`, as a registry list entry.
pub fn client_entry(name: &str, tags: &[&str]) -> String {
    format!(
        r#"  - name: {name}
    role: client
    tags: [{tags}]
    connection:
      server_addr: frp.example.com
      server_port: 7000
      token: s3cret
      proxies:
        - name: ssh
          type: tcp
          local_port: 22
          remote_port: 6000
"#,
        tags = tags.join(", ")
    )
}

/// A client tunnel that fails validation: no server address.
pub fn broken_entry(name: &str, tags: &[&str]) -> String {
    format!(
        r#"  - name: {name}
    role: client
    tags: [{tags}]
    connection:
      server_port: 7000
"#,
        tags = tags.join(", ")
    )
}

pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// An isolated frpmgr home with fake FRP binaries.
pub struct Fleet {
    home: tempfile::TempDir,
    bin: PathBuf,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_binary(FAKE_FRP)
    }

    pub fn stubborn() -> Self {
        Self::with_binary(STUBBORN_FRP)
    }

    fn with_binary(script: &str) -> Self {
        let home = tempfile::tempdir().unwrap();
        let bin = home.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        for name in ["frps", "frpc"] {
            let path = bin.join(name);
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(
            home.path().join("frpmgr.yaml"),
            "start_grace_ms: 300\nstop_timeout_secs: 3\nprobe_timeout_ms: 2000\n",
        )
        .unwrap();
        Self { home, bin }
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn write_registry(&self, entries: &[String]) {
        let yaml = format!("format_version: 1\ntunnels:\n{}", entries.concat());
        std::fs::write(self.home().join("tunnels.yaml"), yaml).unwrap();
    }

    pub fn write_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.home().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Run frpmgr with stdin detached, as a script would.
    pub fn run(&self, args: &[&str]) -> CmdOutput {
        let output = Command::new(env!("CARGO_BIN_EXE_frpmgr"))
            .args(args)
            .env("FRPMGR_HOME", self.home())
            .env("FRPMGR_BIN_DIR", &self.bin)
            .env("FRPMGR_LOG_LEVEL", "debug")
            .stdin(Stdio::null())
            .output()
            .expect("failed to run frpmgr");
        let out = CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        eprintln!("[frpmgr {}] exit={}\n{}", args.join(" "), out.code, out.stderr);
        out
    }

    /// Pid from the tunnel's process marker, if any.
    pub fn pid_of(&self, name: &str) -> Option<u32> {
        let marker = self.home().join("run").join(format!("{name}.state"));
        let json = std::fs::read_to_string(marker).ok()?;
        let value: serde_json::Value = serde_json::from_str(&json).ok()?;
        value.get("pid")?.as_u64().and_then(|p| u32::try_from(p).ok())
    }

    /// Pids of every marker, for cleanup.
    fn marker_pids(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(self.home().join("run")) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.strip_suffix(".state")?.to_string();
                self.pid_of(&name)
            })
            .collect()
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        for pid in self.marker_pids() {
            kill(pid);
        }
    }
}

pub fn kill(pid: u32) {
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// Check if a PID is alive. Zombies count as dead.
pub fn pid_is_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
