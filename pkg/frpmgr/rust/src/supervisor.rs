// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Lifecycle of the FRP process behind each tunnel.
//!
//! Nothing is kept in memory between invocations: every operation rebuilds
//! the tunnel's [`ProcessRecord`] from its marker file and the process
//! table, under a per-tunnel lock, before acting on it.

use crate::context::Deadline;
use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::procfs;
use crate::record::{ProcessRecord, RecordStore};
use crate::render::{ConfigSyntax, render};
use crate::settings::Settings;
use crate::state::ProcessState;
use crate::store::{Registry, write_atomic};
use crate::tunnel::Role;
use crate::validate::{Capabilities, CapabilitySet, validate};
use crate::version::{BinaryLocator, Probe, detect_version};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use time::OffsetDateTime;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant, sleep};

const GRACE_POLL: Duration = Duration::from_millis(25);
const EXIT_POLL: Duration = Duration::from_millis(50);

/// A tunnel whose state changed during [`Supervisor::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub name: String,
    pub from: ProcessState,
    pub to: ProcessState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanSource {
    /// A marker file names a tunnel that is no longer registered.
    Marker,
    /// A process runs one of our rendered configs but has no marker.
    ProcessTable,
}

/// A process or record with no tunnel definition behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub name: String,
    /// Live pid, if the orphan still has a running process.
    pub pid: Option<u32>,
    pub source: OrphanSource,
    pub config_path: Option<PathBuf>,
}

pub struct Supervisor {
    records: RecordStore,
    locator: BinaryLocator,
    conf_dir: PathBuf,
    logs_dir: PathBuf,
    locks_dir: PathBuf,
    stop_timeout: Duration,
    start_grace: Duration,
    probe_timeout: Duration,
}

impl Supervisor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            records: RecordStore::new(&settings.runtime_dir),
            locator: BinaryLocator::new(settings.bin_dir.clone()),
            conf_dir: settings.conf_dir(),
            logs_dir: settings.logs_dir(),
            locks_dir: settings.locks_dir(),
            stop_timeout: settings.stop_timeout,
            start_grace: settings.start_grace,
            probe_timeout: settings.probe_timeout,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn locator(&self) -> &BinaryLocator {
        &self.locator
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub async fn probe(&self, role: Role) -> Probe {
        detect_version(&self.locator, role, self.probe_timeout).await
    }

    /// Capabilities of both installed binaries.
    pub async fn capabilities(&self) -> CapabilitySet {
        let (server, client) = tokio::join!(self.probe(Role::Server), self.probe(Role::Client));
        CapabilitySet {
            server: Capabilities::from_probe(&server),
            client: Capabilities::from_probe(&client),
        }
    }

    fn config_path(&self, name: &str, syntax: ConfigSyntax) -> PathBuf {
        self.conf_dir.join(format!("{name}.{}", syntax.extension()))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir.join(format!("{name}.log"))
    }

    async fn lock(&self, name: &str, deadline: Deadline) -> Result<FileLock> {
        FileLock::acquire(&self.locks_dir.join(format!("{name}.lock")), deadline).await
    }

    /// Start the tunnel's process. Already running is success.
    pub async fn start(
        &self,
        registry: &Registry,
        name: &str,
        deadline: Deadline,
    ) -> Result<ProcessRecord> {
        let tunnel = registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tunnel '{name}'")))?;
        let _lock = self.lock(name, deadline).await?;

        let mut record = self.refresh(name)?;
        match record.state {
            ProcessState::Running => {
                debug!("[{name}] already running (pid={:?})", record.pid);
                return Ok(record);
            }
            ProcessState::Stopping => {
                return Err(Error::Process(format!(
                    "[{name}] a previous stop of pid {} has not completed; stop it again first",
                    record.pid.unwrap_or_default()
                )));
            }
            _ => {}
        }

        let probe = self.probe(tunnel.role).await;
        let caps = Capabilities::from_probe(&probe);
        for warning in validate(tunnel, &registry.peers(name), &caps)? {
            warn!("[{name}] {warning}");
        }
        let binary = self.locator.locate(tunnel.role).ok_or_else(|| {
            Error::Process(format!("[{name}] {} is not installed", tunnel.role.binary_name()))
        })?;

        let syntax = caps.syntax();
        let config_path = self.config_path(name, syntax);
        write_atomic(&config_path, render(tunnel, syntax)?.as_bytes())?;
        debug!("[{name}] rendered {} for {probe}", config_path.display());

        if record.state == ProcessState::Crashed {
            info!(
                "[{name}] clearing crashed record ({})",
                record.last_exit_reason.as_deref().unwrap_or("no reason recorded")
            );
            record.transition(ProcessState::Stopped)?;
        }

        let mut child = self.spawn(name, &binary, &config_path)?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Process(format!("[{name}] exited before its pid was read")))?;

        record.transition(ProcessState::Starting)?;
        record.pid = Some(pid);
        record.started_at = Some(OffsetDateTime::now_utc().unix_timestamp());
        record.last_exit_code = None;
        record.last_exit_reason = None;
        record.binary = Some(binary);
        record.config_path = Some(config_path);
        self.records.save(&record)?;

        self.await_grace(&mut child, &mut record, deadline).await?;

        record.transition(ProcessState::Running)?;
        self.records.save(&record)?;
        info!("[{name}] spawned (pid={pid})");
        Ok(record)
    }

    fn spawn(&self, name: &str, binary: &Path, config: &Path) -> Result<Child> {
        let log_path = self.log_path(name);
        std::fs::create_dir_all(&self.logs_dir).map_err(|e| Error::storage_io(&self.logs_dir, e))?;
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::storage_io(&log_path, e))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| Error::storage_io(&log_path, e))?;

        let mut cmd = Command::new(binary);
        cmd.arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            // Own process group: a Ctrl-C aimed at frpmgr must not reach the tunnel.
            .process_group(0);

        cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Error::Permission(format!("[{name}] spawning {}: {e}", binary.display()))
            }
            _ => Error::Process(format!("[{name}] spawning {}: {e}", binary.display())),
        })
    }

    /// Wait out the startup grace window. A process that exits inside it is
    /// recorded as crashed; one still starting when the deadline hits is
    /// killed so it cannot outlive its record.
    async fn await_grace(
        &self,
        child: &mut Child,
        record: &mut ProcessRecord,
        deadline: Deadline,
    ) -> Result<()> {
        let name = record.tunnel_name.clone();
        let grace_end = Instant::now() + self.start_grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    record.last_exit_code = status.code();
                    record.mark_crashed(format!("exited during startup ({status})"))?;
                    self.records.save(record)?;
                    return Err(Error::Process(format!(
                        "[{name}] exited during startup ({status}), see {}",
                        self.log_path(&name).display()
                    )));
                }
                Ok(None) => {}
                Err(e) => return Err(Error::Process(format!("[{name}] waiting for process: {e}"))),
            }

            let now = Instant::now();
            if now >= grace_end {
                return Ok(());
            }
            if deadline.expired() {
                warn!("[{name}] deadline reached during startup, killing pid {:?}", record.pid);
                if let Err(e) = child.kill().await {
                    warn!("[{name}] kill failed: {e}");
                }
                self.records.clear(&name)?;
                return Err(Error::Timeout(format!("[{name}] did not finish starting")));
            }
            sleep(deadline.cap(GRACE_POLL.min(grace_end - now))).await;
        }
    }

    /// Stop the tunnel's process. With `graceful`, SIGTERM first and SIGKILL
    /// after the stop timeout; otherwise SIGKILL straight away.
    pub async fn stop(&self, name: &str, graceful: bool, deadline: Deadline) -> Result<ProcessRecord> {
        let _lock = self.lock(name, deadline).await?;
        let mut record = self.refresh(name)?;

        match record.state {
            ProcessState::Stopped => {
                self.records.clear(name)?;
                return Ok(record);
            }
            ProcessState::Crashed => {
                record.transition(ProcessState::Stopped)?;
                self.records.clear(name)?;
                return Ok(record);
            }
            _ => {}
        }

        let Some(pid) = record.pid else {
            return Err(Error::Process(format!(
                "[{name}] record is {} but has no pid",
                record.state
            )));
        };
        if record.state != ProcessState::Stopping {
            record.transition(ProcessState::Stopping)?;
            self.records.save(&record)?;
        }

        let exited = if graceful {
            send_signal(name, pid, Signal::SIGTERM)?;
            if self
                .wait_for_exit(&record, deadline.cap(self.stop_timeout))
                .await
            {
                true
            } else if deadline.expired() {
                false
            } else {
                warn!(
                    "[{name}] pid {pid} still running {}s after SIGTERM, sending SIGKILL",
                    self.stop_timeout.as_secs()
                );
                send_signal(name, pid, Signal::SIGKILL)?;
                self.wait_for_exit(&record, deadline.remaining()).await
            }
        } else {
            send_signal(name, pid, Signal::SIGKILL)?;
            self.wait_for_exit(&record, deadline.remaining()).await
        };

        if !exited {
            return Err(Error::Timeout(format!(
                "[{name}] pid {pid} did not exit before the deadline"
            )));
        }

        record.transition(ProcessState::Stopped)?;
        record.pid = None;
        record.last_exit_reason = Some("stopped on request".to_string());
        self.records.clear(name)?;
        info!("[{name}] stopped (pid={pid})");
        Ok(record)
    }

    async fn wait_for_exit(&self, record: &ProcessRecord, wait: Duration) -> bool {
        let until = Instant::now() + wait;
        loop {
            if !self.record_alive(record) {
                return true;
            }
            let now = Instant::now();
            if now >= until {
                return false;
            }
            sleep(EXIT_POLL.min(until - now)).await;
        }
    }

    /// Stop then start. A stop that cannot confirm the exit fails the
    /// restart, so two processes never serve one tunnel.
    pub async fn restart(
        &self,
        registry: &Registry,
        name: &str,
        deadline: Deadline,
    ) -> Result<ProcessRecord> {
        if !registry.contains(name) {
            return Err(Error::NotFound(format!("tunnel '{name}'")));
        }
        self.stop(name, true, deadline).await?;
        self.start(registry, name, deadline).await
    }

    /// Current record after a liveness check.
    pub async fn status(&self, name: &str, deadline: Deadline) -> Result<ProcessRecord> {
        let _lock = self.lock(name, deadline).await?;
        self.refresh(name)
    }

    fn record_alive(&self, record: &ProcessRecord) -> bool {
        record.pid.is_some_and(|pid| {
            procfs::is_alive(pid, record.binary.as_deref(), record.config_path.as_deref())
        })
    }

    /// Reconcile one marker with the process table. Caller holds the lock.
    fn refresh(&self, name: &str) -> Result<ProcessRecord> {
        let Some(mut record) = self.records.load(name)? else {
            return Ok(ProcessRecord::stopped(name));
        };
        if !record.state.expects_process() {
            return Ok(record);
        }

        if self.record_alive(&record) {
            if matches!(record.state, ProcessState::Starting | ProcessState::Unknown) {
                record.transition(ProcessState::Running)?;
                self.records.save(&record)?;
            }
        } else if record.state == ProcessState::Stopping {
            record.transition(ProcessState::Stopped)?;
            record.pid = None;
            self.records.clear(name)?;
            info!("[{name}] stopped");
        } else {
            let reason = match record.pid {
                Some(pid) => format!("process {pid} disappeared"),
                None => "no process recorded".to_string(),
            };
            warn!("[{name}] {reason}");
            record.mark_crashed(reason)?;
            self.records.save(&record)?;
        }
        Ok(record)
    }

    /// Processes whose command line passes one of our rendered configs.
    fn scan_rendered(&self) -> Vec<(String, u32, PathBuf)> {
        procfs::scan()
            .into_iter()
            .filter_map(|(pid, args)| {
                args.iter().find_map(|arg| {
                    let path = Path::new(arg);
                    if path.parent() != Some(self.conf_dir.as_path()) {
                        return None;
                    }
                    let ext = path.extension()?.to_str()?;
                    if ext != ConfigSyntax::Toml.extension() && ext != ConfigSyntax::Ini.extension()
                    {
                        return None;
                    }
                    let name = path.file_stem()?.to_str()?.to_string();
                    Some((name, pid, path.to_path_buf()))
                })
            })
            .collect()
    }

    /// Recompute every registered tunnel's record from the process table,
    /// adopting processes that run a rendered config but lost their marker.
    pub async fn reconcile(&self, registry: &Registry, deadline: Deadline) -> Result<Vec<StateChange>> {
        let running = self.scan_rendered();
        let mut changes = Vec::new();

        for tunnel in registry.tunnels() {
            let name = tunnel.name.as_str();
            let _lock = self.lock(name, deadline).await?;
            let before = self.records.load(name)?;
            let from = before.as_ref().map_or(ProcessState::Stopped, |r| r.state);

            if before.is_none()
                && let Some((_, pid, config)) = running.iter().find(|(n, _, _)| n == name)
            {
                info!("[{name}] adopting pid {pid} running {}", config.display());
                let adopted = ProcessRecord {
                    state: ProcessState::Unknown,
                    pid: Some(*pid),
                    config_path: Some(config.clone()),
                    binary: self.locator.locate(tunnel.role),
                    ..ProcessRecord::stopped(name)
                };
                self.records.save(&adopted)?;
            }

            let to = self.refresh(name)?.state;
            if from != to {
                changes.push(StateChange {
                    name: name.to_string(),
                    from,
                    to,
                });
            }
        }
        Ok(changes)
    }

    /// Records and processes that belong to no registered tunnel.
    pub fn orphans(&self, registry: &Registry) -> Result<Vec<Orphan>> {
        let mut orphans = Vec::new();
        for name in self.records.names()? {
            if registry.contains(&name) {
                continue;
            }
            let record = self.records.load(&name)?;
            let pid = record
                .as_ref()
                .filter(|r| self.record_alive(r))
                .and_then(|r| r.pid);
            orphans.push(Orphan {
                config_path: record.and_then(|r| r.config_path),
                name,
                pid,
                source: OrphanSource::Marker,
            });
        }
        for (name, pid, config) in self.scan_rendered() {
            if registry.contains(&name) || orphans.iter().any(|o| o.name == name) {
                continue;
            }
            orphans.push(Orphan {
                name,
                pid: Some(pid),
                source: OrphanSource::ProcessTable,
                config_path: Some(config),
            });
        }
        Ok(orphans)
    }

    /// Stop an orphan's process (if any) and drop its marker.
    pub async fn remove_orphan(&self, orphan: &Orphan, deadline: Deadline) -> Result<()> {
        if orphan.source == OrphanSource::ProcessTable
            && let Some(pid) = orphan.pid
        {
            let adopted = ProcessRecord {
                state: ProcessState::Unknown,
                pid: Some(pid),
                config_path: orphan.config_path.clone(),
                ..ProcessRecord::stopped(orphan.name.as_str())
            };
            self.records.save(&adopted)?;
        }
        self.stop(&orphan.name, true, deadline).await?;
        self.forget(&orphan.name)
    }

    /// Remove everything the runtime directory holds for `name`. The process
    /// must already be stopped.
    pub fn forget(&self, name: &str) -> Result<()> {
        self.records.clear(name)?;
        for syntax in [ConfigSyntax::Toml, ConfigSyntax::Ini] {
            let path = self.config_path(name, syntax);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("[{name}] removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::storage_io(&path, e)),
            }
        }
        Ok(())
    }

    /// Rendered configs whose tunnel is gone and whose process is not running.
    pub fn stale_configs(&self, registry: &Registry) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.conf_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage_io(&self.conf_dir, e)),
        };
        let in_use: Vec<PathBuf> = self
            .scan_rendered()
            .into_iter()
            .map(|(_, _, path)| path)
            .collect();
        let mut stale: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| !registry.contains(name) && !self.records.has(name))
            })
            .filter(|p| !in_use.contains(p))
            .collect();
        stale.sort();
        Ok(stale)
    }
}

fn send_signal(name: &str, pid: u32, sig: Signal) -> Result<()> {
    let Some(target) = procfs::to_pid(pid) else {
        return Err(Error::Process(format!("[{name}] invalid pid {pid}")));
    };
    match signal::kill(target, sig) {
        Ok(()) => {
            debug!("[{name}] sent {sig} to pid {pid}");
            Ok(())
        }
        // Already gone; the exit wait confirms it.
        Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => Err(Error::Permission(format!(
            "[{name}] not allowed to signal pid {pid}"
        ))),
        Err(e) => Err(Error::Process(format!("[{name}] {sig} to pid {pid}: {e}"))),
    }
}
