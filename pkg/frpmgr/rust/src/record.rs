// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{Error, Result};
use crate::state::ProcessState;
use crate::store::write_atomic;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;
use time::macros::format_description;

const MARKER_EXT: &str = "state";

/// Supervision state of one tunnel. Written only by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub tunnel_name: String,
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Unix seconds of the last successful spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

impl ProcessRecord {
    pub fn stopped(tunnel_name: impl Into<String>) -> Self {
        Self {
            tunnel_name: tunnel_name.into(),
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            last_exit_code: None,
            last_exit_reason: None,
            binary: None,
            config_path: None,
        }
    }

    pub fn transition(&mut self, next: ProcessState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Process(format!(
                "[{}] invalid state transition {} -> {next}",
                self.tunnel_name, self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Record that the process vanished without a stop request.
    pub fn mark_crashed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(ProcessState::Crashed)?;
        self.pid = None;
        self.last_exit_reason = Some(reason.into());
        Ok(())
    }

    pub fn started_at_display(&self) -> String {
        self.started_at
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .and_then(|t| {
                t.format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
                ))
                .ok()
            })
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Per-tunnel marker files (`<name>.state`, JSON) in the runtime directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{MARKER_EXT}"))
    }

    /// A marker that cannot be parsed is reported and treated as absent:
    /// the next liveness pass rebuilds it from the process table.
    pub fn load(&self, name: &str) -> Result<Option<ProcessRecord>> {
        let path = self.path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage_io(&path, e)),
        };
        match serde_json::from_str::<ProcessRecord>(&contents) {
            Ok(record) if record.tunnel_name == name => Ok(Some(record)),
            Ok(record) => {
                warn!(
                    "ignoring {}: it describes '{}'",
                    path.display(),
                    record.tunnel_name
                );
                Ok(None)
            }
            Err(e) => {
                warn!("ignoring unreadable process marker {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    pub fn save(&self, record: &ProcessRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Storage(format!("encoding process record: {e}")))?;
        write_atomic(&self.path(&record.tunnel_name), &json)
    }

    pub fn has(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn clear(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_io(&path, e)),
        }
    }

    /// Names of every tunnel with a marker, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage_io(&self.dir, e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == MARKER_EXT))
            .filter_map(|p| p.file_stem()?.to_str().map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }
}
