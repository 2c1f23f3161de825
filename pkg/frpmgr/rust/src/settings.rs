// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::{LevelFilter, debug};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const SETTINGS_FILE: &str = "frpmgr.yaml";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_START_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// On-disk shape of `frpmgr.yaml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    registry_path: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    bin_dir: Option<PathBuf>,
    default_timeout_secs: Option<u64>,
    stop_timeout_secs: Option<u64>,
    start_grace_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub registry_path: PathBuf,
    pub runtime_dir: PathBuf,
    /// Directory holding `frps`/`frpc`. `None` means search `PATH`.
    pub bin_dir: Option<PathBuf>,
    pub default_timeout: Duration,
    pub stop_timeout: Duration,
    pub start_grace: Duration,
    pub probe_timeout: Duration,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Defaults rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            registry_path: home.join("tunnels.yaml"),
            runtime_dir: home.join("run"),
            home,
            bin_dir: None,
            default_timeout: DEFAULT_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            start_grace: DEFAULT_START_GRACE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            log_level: LevelFilter::Info,
            log_file: None,
        }
    }

    /// Resolve the home directory from the environment and load settings from it.
    pub fn load() -> Result<Self> {
        Self::load_from(&home_dir()?)
    }

    /// Load `<home>/frpmgr.yaml` if present, then apply environment overrides.
    pub fn load_from(home: &Path) -> Result<Self> {
        let path = home.join(SETTINGS_FILE);
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            if contents.trim().is_empty() {
                SettingsFile::default()
            } else {
                serde_yaml::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
        } else {
            debug!("no settings file at {}, using defaults", path.display());
            SettingsFile::default()
        };

        let mut settings = Self::with_home(home);
        settings.apply(file)?;
        settings.apply_env()?;
        Ok(settings)
    }

    fn apply(&mut self, file: SettingsFile) -> Result<()> {
        if let Some(p) = file.registry_path {
            self.registry_path = self.under_home(p);
        }
        if let Some(p) = file.runtime_dir {
            self.runtime_dir = self.under_home(p);
        }
        if let Some(p) = file.bin_dir {
            self.bin_dir = Some(self.under_home(p));
        }
        if let Some(secs) = file.default_timeout_secs {
            self.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stop_timeout_secs {
            self.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.start_grace_ms {
            self.start_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = file.probe_timeout_ms {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = file.log_level {
            self.log_level = parse_level(&level)?;
        }
        if let Some(p) = file.log_file {
            self.log_file = Some(self.under_home(p));
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("FRPMGR_BIN_DIR")
            && !dir.is_empty()
        {
            self.bin_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var("FRPMGR_LOG_LEVEL")
            && !level.is_empty()
        {
            self.log_level = parse_level(&level)?;
        }
        Ok(())
    }

    fn under_home(&self, p: PathBuf) -> PathBuf {
        if p.is_absolute() { p } else { self.home.join(p) }
    }

    /// Rendered FRP configuration files.
    pub fn conf_dir(&self) -> PathBuf {
        self.runtime_dir.join("conf")
    }

    /// Captured stdout/stderr of supervised processes.
    pub fn logs_dir(&self) -> PathBuf {
        self.runtime_dir.join("logs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.runtime_dir.join("locks")
    }
}

fn parse_level(s: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(s.trim()).with_context(|| format!("invalid log level: {s}"))
}

/// `FRPMGR_HOME`, falling back to `$HOME/.frpmgr`.
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("FRPMGR_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    let home = std::env::var("HOME").context("neither FRPMGR_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".frpmgr"))
}
