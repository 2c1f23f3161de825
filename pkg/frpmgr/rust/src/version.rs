// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Detection of the installed FRP release.
//!
//! [`detect_version`] never fails: it returns the parsed version, `unknown`
//! when a binary exists but no strategy yields a version, or `not installed`.

use crate::tunnel::Role;
use log::debug;
use std::cmp::Ordering;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Files colocated with the binaries that may carry the release string.
const MARKER_FILES: &[&str] = &["VERSION", ".frp-version"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub build: Option<String>,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            build: None,
        }
    }

    pub fn same_minor(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    /// Scan free-form output for the first token that parses as a version.
    pub fn find_in(text: &str) -> Option<Version> {
        text.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
            .find_map(|token| token.parse().ok())
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let (core, build) = match s.split_once('+') {
            Some((core, build)) if !build.is_empty() => (core, Some(build.to_string())),
            Some(_) => return Err(format!("empty build metadata in {s:?}")),
            None => (s, None),
        };

        let mut parts = core.split('.');
        let mut next = |what: &str| -> Result<u64, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {what} in {s:?}"))?
                .parse::<u64>()
                .map_err(|e| format!("invalid {what} in {s:?}: {e}"))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(format!("too many components in {s:?}"));
        }

        Ok(Version {
            major,
            minor,
            patch,
            build,
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Build metadata does not participate in precedence.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// Outcome of probing one binary kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Installed(Version),
    Unknown,
    NotInstalled,
}

impl Probe {
    pub fn version(&self) -> Option<&Version> {
        match self {
            Probe::Installed(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Installed(v) => write!(f, "{v}"),
            Probe::Unknown => write!(f, "unknown"),
            Probe::NotInstalled => write!(f, "not installed"),
        }
    }
}

/// Finds FRP binaries in a configured directory or on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct BinaryLocator {
    bin_dir: Option<PathBuf>,
}

impl BinaryLocator {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    pub fn locate(&self, role: Role) -> Option<PathBuf> {
        let name = role.binary_name();
        if let Some(dir) = &self.bin_dir {
            let candidate = dir.join(name);
            return is_executable(&candidate).then_some(candidate);
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    /// Directory a marker file would live in.
    fn install_dir(&self, found: Option<&Path>) -> Option<PathBuf> {
        found
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .or_else(|| self.bin_dir.clone())
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// `<binary> --version` on the requested role's binary.
    VersionFlag,
    /// `--version` on the other role's binary; both ship in one release.
    AlternateBinary,
    /// A version marker file next to the binaries.
    MarkerFile,
}

/// Cheapest first.
const STRATEGIES: [Strategy; 3] = [
    Strategy::VersionFlag,
    Strategy::AlternateBinary,
    Strategy::MarkerFile,
];

/// Probe the installed version of the `role` binary, bounded by `limit` per
/// invocation.
pub async fn detect_version(locator: &BinaryLocator, role: Role, limit: Duration) -> Probe {
    let primary = locator.locate(role);
    let alternate = locator.locate(role.other());
    if primary.is_none() && alternate.is_none() {
        return Probe::NotInstalled;
    }

    for strategy in STRATEGIES {
        let found = match strategy {
            Strategy::VersionFlag => match &primary {
                Some(bin) => run_version_flag(bin, limit).await,
                None => None,
            },
            Strategy::AlternateBinary => match (&primary, &alternate) {
                (None, Some(bin)) => run_version_flag(bin, limit).await,
                _ => None,
            },
            Strategy::MarkerFile => locator
                .install_dir(primary.as_deref().or(alternate.as_deref()))
                .and_then(|dir| read_marker(&dir)),
        };
        if let Some(version) = found {
            debug!("{} version {version} via {strategy:?}", role.binary_name());
            return Probe::Installed(version);
        }
    }

    Probe::Unknown
}

async fn run_version_flag(binary: &Path, limit: Duration) -> Option<Version> {
    let mut cmd = Command::new(binary);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("{}: --version failed: {e}", binary.display());
            return None;
        }
        Err(_) => {
            debug!(
                "{}: --version did not answer within {}ms",
                binary.display(),
                limit.as_millis()
            );
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    Version::find_in(&String::from_utf8_lossy(&output.stdout))
}

fn read_marker(dir: &Path) -> Option<Version> {
    MARKER_FILES.iter().find_map(|name| {
        let contents = std::fs::read_to_string(dir.join(name)).ok()?;
        Version::find_in(&contents)
    })
}
