// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Durable registry of tunnel definitions.
//!
//! The registry is a YAML document holding a `format_version` and a list of
//! tunnel entries. Entries are decoded one at a time: an entry that does not
//! decode is quarantined and written back untouched on the next save, so a
//! typo in a hand-edited file never takes the rest of the registry down.

use crate::context::Deadline;
use crate::error::{Error, Result, ValidationError};
use crate::lock::FileLock;
use crate::tunnel::TunnelConfig;
use crate::validate::{CapabilitySet, validate, validate_name};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const REGISTRY_FORMAT_VERSION: u32 = 1;
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// An on-disk entry that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Quarantined {
    /// Position in the on-disk list.
    pub index: usize,
    pub name: Option<String>,
    pub reason: String,
    pub raw: serde_yaml::Value,
}

impl fmt::Display for Quarantined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "entry #{} ('{name}'): {}", self.index, self.reason),
            None => write!(f, "entry #{}: {}", self.index, self.reason),
        }
    }
}

/// Tunnel definitions in insertion order, plus quarantined raw entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    tunnels: Vec<TunnelConfig>,
    quarantined: Vec<Quarantined>,
}

impl Registry {
    pub fn from_tunnels(tunnels: Vec<TunnelConfig>) -> Result<Self> {
        let mut registry = Registry::default();
        for t in tunnels {
            registry.insert(t)?;
        }
        Ok(registry)
    }

    pub fn tunnels(&self) -> &[TunnelConfig] {
        &self.tunnels
    }

    pub fn quarantined(&self) -> &[Quarantined] {
        &self.quarantined
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TunnelConfig> {
        self.tunnels.iter().find(|t| t.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TunnelConfig> {
        self.tunnels.iter_mut().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.tunnels.iter().map(|t| t.name.clone()).collect()
    }

    /// Every entry except `name`, for uniqueness checks.
    pub fn peers(&self, name: &str) -> Vec<TunnelConfig> {
        self.tunnels
            .iter()
            .filter(|t| t.name != name)
            .cloned()
            .collect()
    }

    pub fn insert(&mut self, tunnel: TunnelConfig) -> Result<()> {
        if self.contains(&tunnel.name) {
            return Err(Error::invalid(
                &tunnel.name,
                "name",
                format!("'{}' is already registered", tunnel.name),
            ));
        }
        self.tunnels.push(tunnel);
        Ok(())
    }

    /// Replace the entry with the same name in place, or append it. Returns
    /// whether an entry was replaced. The role of an existing entry is fixed.
    pub fn upsert(&mut self, tunnel: TunnelConfig) -> Result<bool> {
        match self.get_mut(&tunnel.name) {
            Some(existing) if existing.role != tunnel.role => Err(Error::invalid(
                &tunnel.name,
                "role",
                format!(
                    "cannot change role from {} to {}; remove and re-add the tunnel",
                    existing.role, tunnel.role
                ),
            )),
            Some(existing) => {
                *existing = tunnel;
                Ok(true)
            }
            None => {
                self.tunnels.push(tunnel);
                Ok(false)
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<TunnelConfig> {
        let pos = self.tunnels.iter().position(|t| t.name == name)?;
        Some(self.tunnels.remove(pos))
    }

    /// Validate one entry against the rest of the registry.
    pub fn validate_entry(
        &self,
        tunnel: &TunnelConfig,
        caps: &CapabilitySet,
    ) -> Result<Vec<ValidationError>> {
        validate(tunnel, &self.peers(&tunnel.name), caps.for_role(tunnel.role))
    }

    fn decode(file: RegistryFile) -> Self {
        let mut registry = Registry::default();
        let mut seen = HashSet::new();
        for (index, raw) in file.tunnels.into_iter().enumerate() {
            let name = raw.get("name").and_then(|n| n.as_str()).map(String::from);
            let decoded = serde_yaml::from_value::<TunnelConfig>(raw.clone())
                .map_err(|e| e.to_string())
                .and_then(|t| {
                    validate_name(&t.name).map_err(|e| format!("name {e}"))?;
                    if !seen.insert(t.name.clone()) {
                        return Err(format!("duplicate of an earlier entry named '{}'", t.name));
                    }
                    Ok(t)
                });
            match decoded {
                Ok(t) => registry.tunnels.push(t),
                Err(reason) => {
                    let q = Quarantined {
                        index,
                        name,
                        reason,
                        raw,
                    };
                    warn!("quarantined registry {q}");
                    registry.quarantined.push(q);
                }
            }
        }
        registry
    }

    fn encode(&self) -> Result<RegistryFile> {
        let mut entries = self
            .tunnels
            .iter()
            .map(|t| {
                serde_yaml::to_value(t)
                    .map_err(|e| Error::Storage(format!("encoding tunnel '{}': {e}", t.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        for q in &self.quarantined {
            let at = q.index.min(entries.len());
            entries.insert(at, q.raw.clone());
        }
        Ok(RegistryFile {
            format_version: REGISTRY_FORMAT_VERSION,
            tunnels: entries,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default = "default_format_version")]
    format_version: u32,
    #[serde(default)]
    tunnels: Vec<serde_yaml::Value>,
}

fn default_format_version() -> u32 {
    REGISTRY_FORMAT_VERSION
}

/// Owner of the registry file. All writers go through [`ConfigStore::update`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, locks_dir: &Path) -> Self {
        Self {
            path: path.into(),
            lock_path: locks_dir.join("registry.lock"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// A missing registry is empty. A registry that is not a YAML document
    /// at all is a storage error; individual bad entries are quarantined.
    pub fn load(&self) -> Result<Registry> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no registry at {}", self.path.display());
                return Ok(Registry::default());
            }
            Err(e) => return Err(Error::storage_io(&self.path, e)),
        };
        if contents.trim().is_empty() {
            return Ok(Registry::default());
        }
        let file: RegistryFile = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Storage(format!("registry {} is unreadable: {e}", self.path.display()))
        })?;
        if file.format_version > REGISTRY_FORMAT_VERSION {
            return Err(Error::Storage(format!(
                "registry {} has format_version {}, this frpmgr reads up to {REGISTRY_FORMAT_VERSION}",
                self.path.display(),
                file.format_version
            )));
        }
        Ok(Registry::decode(file))
    }

    /// Replace the registry file atomically. The previous file is kept as
    /// `<path>.bak` until the new one is in place.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        let encoded = serde_yaml::to_string(&registry.encode()?)
            .map_err(|e| Error::Storage(format!("encoding registry: {e}")))?;

        let backup = self.backup_path();
        let had_previous = match std::fs::copy(&self.path, &backup) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::storage_io(&backup, e)),
        };

        write_atomic(&self.path, encoded.as_bytes())?;

        if had_previous && let Err(e) = std::fs::remove_file(&backup) {
            warn!("could not remove registry backup {}: {e}", backup.display());
        }
        debug!(
            "saved {} tunnel(s) to {}",
            registry.tunnels.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load, mutate and save under the registry lock. Nothing is written when
    /// `mutate` fails.
    pub async fn update<T, F>(&self, deadline: Deadline, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Registry) -> Result<T>,
    {
        let _lock = FileLock::acquire(&self.lock_path, deadline).await?;
        let mut registry = self.load()?;
        let out = mutate(&mut registry)?;
        self.save(&registry)?;
        Ok(out)
    }
}

/// Write `contents` to a temporary file beside `path`, then rename it into
/// place so readers never observe a partial file. The file is created 0600.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => {
            return Err(Error::Storage(format!(
                "{} has no parent directory",
                path.display()
            )));
        }
    };
    std::fs::create_dir_all(dir).map_err(|e| Error::storage_io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::storage_io(dir, e))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| Error::storage_io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| Error::storage_io(path, e.error))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Add or update by name, keep everything else.
    Merge,
    /// Drop the current registry and load the blob. All or nothing.
    Replace,
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "merge" => Ok(ImportMode::Merge),
            "replace" => Ok(ImportMode::Replace),
            _ => Err(format!("unknown import mode '{s}' (expected merge or replace)")),
        }
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Merge => f.write_str("merge"),
            ImportMode::Replace => f.write_str("replace"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportBlob<'a> {
    format_version: u32,
    exported_at: String,
    tunnels: Vec<&'a TunnelConfig>,
}

#[derive(Debug, Deserialize)]
struct ImportBlob {
    format_version: u32,
    #[serde(default)]
    tunnels: Vec<serde_yaml::Value>,
}

/// Serialize a selection into a self-describing JSON blob.
pub fn export(selection: &[&TunnelConfig]) -> Result<String> {
    let exported_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| Error::Storage(format!("formatting export time: {e}")))?;
    let blob = ExportBlob {
        format_version: EXPORT_FORMAT_VERSION,
        exported_at,
        tunnels: selection.to_vec(),
    };
    serde_json::to_string_pretty(&blob).map_err(|e| Error::Storage(format!("encoding export: {e}")))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// `(entry, reason)` for entries left out of a merge.
    pub skipped: Vec<(String, String)>,
}

impl ImportReport {
    pub fn committed(&self) -> usize {
        self.added.len() + self.updated.len()
    }

    /// Skipped merge entries turn the import into a partial (or, when nothing
    /// was committed, a complete) validation failure.
    pub fn outcome(&self) -> Result<()> {
        if self.skipped.is_empty() {
            return Ok(());
        }
        Err(Error::Bulk {
            total: self.committed() + self.skipped.len(),
            failed: self.skipped.len(),
            worst: crate::error::ErrorKind::Validation,
        })
    }
}

fn entry_label(index: usize, raw: &serde_yaml::Value) -> String {
    match raw.get("name").and_then(|n| n.as_str()) {
        Some(name) => name.to_string(),
        None => format!("tunnels[{index}]"),
    }
}

/// Entries of a blob, decoded individually.
fn decode_blob(
    source: &str,
    blob: &str,
) -> Result<Vec<(String, std::result::Result<TunnelConfig, String>)>> {
    let parsed: ImportBlob = serde_yaml::from_str(blob)
        .map_err(|e| Error::invalid(source, "format", format!("not an export blob: {e}")))?;
    if parsed.format_version == 0 || parsed.format_version > EXPORT_FORMAT_VERSION {
        return Err(Error::invalid(
            source,
            "format_version",
            format!(
                "unsupported format_version {} (supported: 1..={EXPORT_FORMAT_VERSION})",
                parsed.format_version
            ),
        ));
    }
    Ok(parsed
        .tunnels
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let label = entry_label(i, &raw);
            let decoded = serde_yaml::from_value::<TunnelConfig>(raw).map_err(|e| e.to_string());
            (label, decoded)
        })
        .collect())
}

/// Compute the registry that results from importing `blob` into `current`.
/// `source` names the blob in error messages. Nothing is persisted here.
pub fn import(
    current: &Registry,
    source: &str,
    blob: &str,
    mode: ImportMode,
    caps: &CapabilitySet,
) -> Result<(Registry, ImportReport)> {
    let entries = decode_blob(source, blob)?;
    match mode {
        ImportMode::Replace => import_replace(current, source, entries, caps),
        ImportMode::Merge => Ok(import_merge(current, entries, caps)),
    }
}

fn import_replace(
    current: &Registry,
    source: &str,
    entries: Vec<(String, std::result::Result<TunnelConfig, String>)>,
    caps: &CapabilitySet,
) -> Result<(Registry, ImportReport)> {
    let mut failures = Vec::new();
    let mut tunnels = Vec::new();
    for (label, decoded) in entries {
        match decoded {
            Ok(t) => tunnels.push(t),
            Err(reason) => failures.push(ValidationError::error(label, reason)),
        }
    }
    for (i, t) in tunnels.iter().enumerate() {
        let peers: Vec<TunnelConfig> = tunnels
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, p)| p.clone())
            .collect();
        if let Err(Error::Validation { findings, .. }) = validate(t, &peers, caps.for_role(t.role)) {
            failures.extend(
                findings
                    .into_iter()
                    .filter(ValidationError::is_hard)
                    .map(|f| ValidationError::error(format!("{}.{}", t.name, f.field), f.message)),
            );
        }
    }
    if !failures.is_empty() {
        return Err(Error::validation(source, failures));
    }

    let report = ImportReport {
        added: tunnels.iter().map(|t| t.name.clone()).collect(),
        removed: current
            .tunnels
            .iter()
            .filter(|old| !tunnels.iter().any(|t| t.name == old.name))
            .map(|old| old.name.clone())
            .collect(),
        ..ImportReport::default()
    };
    let registry = Registry {
        tunnels,
        quarantined: Vec::new(),
    };
    Ok((registry, report))
}

fn import_merge(
    current: &Registry,
    entries: Vec<(String, std::result::Result<TunnelConfig, String>)>,
    caps: &CapabilitySet,
) -> (Registry, ImportReport) {
    let mut registry = current.clone();
    let mut report = ImportReport::default();
    let mut seen = HashSet::new();

    for (label, decoded) in entries {
        let t = match decoded {
            Ok(t) => t,
            Err(reason) => {
                report.skipped.push((label, reason));
                continue;
            }
        };
        if !seen.insert(t.name.clone()) {
            report
                .skipped
                .push((label, "appears more than once in the import".to_string()));
            continue;
        }
        let applied = registry
            .validate_entry(&t, caps)
            .and_then(|_| registry.upsert(t.clone()));
        match applied {
            Ok(true) => report.updated.push(t.name),
            Ok(false) => report.added.push(t.name),
            Err(e) => report.skipped.push((label, e.to_string())),
        }
    }
    (registry, report)
}

/// Tunnel definitions from a file given to `add` or `validate`: a single
/// mapping, a list of mappings, or an export blob.
pub fn parse_tunnel_file(source: &str, contents: &str) -> Result<Vec<TunnelConfig>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(contents)
        .map_err(|e| Error::invalid(source, "format", e.to_string()))?;
    let entries = match doc {
        serde_yaml::Value::Sequence(items) => items,
        serde_yaml::Value::Mapping(ref map) if map.contains_key("tunnels") => {
            return decode_blob(source, contents)?
                .into_iter()
                .map(|(label, decoded)| {
                    decoded.map_err(|reason| Error::invalid(source, label, reason))
                })
                .collect();
        }
        single @ serde_yaml::Value::Mapping(_) => vec![single],
        _ => {
            return Err(Error::invalid(
                source,
                "format",
                "expected a tunnel mapping or a list of tunnels",
            ));
        }
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let label = entry_label(i, &raw);
            serde_yaml::from_value::<TunnelConfig>(raw)
                .map_err(|e| Error::invalid(source, label, e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tunnel::Role;
    use crate::tunnel::tests::{client, server};

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::new(dir.join("tunnels.yaml"), &dir.join("run").join("locks"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_updates_both_persist() {
        let dir = tempfile::tempdir().unwrap();
        store_in(dir.path())
            .save(&Registry::from_tunnels(vec![client("web-a")]).unwrap())
            .unwrap();

        let mut handles = Vec::new();
        for name in ["web-b", "web-c"] {
            // Separate stores, as two frpmgr invocations would have.
            let store = store_in(dir.path());
            handles.push(tokio::spawn(async move {
                let deadline = Deadline::after(std::time::Duration::from_secs(10));
                store
                    .update(deadline, |reg| {
                        // Widen the read-modify-write window.
                        std::thread::sleep(std::time::Duration::from_millis(100));
                        reg.insert(client(name))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut names = store_in(dir.path()).load().unwrap().names();
        names.sort();
        assert_eq!(names, vec!["web-a", "web-b", "web-c"]);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = store_in(dir.path()).load().unwrap();
        assert!(registry.is_empty());
        assert!(registry.quarantined().is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let registry =
            Registry::from_tunnels(vec![client("web-b"), server("edge"), client("web-a")]).unwrap();
        store.save(&registry).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.names(), vec!["web-b", "edge", "web-a"]);
        assert_eq!(loaded, registry);
        assert!(!dir.path().join("tunnels.yaml.bak").exists());
    }

    #[test]
    fn test_malformed_entry_is_quarantined_and_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(
            store.path(),
            r#"
format_version: 1
tunnels:
  - name: web-a
    role: client
    connection:
      server_addr: frp.example.com
      server_port: 7000
  - name: broken
    role: bridge
  - name: web-a
    role: server
  - name: edge
    role: server
    connection:
      bind_port: 7000
"#,
        )
        .unwrap();

        let mut registry = store.load().unwrap();
        assert_eq!(registry.names(), vec!["web-a", "edge"]);
        let quarantined: Vec<_> = registry
            .quarantined()
            .iter()
            .map(|q| (q.index, q.name.clone()))
            .collect();
        assert_eq!(
            quarantined,
            vec![(1, Some("broken".to_string())), (2, Some("web-a".to_string()))]
        );
        assert!(registry.quarantined()[1].reason.contains("duplicate"));

        registry.get_mut("edge").unwrap().tags.insert("prod".to_string());
        store.save(&registry).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("bridge"), "quarantined entry kept verbatim");
        let reloaded = store.load().unwrap();
        assert!(reloaded.get("edge").unwrap().has_tag("prod"));
        assert_eq!(reloaded.quarantined().len(), 2);
    }

    #[test]
    fn test_unparseable_registry_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(store.path(), "tunnels: [unclosed").unwrap();
        assert_eq!(store.load().unwrap_err().kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_newer_registry_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::write(store.path(), "format_version: 99\ntunnels: []\n").unwrap();
        assert_eq!(store.load().unwrap_err().kind(), ErrorKind::Storage);
    }

    #[tokio::test]
    async fn test_update_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .save(&Registry::from_tunnels(vec![client("web-a")]).unwrap())
            .unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let deadline = Deadline::after(std::time::Duration::from_secs(5));
        let err = store
            .update(deadline, |reg| {
                reg.remove("web-a");
                reg.insert(client("web-b"))?;
                reg.insert(client("web-b"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let deadline = Deadline::after(std::time::Duration::from_secs(5));
        store
            .update(deadline, |reg| reg.insert(server("edge")))
            .await
            .unwrap();
        assert!(store.load().unwrap().contains("edge"));
    }

    #[test]
    fn test_upsert_keeps_role() {
        let mut registry = Registry::from_tunnels(vec![client("web-a")]).unwrap();
        let mut replacement = server("web-a");
        replacement.name = "web-a".to_string();
        let err = registry.upsert(replacement).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(registry.get("web-a").unwrap().role, Role::Client);

        let mut retagged = client("web-a");
        retagged.tags.insert("edge".to_string());
        assert!(registry.upsert(retagged).unwrap());
        assert!(registry.get("web-a").unwrap().has_tag("edge"));
    }

    #[test]
    fn test_export_replace_import_round_trip() {
        let mut tagged = client("web-a");
        tagged.tags.insert("prod".to_string());
        let original = Registry::from_tunnels(vec![tagged, server("edge")]).unwrap();
        let selection: Vec<&TunnelConfig> = original.tunnels().iter().collect();
        let blob = export(&selection).unwrap();
        assert!(blob.contains("\"format_version\": 1"));

        let (imported, report) = import(
            &Registry::default(),
            "backup.json",
            &blob,
            ImportMode::Replace,
            &CapabilitySet::default(),
        )
        .unwrap();
        assert_eq!(imported, original);
        assert_eq!(report.added, vec!["web-a", "edge"]);
    }

    #[test]
    fn test_merge_updates_duplicate_in_place() {
        let current = Registry::from_tunnels(vec![client("web-a"), server("edge")]).unwrap();
        let mut changed = client("web-a");
        changed.connection.server_port = Some(7443);
        let fresh = client("web-c");
        let blob = export(&[&changed, &fresh]).unwrap();

        let (merged, report) = import(
            &current,
            "blob",
            &blob,
            ImportMode::Merge,
            &CapabilitySet::default(),
        )
        .unwrap();
        assert_eq!(merged.names(), vec!["web-a", "edge", "web-c"]);
        assert_eq!(merged.get("web-a").unwrap().connection.server_port, Some(7443));
        assert_eq!(report.updated, vec!["web-a"]);
        assert_eq!(report.added, vec!["web-c"]);
        report.outcome().unwrap();
    }

    #[test]
    fn test_merge_skips_invalid_entries() {
        let current = Registry::from_tunnels(vec![client("web-a")]).unwrap();
        let blob = r#"
format_version: 1
tunnels:
  - name: web-b
    role: client
  - name: web-a
    role: server
    connection:
      bind_port: 7000
  - name: edge
    role: server
    connection:
      bind_port: 7000
"#;
        let (merged, report) = import(
            &current,
            "blob.yaml",
            blob,
            ImportMode::Merge,
            &CapabilitySet::default(),
        )
        .unwrap();
        assert_eq!(merged.names(), vec!["web-a", "edge"]);
        assert_eq!(merged.get("web-a").unwrap().role, Role::Client);
        let skipped: Vec<&str> = report.skipped.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(skipped, vec!["web-b", "web-a"]);
        assert_eq!(report.outcome().unwrap_err().exit_code(), 1);
    }

    #[test]
    fn test_replace_is_all_or_nothing() {
        let current = Registry::from_tunnels(vec![client("web-a")]).unwrap();
        let blob = r#"{"format_version": 1, "tunnels": [
            {"name": "edge", "role": "server", "connection": {"bind_port": 7000}},
            {"name": "web-b", "role": "client"}
        ]}"#;
        let err = import(
            &current,
            "blob.json",
            blob,
            ImportMode::Replace,
            &CapabilitySet::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("web-b.connection.server_addr"));
    }

    #[test]
    fn test_import_rejects_future_format() {
        let blob = r#"{"format_version": 2, "tunnels": []}"#;
        let err = import(
            &Registry::default(),
            "blob.json",
            blob,
            ImportMode::Merge,
            &CapabilitySet::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let missing = import(
            &Registry::default(),
            "blob.json",
            r#"{"tunnels": []}"#,
            ImportMode::Merge,
            &CapabilitySet::default(),
        )
        .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_parse_tunnel_file_shapes() {
        let single = "name: edge\nrole: server\nconnection:\n  bind_port: 7000\n";
        assert_eq!(parse_tunnel_file("a.yaml", single).unwrap().len(), 1);

        let list = "- name: edge\n  role: server\n- name: web-a\n  role: client\n";
        let names: Vec<String> = parse_tunnel_file("b.yaml", list)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["edge", "web-a"]);

        let blob = export(&[&server("edge")]).unwrap();
        assert_eq!(parse_tunnel_file("c.json", &blob).unwrap().len(), 1);

        let err = parse_tunnel_file("d.yaml", "42").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1, "no temporary files left behind");
    }
}
