// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Selection, search, bulk operations and maintenance over the registry.

use crate::context::{Confirm, Deadline};
use crate::error::{Error, ErrorKind, Result};
use crate::state::ProcessState;
use crate::store::{ConfigStore, Registry};
use crate::supervisor::{Orphan, StateChange, Supervisor};
use crate::tunnel::{Role, TunnelConfig};
use log::{info, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which tunnels a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Name(String),
    All,
    Enabled,
    Tag(String),
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(Error::invalid("selector", "selector", "must not be empty")),
            "all" => Ok(Selector::All),
            "enabled" => Ok(Selector::Enabled),
            _ => match s.strip_prefix("tag:") {
                Some("") => Err(Error::invalid("selector", "selector", "tag: needs a tag")),
                Some(tag) => Ok(Selector::Tag(tag.trim().to_lowercase())),
                None => Ok(Selector::Name(s.to_string())),
            },
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Name(name) => f.write_str(name),
            Selector::All => f.write_str("all"),
            Selector::Enabled => f.write_str("enabled"),
            Selector::Tag(tag) => write!(f, "tag:{tag}"),
        }
    }
}

impl Selector {
    /// Matching tunnels in registry order. Matching nothing is an error.
    pub fn resolve<'a>(&self, registry: &'a Registry) -> Result<Vec<&'a TunnelConfig>> {
        let selected: Vec<&TunnelConfig> = match self {
            Selector::Name(name) => {
                return registry
                    .get(name)
                    .map(|t| vec![t])
                    .ok_or_else(|| Error::NotFound(format!("tunnel '{name}'")));
            }
            Selector::All => registry.tunnels().iter().collect(),
            Selector::Enabled => registry.tunnels().iter().filter(|t| t.enabled).collect(),
            Selector::Tag(tag) => select_by_tag(registry, tag),
        };
        if selected.is_empty() {
            return Err(Error::NotFound(format!("no tunnels match '{self}'")));
        }
        Ok(selected)
    }

    /// Names the operation applies to. Lifecycle operations over `all` leave
    /// disabled tunnels alone.
    pub fn resolve_for(&self, registry: &Registry, op: &BulkOperation) -> Result<Vec<String>> {
        let selected = self.resolve(registry)?;
        let skip_disabled = *self == Selector::All && op.is_lifecycle();
        Ok(selected
            .into_iter()
            .filter(|t| !skip_disabled || t.enabled)
            .map(|t| t.name.clone())
            .collect())
    }
}

/// Tunnels carrying `tag`, in registry order.
pub fn select_by_tag<'a>(registry: &'a Registry, tag: &str) -> Vec<&'a TunnelConfig> {
    registry.tunnels().iter().filter(|t| t.has_tag(tag)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Name(String),
    Tag(String),
    Role(Role),
    State(ProcessState),
}

/// Search terms, all of which must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    terms: Vec<Term>,
}

impl Query {
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let mut terms = Vec::new();
        for word in words.iter().flat_map(|w| w.as_ref().split_whitespace()) {
            let term = match word.split_once(':') {
                Some(("name", v)) => Term::Name(v.to_string()),
                Some(("tag", v)) => Term::Tag(v.to_lowercase()),
                Some(("role", v)) => Term::Role(
                    v.parse()
                        .map_err(|e: String| Error::invalid("query", word, e))?,
                ),
                Some(("state", v)) => Term::State(
                    v.parse()
                        .map_err(|e: String| Error::invalid("query", word, e))?,
                ),
                _ => Term::Name(word.to_string()),
            };
            terms.push(term);
        }
        Ok(Self { terms })
    }

    /// Whether matching needs each tunnel's process state.
    pub fn needs_state(&self) -> bool {
        self.terms.iter().any(|t| matches!(t, Term::State(_)))
    }

    pub fn matches(&self, tunnel: &TunnelConfig, state: ProcessState) -> bool {
        self.terms.iter().all(|term| match term {
            Term::Name(sub) => tunnel.name.contains(sub.as_str()),
            Term::Tag(tag) => tunnel.has_tag(tag),
            Term::Role(role) => tunnel.role == *role,
            Term::State(s) => state == *s,
        })
    }
}

/// Tunnels matching `query`, in registry order.
pub fn search<'a>(
    registry: &'a Registry,
    query: &Query,
    state_of: impl Fn(&str) -> ProcessState,
) -> Vec<&'a TunnelConfig> {
    registry
        .tunnels()
        .iter()
        .filter(|t| query.matches(t, state_of(&t.name)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOperation {
    Start,
    Stop { graceful: bool },
    Restart,
    Tag(String),
    Untag(String),
    Remove,
}

impl BulkOperation {
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            BulkOperation::Start | BulkOperation::Stop { .. } | BulkOperation::Restart
        )
    }

    /// Operations that ask before acting.
    pub fn is_destructive(&self) -> bool {
        matches!(self, BulkOperation::Stop { .. } | BulkOperation::Remove)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            BulkOperation::Start => "start",
            BulkOperation::Stop { .. } => "stop",
            BulkOperation::Restart => "restart",
            BulkOperation::Tag(_) => "tag",
            BulkOperation::Untag(_) => "untag",
            BulkOperation::Remove => "remove",
        }
    }
}

#[derive(Debug)]
pub struct ItemResult {
    pub name: String,
    /// Human-readable outcome on success.
    pub result: Result<String>,
}

/// One result per selected tunnel, in selection order.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub items: Vec<ItemResult>,
}

impl BulkReport {
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_err()).count()
    }

    /// Aggregate outcome. A single-item batch reports that item's own error;
    /// larger batches report [`Error::Bulk`] carrying the worst kind seen.
    pub fn into_result(self) -> Result<()> {
        let total = self.items.len();
        let failed = self.failed();
        if failed == 0 {
            return Ok(());
        }
        let mut errors = self.items.into_iter().filter_map(|i| i.result.err());
        if total == 1 {
            return match errors.next() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        let worst = errors
            .map(|e| e.kind())
            .max_by_key(|k| k.severity())
            .unwrap_or(ErrorKind::General);
        Err(Error::Bulk {
            total,
            failed,
            worst,
        })
    }
}

fn normalize_tag(tag: &str) -> Result<String> {
    let tag = tag.trim().to_lowercase();
    if tag.is_empty() || tag.chars().any(char::is_whitespace) {
        return Err(Error::invalid("tag", "tag", format!("{tag:?} must be a single word")));
    }
    Ok(tag)
}

/// Apply `op` to each of `names` in order. Failures are recorded per item and
/// never stop the batch.
pub async fn bulk_apply(
    store: &ConfigStore,
    supervisor: &Supervisor,
    registry: &Registry,
    names: &[String],
    op: &BulkOperation,
    deadline: Deadline,
) -> BulkReport {
    let mut report = BulkReport::default();
    for name in names {
        let result = apply_one(store, supervisor, registry, name, op, deadline).await;
        match &result {
            Ok(outcome) => info!("[{name}] {}: {outcome}", op.verb()),
            Err(e) => warn!("[{name}] {} failed: {e}", op.verb()),
        }
        report.items.push(ItemResult {
            name: name.clone(),
            result,
        });
    }
    report
}

async fn apply_one(
    store: &ConfigStore,
    supervisor: &Supervisor,
    registry: &Registry,
    name: &str,
    op: &BulkOperation,
    deadline: Deadline,
) -> Result<String> {
    match op {
        BulkOperation::Start => {
            let record = supervisor.start(registry, name, deadline).await?;
            Ok(format!("running (pid={})", record.pid.unwrap_or_default()))
        }
        BulkOperation::Stop { graceful } => {
            supervisor.stop(name, *graceful, deadline).await?;
            Ok("stopped".to_string())
        }
        BulkOperation::Restart => {
            let record = supervisor.restart(registry, name, deadline).await?;
            Ok(format!("running (pid={})", record.pid.unwrap_or_default()))
        }
        BulkOperation::Tag(tag) => {
            let tag = normalize_tag(tag)?;
            let added = store
                .update(deadline, |reg| {
                    let t = reg
                        .get_mut(name)
                        .ok_or_else(|| Error::NotFound(format!("tunnel '{name}'")))?;
                    Ok(t.tags.insert(tag.clone()))
                })
                .await?;
            Ok(if added {
                format!("tagged {tag}")
            } else {
                format!("already tagged {tag}")
            })
        }
        BulkOperation::Untag(tag) => {
            let tag = normalize_tag(tag)?;
            let removed = store
                .update(deadline, |reg| {
                    let t = reg
                        .get_mut(name)
                        .ok_or_else(|| Error::NotFound(format!("tunnel '{name}'")))?;
                    Ok(t.tags.remove(&tag))
                })
                .await?;
            Ok(if removed {
                format!("untagged {tag}")
            } else {
                format!("not tagged {tag}")
            })
        }
        BulkOperation::Remove => {
            supervisor.stop(name, true, deadline).await?;
            store
                .update(deadline, |reg| {
                    reg.remove(name)
                        .map(|_| ())
                        .ok_or_else(|| Error::NotFound(format!("tunnel '{name}'")))
                })
                .await?;
            supervisor.forget(name)?;
            Ok("removed".to_string())
        }
    }
}

/// What one optimize pass found and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OptimizationReport {
    /// Records whose state changed when checked against the process table.
    pub refreshed: Vec<StateChange>,
    /// Crashed records acknowledged and cleared.
    pub cleared_records: Vec<String>,
    /// Orphans awaiting confirmation.
    pub orphans: Vec<Orphan>,
    pub orphans_removed: Vec<String>,
    /// Tunnels whose binary is not installed. Informational only.
    pub dangling: Vec<String>,
    pub normalized_tags: Vec<String>,
    pub stale_configs: Vec<PathBuf>,
}

impl OptimizationReport {
    /// Nothing changed and nothing awaits a decision.
    pub fn is_empty(&self) -> bool {
        self.refreshed.is_empty()
            && self.cleared_records.is_empty()
            && self.orphans.is_empty()
            && self.orphans_removed.is_empty()
            && self.normalized_tags.is_empty()
            && self.stale_configs.is_empty()
    }
}

fn normalized(tags: &BTreeSet<String>) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Reconcile, then clean up. Orphan removal is destructive and only happens
/// once `confirm` agrees; otherwise orphans are left in the report.
pub async fn optimize(
    store: &ConfigStore,
    supervisor: &Supervisor,
    confirm: &dyn Confirm,
    deadline: Deadline,
) -> Result<OptimizationReport> {
    let mut report = OptimizationReport::default();
    let registry = store.load()?;

    report.refreshed = supervisor.reconcile(&registry, deadline).await?;

    for tunnel in registry.tunnels() {
        let record = supervisor.status(&tunnel.name, deadline).await?;
        if record.state == ProcessState::Crashed {
            supervisor.stop(&tunnel.name, true, deadline).await?;
            report.cleared_records.push(tunnel.name.clone());
        }
        if supervisor.locator().locate(tunnel.role).is_none() {
            report.dangling.push(tunnel.name.clone());
        }
    }

    let orphans = supervisor.orphans(&registry)?;
    if !orphans.is_empty() {
        let action = format!("stop and remove {} orphaned tunnel record(s)", orphans.len());
        match confirm.confirm(&action) {
            Ok(()) => {
                for orphan in &orphans {
                    supervisor.remove_orphan(orphan, deadline).await?;
                    report.orphans_removed.push(orphan.name.clone());
                }
            }
            Err(Error::ConfirmationRequired(_)) => report.orphans = orphans,
            Err(e) => return Err(e),
        }
    }

    if registry.tunnels().iter().any(|t| normalized(&t.tags) != t.tags) {
        report.normalized_tags = store
            .update(deadline, |reg| {
                let mut changed = Vec::new();
                for t in reg.tunnels().to_vec() {
                    let tags = normalized(&t.tags);
                    if tags != t.tags
                        && let Some(entry) = reg.get_mut(&t.name)
                    {
                        entry.tags = tags;
                        changed.push(t.name);
                    }
                }
                Ok(changed)
            })
            .await?;
    }

    for path in supervisor.stale_configs(&registry)? {
        std::fs::remove_file(&path).map_err(|e| Error::storage_io(&path, e))?;
        info!("removed stale config {}", path.display());
        report.stale_configs.push(path);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::tests::{client, server};

    fn registry() -> Registry {
        let mut a = client("web-a");
        a.tags.insert("prod".to_string());
        let mut b = client("web-b");
        b.enabled = false;
        b.tags.insert("prod".to_string());
        let mut edge = server("edge");
        edge.tags.insert("infra".to_string());
        Registry::from_tunnels(vec![a, b, edge]).unwrap()
    }

    fn names(selected: &[&TunnelConfig]) -> Vec<String> {
        selected.iter().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("all".parse::<Selector>().unwrap(), Selector::All);
        assert_eq!("enabled".parse::<Selector>().unwrap(), Selector::Enabled);
        assert_eq!(
            "tag:prod".parse::<Selector>().unwrap(),
            Selector::Tag("prod".to_string())
        );
        assert_eq!(
            "web-a".parse::<Selector>().unwrap(),
            Selector::Name("web-a".to_string())
        );
        assert!("tag:".parse::<Selector>().is_err());
    }

    #[test]
    fn test_selector_resolve() {
        let reg = registry();
        assert_eq!(names(&Selector::All.resolve(&reg).unwrap()), vec!["web-a", "web-b", "edge"]);
        assert_eq!(names(&Selector::Enabled.resolve(&reg).unwrap()), vec!["web-a", "edge"]);
        assert_eq!(
            names(&Selector::Tag("prod".into()).resolve(&reg).unwrap()),
            vec!["web-a", "web-b"]
        );

        let err = Selector::Name("nope".into()).resolve(&reg).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        let err = Selector::Tag("staging".into()).resolve(&reg).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_tag_matching_ignores_case() {
        let mut reg = registry();
        assert_eq!(
            "tag:Prod".parse::<Selector>().unwrap(),
            Selector::Tag("prod".to_string())
        );
        assert_eq!(
            names(&"tag:PROD".parse::<Selector>().unwrap().resolve(&reg).unwrap()),
            vec!["web-a", "web-b"]
        );

        // Hand-edited entries may carry tags that were never normalized.
        reg.get_mut("edge").unwrap().tags.insert("Edge".to_string());
        assert_eq!(names(&Selector::Tag("edge".into()).resolve(&reg).unwrap()), vec!["edge"]);

        let q = Query::parse(&["tag:Infra"]).unwrap();
        let stopped = |_: &str| ProcessState::Stopped;
        assert_eq!(names(&search(&reg, &q, stopped)), vec!["edge"]);
    }

    #[test]
    fn test_lifecycle_over_all_skips_disabled() {
        let reg = registry();
        assert_eq!(
            Selector::All.resolve_for(&reg, &BulkOperation::Start).unwrap(),
            vec!["web-a", "edge"]
        );
        assert_eq!(
            Selector::All
                .resolve_for(&reg, &BulkOperation::Tag("x".into()))
                .unwrap(),
            vec!["web-a", "web-b", "edge"]
        );
        assert_eq!(
            Selector::Name("web-b".into())
                .resolve_for(&reg, &BulkOperation::Start)
                .unwrap(),
            vec!["web-b"]
        );
    }

    #[test]
    fn test_search_terms() {
        let reg = registry();
        let stopped = |_: &str| ProcessState::Stopped;

        let q = Query::parse(&["web"]).unwrap();
        assert_eq!(names(&search(&reg, &q, stopped)), vec!["web-a", "web-b"]);

        let q = Query::parse(&["tag:prod role:client name:b"]).unwrap();
        assert_eq!(names(&search(&reg, &q, stopped)), vec!["web-b"]);

        let q = Query::parse(&["role:server"]).unwrap();
        assert_eq!(names(&search(&reg, &q, stopped)), vec!["edge"]);

        let q = Query::parse(&["state:running"]).unwrap();
        assert!(q.needs_state());
        let running_a = |n: &str| {
            if n == "web-a" {
                ProcessState::Running
            } else {
                ProcessState::Stopped
            }
        };
        assert_eq!(names(&search(&reg, &q, running_a)), vec!["web-a"]);

        assert!(Query::parse(&["role:relay"]).is_err());
        assert!(Query::parse(&["state:zombie"]).is_err());
    }

    #[test]
    fn test_bulk_report_outcomes() {
        let ok = |name: &str| ItemResult {
            name: name.to_string(),
            result: Ok("done".to_string()),
        };
        let failed = |name: &str, e: Error| ItemResult {
            name: name.to_string(),
            result: Err(e),
        };

        let all_ok = BulkReport {
            items: vec![ok("a"), ok("b")],
        };
        all_ok.into_result().unwrap();

        let partial = BulkReport {
            items: vec![ok("a"), failed("b", Error::Timeout("x".into())), ok("c")],
        };
        assert_eq!(partial.failed(), 1);
        assert_eq!(partial.into_result().unwrap_err().exit_code(), 1);

        let full = BulkReport {
            items: vec![
                failed("a", Error::NotFound("x".into())),
                failed("b", Error::Permission("x".into())),
                failed("c", Error::invalid("c", "name", "x")),
            ],
        };
        assert_eq!(full.into_result().unwrap_err().exit_code(), 3);

        let single = BulkReport {
            items: vec![failed("a", Error::invalid("a", "name", "x"))],
        };
        assert_eq!(single.into_result().unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_normalized_tags() {
        let tags: BTreeSet<String> = [" Prod", "edge", ""].iter().map(|s| s.to_string()).collect();
        let expected: BTreeSet<String> = ["prod", "edge"].iter().map(|s| s.to_string()).collect();
        assert_eq!(normalized(&tags), expected);
        assert!(normalize_tag("two words").is_err());
        assert_eq!(normalize_tag(" Blue ").unwrap(), "blue");
    }

    #[tokio::test]
    async fn test_tag_untag_remove_without_processes() {
        let home = tempfile::tempdir().unwrap();
        let settings = crate::settings::Settings::with_home(home.path());
        let store = ConfigStore::new(&settings.registry_path, &settings.locks_dir());
        let supervisor = Supervisor::new(&settings);
        store.save(&registry()).unwrap();
        let reg = store.load().unwrap();
        let deadline = Deadline::after(std::time::Duration::from_secs(10));
        let names = vec!["web-a".to_string(), "edge".to_string()];

        let report = bulk_apply(
            &store,
            &supervisor,
            &reg,
            &names,
            &BulkOperation::Tag("Blue".into()),
            deadline,
        )
        .await;
        report.into_result().unwrap();
        let reg = store.load().unwrap();
        assert!(reg.get("web-a").unwrap().has_tag("blue"));
        assert!(reg.get("edge").unwrap().has_tag("blue"));

        let report = bulk_apply(
            &store,
            &supervisor,
            &reg,
            &["edge".to_string()],
            &BulkOperation::Untag("blue".into()),
            deadline,
        )
        .await;
        report.into_result().unwrap();

        let report = bulk_apply(
            &store,
            &supervisor,
            &reg,
            &["web-b".to_string(), "ghost".to_string()],
            &BulkOperation::Remove,
            deadline,
        )
        .await;
        assert!(report.items[0].result.is_ok());
        let err = report.into_result().unwrap_err();
        assert_eq!(err.exit_code(), 1, "one of two failed");

        let reg = store.load().unwrap();
        assert_eq!(reg.names(), vec!["web-a", "edge"]);
        assert!(!reg.get("edge").unwrap().has_tag("blue"));
    }

    #[tokio::test]
    async fn test_optimize_is_stable() {
        let home = tempfile::tempdir().unwrap();
        let settings = crate::settings::Settings::with_home(home.path());
        let store = ConfigStore::new(&settings.registry_path, &settings.locks_dir());
        let supervisor = Supervisor::new(&settings);

        let mut messy = client("web-a");
        messy.tags.insert(" Prod".to_string());
        store.save(&Registry::from_tunnels(vec![messy]).unwrap()).unwrap();
        let conf = settings.conf_dir();
        std::fs::create_dir_all(&conf).unwrap();
        std::fs::write(conf.join("gone.toml"), "serverPort = 7000\n").unwrap();
        let deadline = Deadline::after(std::time::Duration::from_secs(10));

        let first = optimize(&store, &supervisor, &crate::context::AssumeYes, deadline)
            .await
            .unwrap();
        assert_eq!(first.normalized_tags, vec!["web-a"]);
        assert_eq!(first.stale_configs, vec![conf.join("gone.toml")]);
        assert!(!first.is_empty());
        assert!(store.load().unwrap().get("web-a").unwrap().has_tag("prod"));

        let second = optimize(&store, &supervisor, &crate::context::AssumeYes, deadline)
            .await
            .unwrap();
        assert!(second.is_empty(), "{second:?}");
    }

    #[tokio::test]
    async fn test_optimize_leaves_unconfirmed_orphans() {
        let home = tempfile::tempdir().unwrap();
        let settings = crate::settings::Settings::with_home(home.path());
        let store = ConfigStore::new(&settings.registry_path, &settings.locks_dir());
        let supervisor = Supervisor::new(&settings);
        let mut crashed = crate::record::ProcessRecord::stopped("ghost");
        crashed.state = ProcessState::Crashed;
        supervisor.records().save(&crashed).unwrap();
        let deadline = Deadline::after(std::time::Duration::from_secs(10));

        let report = optimize(&store, &supervisor, &crate::context::NeverConfirm, deadline)
            .await
            .unwrap();
        assert_eq!(report.orphans.len(), 1);
        assert!(supervisor.records().has("ghost"));

        let report = optimize(&store, &supervisor, &crate::context::AssumeYes, deadline)
            .await
            .unwrap();
        assert_eq!(report.orphans_removed, vec!["ghost"]);
        assert!(!supervisor.records().has("ghost"));
    }
}
