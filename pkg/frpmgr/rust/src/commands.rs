// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Maps each command to engine operations. Only this layer and
//! [`ExecutionContext`] know about prompts and output.

use crate::cli::{BulkOperationArg, Command};
use crate::context::{Confirm, Deadline, ExecutionContext};
use crate::error::{Error, Result, ValidationError};
use crate::query::{BulkOperation, BulkReport, Query, Selector, bulk_apply, optimize, search};
use crate::record::ProcessRecord;
use crate::settings::Settings;
use crate::state::ProcessState;
use crate::store::{ConfigStore, ImportMode, export, import, parse_tunnel_file, write_atomic};
use crate::supervisor::Supervisor;
use crate::tunnel::{Role, TunnelConfig};
use crate::validate::validate;
use log::warn;
use std::collections::HashMap;
use std::path::Path;

pub struct App {
    store: ConfigStore,
    supervisor: Supervisor,
}

fn read_input(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(format!("file {}", path.display())),
        _ => Error::storage_io(path, e),
    })
}

fn status_line(record: &ProcessRecord) -> String {
    let pid = record
        .pid
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    let mut line = format!(
        "{:<24} {:<9} pid={:<8} started={}",
        record.tunnel_name,
        record.state.to_string(),
        pid,
        record.started_at_display()
    );
    if record.state == ProcessState::Crashed
        && let Some(reason) = &record.last_exit_reason
    {
        line.push_str(&format!(" ({reason})"));
    }
    line
}

fn describe(t: &TunnelConfig) -> String {
    let tags = t.tags.iter().cloned().collect::<Vec<_>>().join(",");
    format!(
        "{:<24} {:<6} {:<8} tags=[{tags}]",
        t.name,
        t.role.to_string(),
        if t.enabled { "enabled" } else { "disabled" }
    )
}

impl App {
    pub fn new(settings: &Settings) -> Self {
        Self {
            store: ConfigStore::new(&settings.registry_path, &settings.locks_dir()),
            supervisor: Supervisor::new(settings),
        }
    }

    /// Run `command` under the context's deadline.
    pub async fn execute(&self, command: Command, ctx: &ExecutionContext) -> Result<()> {
        ctx.run(|deadline| self.dispatch(command, ctx, deadline)).await
    }

    async fn dispatch(&self, command: Command, ctx: &ExecutionContext, deadline: Deadline) -> Result<()> {
        match command {
            Command::Start { selector } => {
                self.apply(ctx, deadline, selector.parse()?, BulkOperation::Start)
                    .await
            }
            Command::Stop { selector, force } => {
                let op = BulkOperation::Stop { graceful: !force };
                self.apply(ctx, deadline, selector.parse()?, op).await
            }
            Command::Restart { selector } => {
                self.apply(ctx, deadline, selector.parse()?, BulkOperation::Restart)
                    .await
            }
            Command::Status { selector } => self.status(ctx, deadline, selector.as_deref()).await,
            Command::Export { path, selector } => self.export(ctx, &path, &selector),
            Command::Import { path, mode } => self.import(ctx, deadline, &path, mode.into()).await,
            Command::Validate { path } => self.validate(ctx, path.as_deref()).await,
            Command::Bulk {
                operation,
                selector,
                tag,
                force,
            } => {
                let op = match (operation, tag) {
                    (BulkOperationArg::Start, _) => BulkOperation::Start,
                    (BulkOperationArg::Stop, _) => BulkOperation::Stop { graceful: !force },
                    (BulkOperationArg::Restart, _) => BulkOperation::Restart,
                    (BulkOperationArg::Remove, _) => BulkOperation::Remove,
                    (BulkOperationArg::Tag, Some(tag)) => BulkOperation::Tag(tag),
                    (BulkOperationArg::Untag, Some(tag)) => BulkOperation::Untag(tag),
                    (BulkOperationArg::Tag | BulkOperationArg::Untag, None) => {
                        return Err(Error::invalid("bulk", "--tag", "required for tag and untag"));
                    }
                };
                self.apply(ctx, deadline, selector.parse()?, op).await
            }
            Command::Search { query } => self.search(ctx, deadline, &query).await,
            Command::Tag { name, tag } => {
                self.apply(ctx, deadline, Selector::Name(name), BulkOperation::Tag(tag))
                    .await
            }
            Command::Untag { name, tag } => {
                self.apply(ctx, deadline, Selector::Name(name), BulkOperation::Untag(tag))
                    .await
            }
            Command::Optimize => self.optimize(ctx, deadline).await,
            Command::Add { path } => self.add(ctx, deadline, &path).await,
            Command::Remove { name } => {
                self.apply(ctx, deadline, Selector::Name(name), BulkOperation::Remove)
                    .await
            }
            Command::List => self.list(ctx, deadline).await,
            Command::Version => {
                for role in [Role::Server, Role::Client] {
                    let probe = self.supervisor.probe(role).await;
                    ctx.emit(format!("{}: {probe}", role.binary_name()));
                }
                Ok(())
            }
        }
    }

    /// Resolve, confirm if destructive, then run the batch.
    async fn apply(
        &self,
        ctx: &ExecutionContext,
        deadline: Deadline,
        selector: Selector,
        op: BulkOperation,
    ) -> Result<()> {
        let registry = self.store.load()?;
        let names = selector.resolve_for(&registry, &op)?;
        if names.is_empty() {
            ctx.info(format!("no enabled tunnels match '{selector}'"));
            return Ok(());
        }
        if op.is_destructive() {
            ctx.confirm(&format!("{} {}", op.verb(), names.join(", ")))?;
        }

        let report = bulk_apply(&self.store, &self.supervisor, &registry, &names, &op, deadline).await;
        print_report(ctx, &report);
        report.into_result()
    }

    async fn status(
        &self,
        ctx: &ExecutionContext,
        deadline: Deadline,
        selector: Option<&str>,
    ) -> Result<()> {
        let registry = self.store.load()?;
        let names = match selector {
            Some(s) => s
                .parse::<Selector>()?
                .resolve(&registry)?
                .into_iter()
                .map(|t| t.name.clone())
                .collect(),
            None => registry.names(),
        };
        for name in names {
            let record = self.supervisor.status(&name, deadline).await?;
            ctx.emit(status_line(&record));
        }
        Ok(())
    }

    fn export(&self, ctx: &ExecutionContext, path: &Path, selector: &str) -> Result<()> {
        let registry = self.store.load()?;
        let selected = selector.parse::<Selector>()?.resolve(&registry)?;
        let blob = export(&selected)?;
        if path == Path::new("-") {
            ctx.emit(blob);
        } else {
            write_atomic(path, blob.as_bytes())?;
            ctx.info(format!(
                "exported {} tunnel(s) to {}",
                selected.len(),
                path.display()
            ));
        }
        Ok(())
    }

    async fn import(
        &self,
        ctx: &ExecutionContext,
        deadline: Deadline,
        path: &Path,
        mode: ImportMode,
    ) -> Result<()> {
        let blob = read_input(path)?;
        let source = path.display().to_string();
        let caps = self.supervisor.capabilities().await;

        let report = self
            .store
            .update(deadline, |registry| {
                let (next, report) = import(registry, &source, &blob, mode, &caps)?;
                if mode == ImportMode::Replace {
                    ctx.confirm(&format!(
                        "replace {} registered tunnel(s) with {} from {source}",
                        registry.tunnels().len(),
                        next.tunnels().len()
                    ))?;
                }
                *registry = next;
                Ok(report)
            })
            .await?;

        for name in &report.added {
            ctx.info(format!("added {name}"));
        }
        for name in &report.updated {
            ctx.info(format!("updated {name}"));
        }
        for name in &report.removed {
            ctx.info(format!("removed {name}"));
        }
        for (entry, reason) in &report.skipped {
            ctx.error(format!("skipped {entry}: {reason}"));
        }
        report.outcome()
    }

    async fn validate(&self, ctx: &ExecutionContext, path: Option<&Path>) -> Result<()> {
        let caps = self.supervisor.capabilities().await;
        let (label, tunnels, mut failures) = match path {
            Some(path) => {
                let label = path.display().to_string();
                let tunnels = parse_tunnel_file(&label, &read_input(path)?)?;
                (label, tunnels, Vec::new())
            }
            None => {
                let registry = self.store.load()?;
                let quarantined: Vec<ValidationError> = registry
                    .quarantined()
                    .iter()
                    .map(|q| ValidationError::error(format!("entry #{}", q.index), q.to_string()))
                    .collect();
                (
                    self.store.path().display().to_string(),
                    registry.tunnels().to_vec(),
                    quarantined,
                )
            }
        };

        for (i, t) in tunnels.iter().enumerate() {
            let peers: Vec<TunnelConfig> = tunnels
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, p)| p.clone())
                .collect();
            match validate(t, &peers, caps.for_role(t.role)) {
                Ok(warnings) => {
                    for w in warnings {
                        warn!("[{}] {w}", t.name);
                    }
                    ctx.info(format!("{}: ok", t.name));
                }
                Err(Error::Validation { findings, .. }) => failures.extend(
                    findings
                        .into_iter()
                        .filter(ValidationError::is_hard)
                        .map(|f| ValidationError::error(format!("{}.{}", t.name, f.field), f.message)),
                ),
                Err(e) => return Err(e),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(label, failures))
        }
    }

    async fn search(&self, ctx: &ExecutionContext, deadline: Deadline, words: &[String]) -> Result<()> {
        let query = Query::parse(words)?;
        let registry = self.store.load()?;
        let mut states = HashMap::new();
        if query.needs_state() {
            for name in registry.names() {
                let state = self.supervisor.status(&name, deadline).await?.state;
                states.insert(name, state);
            }
        }
        let found = search(&registry, &query, |name| {
            states.get(name).copied().unwrap_or(ProcessState::Stopped)
        });
        for t in found {
            ctx.emit(describe(t));
        }
        Ok(())
    }

    async fn optimize(&self, ctx: &ExecutionContext, deadline: Deadline) -> Result<()> {
        let report = optimize(&self.store, &self.supervisor, ctx, deadline).await?;
        for change in &report.refreshed {
            ctx.info(format!("{}: {} -> {}", change.name, change.from, change.to));
        }
        for name in &report.cleared_records {
            ctx.info(format!("{name}: cleared crashed record"));
        }
        for name in &report.orphans_removed {
            ctx.info(format!("{name}: removed orphan"));
        }
        for name in &report.normalized_tags {
            ctx.info(format!("{name}: normalized tags"));
        }
        for path in &report.stale_configs {
            ctx.info(format!("removed stale config {}", path.display()));
        }
        for name in &report.dangling {
            ctx.info(format!("{name}: binary for this role is not installed"));
        }
        if report.is_empty() {
            ctx.info("nothing to optimize");
        }
        if report.orphans.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = report.orphans.iter().map(|o| o.name.as_str()).collect();
        Err(Error::ConfirmationRequired(format!(
            "stop and remove orphaned tunnel(s) {}",
            names.join(", ")
        )))
    }

    async fn add(&self, ctx: &ExecutionContext, deadline: Deadline, path: &Path) -> Result<()> {
        let tunnels = parse_tunnel_file(&path.display().to_string(), &read_input(path)?)?;
        let caps = self.supervisor.capabilities().await;
        let added = self
            .store
            .update(deadline, |registry| {
                let mut added = Vec::new();
                for t in tunnels {
                    for w in registry.validate_entry(&t, &caps)? {
                        warn!("[{}] {w}", t.name);
                    }
                    added.push(t.name.clone());
                    registry.insert(t)?;
                }
                Ok(added)
            })
            .await?;
        for name in added {
            ctx.info(format!("added {name}"));
        }
        Ok(())
    }

    async fn list(&self, ctx: &ExecutionContext, deadline: Deadline) -> Result<()> {
        let registry = self.store.load()?;
        for t in registry.tunnels() {
            let state = self.supervisor.status(&t.name, deadline).await?.state;
            ctx.emit(format!("{} {state}", describe(t)));
        }
        for q in registry.quarantined() {
            ctx.error(format!("quarantined registry {q}"));
        }
        Ok(())
    }
}

/// Per-item lines. A single failing item is left to the caller's error
/// report so it is not printed twice.
fn print_report(ctx: &ExecutionContext, report: &BulkReport) {
    let batch = report.items.len() > 1;
    for item in &report.items {
        match &item.result {
            Ok(outcome) => ctx.info(format!("{}: {outcome}", item.name)),
            Err(e) if batch => ctx.error(format!("{}: {e}", item.name)),
            Err(_) => {}
        }
    }
}
