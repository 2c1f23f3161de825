// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::store::ImportMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "frpmgr", version, about = "Manage FRP tunnels on this host")]
pub struct Cli {
    /// Do not ask for confirmation before destructive actions
    #[arg(short = 'y', long = "yes", global = true)]
    pub yes: bool,

    /// Only print errors and requested data
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Deadline for the whole command, e.g. 30s, 500ms, 2m
    #[arg(long, global = true, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start tunnels
    Start { selector: String },
    /// Stop tunnels
    Stop {
        selector: String,
        /// SIGKILL without waiting for a graceful exit
        #[arg(long)]
        force: bool,
    },
    /// Stop then start tunnels
    Restart { selector: String },
    /// Show process state (all tunnels by default)
    Status { selector: Option<String> },
    /// Write selected tunnels to a portable file ("-" for stdout)
    Export {
        path: PathBuf,
        #[arg(long, default_value = "all")]
        selector: String,
    },
    /// Load tunnels from an exported file
    Import {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = ImportModeArg::Merge)]
        mode: ImportModeArg,
    },
    /// Check a tunnel file, or the whole registry
    Validate { path: Option<PathBuf> },
    /// Apply one operation to every selected tunnel
    Bulk {
        #[arg(value_enum)]
        operation: BulkOperationArg,
        selector: String,
        /// Tag for the tag and untag operations
        #[arg(long)]
        tag: Option<String>,
        /// For stop: SIGKILL without waiting for a graceful exit
        #[arg(long)]
        force: bool,
    },
    /// Find tunnels: name:, tag:, role:, state: or a bare name fragment
    Search {
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Add a tag to a tunnel
    Tag { name: String, tag: String },
    /// Remove a tag from a tunnel
    Untag { name: String, tag: String },
    /// Reconcile process state and clean up leftovers
    Optimize,
    /// Register tunnels from a YAML or JSON file
    Add { path: PathBuf },
    /// Stop and unregister a tunnel
    Remove { name: String },
    /// List registered tunnels
    List,
    /// Show installed FRP versions
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImportModeArg {
    Merge,
    Replace,
}

impl From<ImportModeArg> for ImportMode {
    fn from(mode: ImportModeArg) -> Self {
        match mode {
            ImportModeArg::Merge => ImportMode::Merge,
            ImportModeArg::Replace => ImportMode::Replace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BulkOperationArg {
    Start,
    Stop,
    Restart,
    Tag,
    Untag,
    Remove,
}

/// Longest accepted `--timeout`.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// `500ms`, `30s`, `2m`, `1h`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    let d = match unit {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.saturating_mul(60)),
        "h" => Duration::from_secs(n.saturating_mul(3600)),
        _ => return Err(format!("invalid duration unit '{unit}' in '{s}'")),
    };
    if d.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    if d > MAX_TIMEOUT {
        return Err(format!("duration '{s}' exceeds the maximum of 7 days"));
    }
    Ok(d)
}

pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}
