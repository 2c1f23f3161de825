// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `log` backend shared by the frpmgr binaries.
//!
//! Lines follow the agent layout:
//! `2026-10-17 09:12:44 UTC | FRPMGR | INFO | (src/supervisor.rs:88 in frpmgr::supervisor) | message`

use log::{LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use time::OffsetDateTime;
use time::macros::format_description;

const COMPONENT: &str = "FRPMGR";

#[derive(Debug)]
pub enum InitError {
    OpenFile(io::Error),
    AlreadyInitialized,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::OpenFile(e) => write!(f, "opening log file: {e}"),
            InitError::AlreadyInitialized => write!(f, "a logger is already installed"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::OpenFile(e) => Some(e),
            InitError::AlreadyInitialized => None,
        }
    }
}

struct AgentLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record, OffsetDateTime::now_utc());

        // A broken stderr must never take the process down.
        let _ = writeln!(io::stderr().lock(), "{line}");

        if let Some(file) = &self.file
            && let Ok(mut f) = file.lock()
        {
            let _ = writeln!(f, "{line}");
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file
            && let Ok(mut f) = file.lock()
        {
            let _ = f.flush();
        }
    }
}

/// Install the logger. `file`, when given, is opened in append mode and
/// receives a copy of every line written to stderr.
pub fn init(level: LevelFilter, file: Option<&Path>) -> Result<(), InitError> {
    let file = match file {
        Some(path) => Some(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(InitError::OpenFile)?,
        )),
        None => None,
    };

    log::set_boxed_logger(Box::new(AgentLogger { level, file }))
        .map_err(|_| InitError::AlreadyInitialized)?;
    log::set_max_level(level);
    Ok(())
}

/// Render one record in the agent layout.
pub fn format_line(record: &Record, now: OffsetDateTime) -> String {
    let timestamp = now
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string());

    let location = match (record.file(), record.line()) {
        (Some(file), Some(line)) => format!(
            "({file}:{line} in {})",
            record.module_path().unwrap_or("unknown")
        ),
        _ => format!("(in {})", record.target()),
    };

    format!(
        "{timestamp} | {COMPONENT} | {} | {location} | {}",
        record.level(),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use regex::Regex;
    use time::macros::datetime;

    #[test]
    fn test_format_line_layout() {
        let line = format_line(
            &Record::builder()
                .args(format_args!("[web-a] spawned (pid=42)"))
                .level(Level::Info)
                .file(Some("src/supervisor.rs"))
                .line(Some(88))
                .module_path(Some("frpmgr::supervisor"))
                .build(),
            datetime!(2026-10-17 09:12:44 UTC),
        );

        assert_eq!(
            line,
            "2026-10-17 09:12:44 UTC | FRPMGR | INFO | (src/supervisor.rs:88 in frpmgr::supervisor) | [web-a] spawned (pid=42)"
        );
    }

    #[test]
    fn test_format_line_without_location() {
        let line = format_line(
            &Record::builder()
                .args(format_args!("hello"))
                .level(Level::Warn)
                .target("frpmgr")
                .build(),
            OffsetDateTime::now_utc(),
        );

        let re = Regex::new(
            r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} UTC \| FRPMGR \| WARN \| \(in frpmgr\) \| hello$",
        )
        .unwrap();
        assert!(re.is_match(&line), "unexpected line: {line}");
    }

    #[test]
    fn test_logger_respects_level() {
        let logger = AgentLogger {
            level: LevelFilter::Warn,
            file: None,
        };
        assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));
        assert!(logger.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));
    }

    #[test]
    fn test_logger_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpmgr.log");
        let logger = AgentLogger {
            level: LevelFilter::Debug,
            file: Some(Mutex::new(File::create(&path).unwrap())),
        };

        logger.log(
            &Record::builder()
                .args(format_args!("written to file"))
                .level(Level::Debug)
                .target("frpmgr")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("filtered out"))
                .level(Level::Trace)
                .target("frpmgr")
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("| DEBUG |"));
        assert!(contents.contains("written to file"));
        assert!(!contents.contains("filtered out"));
    }
}
