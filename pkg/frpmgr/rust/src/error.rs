// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding produced by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationError {
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "{}: {}", self.field, self.message),
            Severity::Warning => write!(f, "{}: {} (warning)", self.field, self.message),
        }
    }
}

fn join_findings(findings: &[ValidationError]) -> String {
    findings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed for '{tunnel}': {}", join_findings(.findings))]
    Validation {
        tunnel: String,
        findings: Vec<ValidationError>,
    },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("confirmation required to {0}; pass --yes to proceed non-interactively")]
    ConfirmationRequired(String),

    #[error("{failed} of {total} item(s) failed")]
    Bulk {
        total: usize,
        failed: usize,
        worst: ErrorKind,
    },
}

impl Error {
    pub fn validation(tunnel: impl Into<String>, findings: Vec<ValidationError>) -> Self {
        Error::Validation {
            tunnel: tunnel.into(),
            findings,
        }
    }

    /// A single hard validation failure.
    pub fn invalid(
        tunnel: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::validation(tunnel, vec![ValidationError::error(field, message)])
    }

    /// Classify a filesystem error on the registry or runtime directory.
    pub fn storage_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::Permission(format!("{}: {err}", path.display())),
            _ => Error::Storage(format!("{}: {err}", path.display())),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Permission(_) => ErrorKind::Permission,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Process(_) => ErrorKind::Process,
            Error::Storage(_) => ErrorKind::Storage,
            Error::ConfirmationRequired(_) => ErrorKind::General,
            Error::Bulk { failed, total, worst } => {
                if failed < total {
                    ErrorKind::General
                } else {
                    *worst
                }
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    General,
    Validation,
    Permission,
    NotFound,
    Timeout,
    Process,
    Storage,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::General | ErrorKind::Process | ErrorKind::Storage => 1,
            ErrorKind::Validation => 2,
            ErrorKind::Permission => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Timeout => 5,
        }
    }

    /// Rank used to pick the kind reported for a fully failed batch.
    pub fn severity(self) -> u8 {
        match self {
            ErrorKind::NotFound => 0,
            ErrorKind::Validation => 1,
            ErrorKind::General | ErrorKind::Process | ErrorKind::Storage => 2,
            ErrorKind::Timeout => 3,
            ErrorKind::Permission => 4,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::General => "general",
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Process => "process",
            ErrorKind::Storage => "storage",
        };
        f.write_str(s)
    }
}
