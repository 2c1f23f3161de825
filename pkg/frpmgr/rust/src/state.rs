// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process.
    Stopped,
    /// Spawned, still inside the startup grace window.
    Starting,
    /// Alive at the last liveness check.
    Running,
    /// Termination requested, exit not yet confirmed.
    Stopping,
    /// The process disappeared without being stopped.
    Crashed,
    /// Found in the process table, liveness not yet confirmed.
    Unknown,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Starting)
    }

    /// States that carry a pid worth checking.
    pub fn expects_process(self) -> bool {
        matches!(
            self,
            ProcessState::Starting
                | ProcessState::Running
                | ProcessState::Stopping
                | ProcessState::Unknown
        )
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Unknown, Running)
                | (Unknown, Stopping)
                | (Crashed, Stopped)
                | (Starting | Running | Stopping | Unknown, Crashed)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stopped" => Ok(ProcessState::Stopped),
            "starting" => Ok(ProcessState::Starting),
            "running" => Ok(ProcessState::Running),
            "stopping" => Ok(ProcessState::Stopping),
            "crashed" => Ok(ProcessState::Crashed),
            "unknown" => Ok(ProcessState::Unknown),
            other => Err(format!("unknown state: {other}")),
        }
    }
}
