// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Execution context for non-interactive invocations.
//!
//! Every command runs under a [`Deadline`] derived from `--timeout`, never
//! blocks on input unless stdin is a terminal, and maps its outcome to one
//! of the documented exit codes.

use crate::error::{Error, Result};
use std::future::Future;
use std::io::{BufRead, IsTerminal, Write};
use tokio::time::{Duration, Instant};

/// Extra time granted to an operation past its deadline before it is
/// abandoned, so cooperative cleanup (killing a half-started child, clearing
/// a marker) can finish.
const DEADLINE_SLACK: Duration = Duration::from_millis(250);

/// Stand-in for a limit too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Point in time by which a blocking operation must give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(limit)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self { at }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Clamp a wait so it never runs past the deadline.
    pub fn cap(&self, wait: Duration) -> Duration {
        wait.min(self.remaining())
    }

    pub fn instant(&self) -> Instant {
        self.at
    }
}

/// Gate for destructive actions.
pub trait Confirm {
    fn confirm(&self, action: &str) -> Result<()>;
}

/// Always approves. Used when `--yes` was given and in tests.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _action: &str) -> Result<()> {
        Ok(())
    }
}

/// Always refuses with [`Error::ConfirmationRequired`].
pub struct NeverConfirm;

impl Confirm for NeverConfirm {
    fn confirm(&self, action: &str) -> Result<()> {
        Err(Error::ConfirmationRequired(action.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub assume_yes: bool,
    pub quiet: bool,
    pub timeout: Duration,
    interactive: bool,
}

impl ExecutionContext {
    pub fn new(assume_yes: bool, quiet: bool, timeout: Duration) -> Self {
        Self {
            assume_yes,
            quiet,
            timeout,
            interactive: std::io::stdin().is_terminal(),
        }
    }

    /// Context that never prompts, regardless of the attached terminal.
    pub fn non_interactive(assume_yes: bool, timeout: Duration) -> Self {
        Self {
            assume_yes,
            quiet: true,
            timeout,
            interactive: false,
        }
    }

    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }

    /// Run `op` under a fresh deadline. Operations are expected to honor the
    /// deadline themselves; one that overruns it by more than the slack is
    /// abandoned and reported as a timeout.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Deadline) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.deadline();
        let abandon_at = deadline
            .instant()
            .checked_add(DEADLINE_SLACK)
            .unwrap_or(deadline.instant());
        match tokio::time::timeout_at(abandon_at, op(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "operation exceeded {}",
                crate::cli::format_duration(self.timeout)
            ))),
        }
    }

    /// Human-readable result line on stdout; suppressed by `--quiet`.
    pub fn info(&self, message: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", message.as_ref());
        }
    }

    /// Machine-readable output on stdout; never suppressed.
    pub fn emit(&self, message: impl AsRef<str>) {
        println!("{}", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        eprintln!("Error: {}", message.as_ref());
    }

    /// Print the failure and return its exit code.
    pub fn report(&self, err: &Error) -> i32 {
        self.error(err.to_string());
        err.exit_code()
    }
}

impl Confirm for ExecutionContext {
    fn confirm(&self, action: &str) -> Result<()> {
        if self.assume_yes {
            return Ok(());
        }
        if !self.interactive {
            return Err(Error::ConfirmationRequired(action.to_string()));
        }
        let mut stderr = std::io::stderr().lock();
        write!(stderr, "About to {action}. Continue? [y/N] ")
            .and_then(|()| stderr.flush())
            .map_err(|e| Error::Storage(format!("writing prompt: {e}")))?;

        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| Error::Storage(format!("reading confirmation: {e}")))?;
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(()),
            _ => Err(Error::ConfirmationRequired(action.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_deadline_accounting() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.remaining() <= Duration::from_secs(60));
        assert_eq!(deadline.cap(Duration::from_millis(5)), Duration::from_millis(5));

        let past = Deadline::after(Duration::ZERO);
        assert!(past.expired());
        assert_eq!(past.cap(Duration::from_secs(1)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_passes_through_result() {
        let ctx = ExecutionContext::non_interactive(false, Duration::from_secs(5));
        let value = ctx.run(|_| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = ctx
            .run(|_| async { Err::<(), _>(Error::NotFound("tunnel 'x'".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_run_abandons_overrunning_operation() {
        let ctx = ExecutionContext::non_interactive(false, Duration::from_millis(50));
        let err = ctx
            .run(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.expired());
        assert!(deadline.remaining() > Duration::from_secs(3600));

        let ctx = ExecutionContext::non_interactive(true, Duration::from_secs(u64::MAX));
        assert_eq!(ctx.run(|_| async { Ok(3) }).await.unwrap(), 3);
    }

    #[test]
    fn test_non_interactive_confirm() {
        let refuse = ExecutionContext::non_interactive(false, Duration::from_secs(1));
        assert!(matches!(
            refuse.confirm("stop web-a"),
            Err(Error::ConfirmationRequired(_))
        ));

        let approve = ExecutionContext::non_interactive(true, Duration::from_secs(1));
        approve.confirm("stop web-a").unwrap();
        AssumeYes.confirm("anything").unwrap();
        assert!(NeverConfirm.confirm("anything").is_err());
    }
}
