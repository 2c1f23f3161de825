// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::context::Deadline;
use crate::error::{Error, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::time::{Duration, sleep};

const LOCK_POLL: Duration = Duration::from_millis(20);

/// Exclusive advisory lock on a file, released on drop. Serializes
/// concurrent frpmgr invocations touching the same resource.
#[derive(Debug)]
pub struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Wait for the lock until `deadline`, then fail with a timeout.
    pub async fn acquire(path: &Path, deadline: Deadline) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage_io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| Error::storage_io(path, e))?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!("acquired {}", path.display());
                    return Ok(Self {
                        _lock: lock,
                        path: path.to_path_buf(),
                    });
                }
                Err((f, Errno::EAGAIN)) => {
                    if deadline.expired() {
                        return Err(Error::Timeout(format!(
                            "another frpmgr invocation holds {}",
                            path.display()
                        )));
                    }
                    file = f;
                    sleep(deadline.cap(LOCK_POLL)).await;
                }
                Err((_, Errno::EACCES | Errno::EPERM)) => {
                    return Err(Error::Permission(format!("locking {}", path.display())));
                }
                Err((_, errno)) => {
                    return Err(Error::Storage(format!("locking {}: {errno}", path.display())));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
