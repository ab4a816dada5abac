//! Cooperative advisory lock around the inventory file.
//!
//! The lock lives in a sibling `<inventory>.lock` file and is an exclusive
//! `flock`, so every Broker process on the machine serializes its
//! load-modify-save cycles. Acquisition polls with a non-blocking attempt
//! until the configured wait runs out.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{InventoryError, InventoryResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct InventoryLock {
    _guard: Flock<File>,
    path: PathBuf,
}

impl InventoryLock {
    /// Lock file used for `inventory`
    pub fn lock_path(inventory: &Path) -> PathBuf {
        let mut name = inventory
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        inventory.with_file_name(name)
    }

    /// Acquire the lock for `inventory`, waiting at most `timeout`
    pub async fn acquire(inventory: &Path, timeout: Duration) -> InventoryResult<Self> {
        let path = Self::lock_path(inventory);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let started = Instant::now();

        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(guard) => {
                    trace!(
                        path = %path.display(),
                        waited = ?started.elapsed(),
                        "Inventory lock acquired"
                    );
                    return Ok(Self {
                        _guard: guard,
                        path,
                    });
                }
                Err((_, Errno::EAGAIN)) => {
                    if started.elapsed() >= timeout {
                        return Err(InventoryError::LockTimeout {
                            path,
                            waited: timeout,
                        });
                    }
                    debug!(path = %path.display(), "Inventory lock busy, waiting");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err((_, errno)) => {
                    return Err(InventoryError::Io(std::io::Error::from(errno)));
                }
            }
        }
    }

    /// Path of the held lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
