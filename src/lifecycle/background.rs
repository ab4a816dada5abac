//! Detached execution.
//!
//! Work handed to [`detach`] runs on its own task and reports only through
//! the log and the inventory store; the caller gets a ticket back at once.
//! The CLI's `--background` flag goes one step further with
//! [`spawn_detached_process`], re-launching the binary in its own process
//! group with console output discarded.

use std::ffi::OsString;
use std::future::Future;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::Result;

/// Environment flag set on a re-launched background process
pub const BACKGROUND_ENV: &str = "BROKER_BACKGROUND";

/// Acknowledgement for detached work
#[derive(Debug)]
pub struct BackgroundTicket {
    /// Correlates log lines with this run
    pub id: Uuid,
    handle: JoinHandle<()>,
}

impl BackgroundTicket {
    /// Whether the detached work has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the detached work; its outcome is only in the log and store
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(id = %self.id, "Background task aborted: {e}");
        }
    }
}

/// Run `operation` detached from the caller
pub fn detach<T, F>(label: &str, operation: F) -> BackgroundTicket
where
    T: std::fmt::Debug + Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let id = Uuid::new_v4();
    let label = label.to_string();
    info!(%id, operation = %label, "Dispatching background operation");
    let handle = tokio::spawn(async move {
        match operation.await {
            Ok(outcome) => {
                info!(%id, operation = %label, ?outcome, "Background operation finished");
            }
            Err(e) => error!(%id, operation = %label, error = %e, "Background operation failed"),
        }
    });
    BackgroundTicket { id, handle }
}

/// Whether this process was launched as a background child
pub fn is_background_child() -> bool {
    std::env::var_os(BACKGROUND_ENV).is_some()
}

/// Re-launch the current executable with `args`, detached, and return its pid
pub fn spawn_detached_process(args: Vec<OsString>) -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .args(args)
        .env(BACKGROUND_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    Ok(child.id())
}

/// Drop the `--background`/`-b` flag from an argument list
pub fn strip_background_flag<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .filter(|arg| arg != "--background" && arg != "-b")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_detach_returns_immediately() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let ticket = detach("checkout", async move {
            let _ = rx.await;
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        });
        assert!(!done.load(Ordering::SeqCst));

        tx.send(()).unwrap();
        ticket.join().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_detach_swallows_errors_into_log() {
        let ticket = detach("checkin", async { Err::<(), _>(Error::validation("bad")) });
        ticket.join().await;
    }

    #[test]
    fn test_strip_background_flag() {
        let args = strip_background_flag(
            ["broker", "checkout", "--background", "--nick", "rhel"]
                .into_iter()
                .map(OsString::from),
        );
        assert_eq!(args, vec!["broker", "checkout", "--nick", "rhel"]);
    }
}
