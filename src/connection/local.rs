//! Local session module
//!
//! Runs commands through `sh -c` on the control node and treats "remote"
//! paths as local paths. Used for hosts that live on the local machine and
//! for exercising scenarios without a network.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{CommandResult, ConnectionError, ConnectionResult, Session};

/// Session that executes on the current host
#[derive(Debug, Clone)]
pub struct LocalSession {
    /// Host record identity this session stands in for
    hostname: String,
}

impl LocalSession {
    /// Create a local session labelled with `hostname`
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    async fn copy(&self, from: &Path, to: &Path) -> ConnectionResult<()> {
        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::copy(from, to).await.map_err(|e| {
            ConnectionError::transfer_failed(
                &self.hostname,
                format!("{} -> {}: {e}", from.display(), to.display()),
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl Session for LocalSession {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn connect(&self) -> ConnectionResult<()> {
        Ok(())
    }

    async fn execute(&self, command: &str) -> ConnectionResult<CommandResult> {
        debug!(host = %self.hostname, command = %command, "Executing local command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConnectionError::ExecutionFailed {
                host: self.hostname.clone(),
                message: format!("Failed to spawn process: {e}"),
            })?;

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        trace!(status, stdout_len = stdout.len(), stderr_len = stderr.len(), "Command completed");

        Ok(CommandResult::new(status, stdout, stderr))
    }

    async fn upload(&self, local: &Path, remote: &str) -> ConnectionResult<()> {
        self.copy(local, Path::new(remote)).await
    }

    async fn download(&self, remote: &str, local: &Path) -> ConnectionResult<()> {
        self.copy(Path::new(remote), local).await
    }

    async fn interactive_shell(&self) -> ConnectionResult<i32> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let status = Command::new(shell)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_execute() {
        let session = LocalSession::new("localhost");
        let result = session.execute("echo 'hello world'").await.unwrap();

        assert!(result.success());
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_local_execute_failure_is_not_an_error() {
        let session = LocalSession::new("localhost");
        let result = session.execute("echo oops >&2; exit 3").await.unwrap();

        assert_eq!(result.status, 3);
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let session = LocalSession::new("slowhost");
        let err = session
            .run("sleep 5", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::Timeout { ref host, .. } if host == "slowhost"));
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        std::fs::write(&source, "payload").unwrap();
        let remote = dir.path().join("remote/copy.txt");
        let back = dir.path().join("back.txt");

        let session = LocalSession::new("localhost");
        session
            .upload(&source, remote.to_str().unwrap())
            .await
            .unwrap();
        session
            .download(remote.to_str().unwrap(), &back)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(back).unwrap(), "payload");
    }
}
