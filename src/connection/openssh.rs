//! OpenSSH session module
//!
//! Drives the system `ssh` and `scp` clients. The wire protocol is entirely
//! theirs; this module only builds argument lists and classifies failures.
//! `ssh` reserves exit status 255 for its own errors, so that status is read
//! as a connectivity failure rather than a command result.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{CommandResult, ConnectionError, ConnectionResult, Session, SessionTarget};
use crate::config::SshSettings;

const SSH_ERROR_STATUS: i32 = 255;

/// Session backed by the OpenSSH client executables
#[derive(Debug, Clone)]
pub struct OpensshSession {
    target: SessionTarget,
    settings: SshSettings,
    ssh: PathBuf,
    scp: PathBuf,
}

impl OpensshSession {
    /// Create a session, locating the client executables on `PATH`
    pub fn new(target: SessionTarget, settings: SshSettings) -> ConnectionResult<Self> {
        let ssh = which::which(&settings.ssh_executable).map_err(|e| {
            ConnectionError::InvalidConfig(format!("'{}' not found: {e}", settings.ssh_executable))
        })?;
        let scp = which::which(&settings.scp_executable).map_err(|e| {
            ConnectionError::InvalidConfig(format!("'{}' not found: {e}", settings.scp_executable))
        })?;
        Ok(Self {
            target,
            settings,
            ssh,
            scp,
        })
    }

    /// Options shared by ssh and scp
    fn common_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!(
                "ConnectTimeout={}",
                self.settings.connection_timeout.as_secs().max(1)
            )
            .into(),
        ];
        if let Some(key) = &self.target.key_filename {
            args.push("-i".into());
            args.push(key.clone().into_os_string());
        }
        args.extend(self.settings.extra_args.iter().map(OsString::from));
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.username, self.target.hostname)
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(self.common_args())
            .arg("-p")
            .arg(self.target.port.to_string());
        cmd
    }

    /// `user@host:'path'` as scp expects it
    fn remote_spec(&self, remote: &str) -> String {
        format!("{}:{}", self.destination(), shell_words::quote(remote))
    }

    async fn scp(&self, from: OsString, to: OsString) -> ConnectionResult<()> {
        let output = Command::new(&self.scp)
            .args(self.common_args())
            .arg("-P")
            .arg(self.target.port.to_string())
            .arg(&from)
            .arg(&to)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(SSH_ERROR_STATUS) || is_connection_message(&stderr) {
            Err(ConnectionError::connection_failed(&self.target.hostname, stderr))
        } else {
            Err(ConnectionError::transfer_failed(&self.target.hostname, stderr))
        }
    }

    fn classify(&self, stderr: &str) -> ConnectionError {
        let message = stderr.trim().to_string();
        if message.contains("Permission denied") {
            ConnectionError::AuthenticationFailed {
                host: self.target.hostname.clone(),
                message,
            }
        } else {
            ConnectionError::connection_failed(&self.target.hostname, message)
        }
    }
}

fn is_connection_message(stderr: &str) -> bool {
    ["Connection refused", "Connection timed out", "Could not resolve", "No route to host"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl Session for OpensshSession {
    fn hostname(&self) -> &str {
        &self.target.hostname
    }

    async fn connect(&self) -> ConnectionResult<()> {
        debug!(host = %self.target.hostname, port = self.target.port, "Probing ssh connection");
        let output = self
            .ssh_command()
            .arg(self.destination())
            .arg("true")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.classify(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn execute(&self, command: &str) -> ConnectionResult<CommandResult> {
        debug!(host = %self.target.hostname, command = %command, "Executing remote command");
        let output = self
            .ssh_command()
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConnectionError::ExecutionFailed {
                host: self.target.hostname.clone(),
                message: e.to_string(),
            })?;

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if status == SSH_ERROR_STATUS {
            return Err(self.classify(&stderr));
        }

        trace!(status, stdout_len = stdout.len(), "Remote command completed");
        Ok(CommandResult::new(status, stdout, stderr))
    }

    async fn upload(&self, local: &Path, remote: &str) -> ConnectionResult<()> {
        self.scp(
            local.as_os_str().to_os_string(),
            self.remote_spec(remote).into(),
        )
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> ConnectionResult<()> {
        self.scp(
            self.remote_spec(remote).into(),
            local.as_os_str().to_os_string(),
        )
        .await
    }

    async fn interactive_shell(&self) -> ConnectionResult<i32> {
        let status = self
            .ssh_command()
            .arg("-t")
            .arg(self.destination())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}
