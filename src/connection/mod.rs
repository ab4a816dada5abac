//! Remote session layer for host communication.
//!
//! Every transport implements the [`Session`] trait: run a command, move a
//! file in either direction, or hand the terminal over to an interactive
//! shell. The transport itself is swappable and selected by the `ssh.backend`
//! setting; what the core owns is the policy around it:
//!
//! - connection attempts go through [`retry::retry`] with a small bounded
//!   number of attempts, and only transport-level failures are retried
//! - every command runs under an optional per-call timeout, and exceeding it
//!   fails that host only
//!
//! # Supported Transports
//!
//! - **OpenSSH**: drives the system `ssh`/`scp` executables
//! - **Local**: runs commands on the control node, used for hosts that live
//!   on the local machine and in tests

/// Local execution session implementation.
#[cfg(feature = "local")]
pub mod local;

/// Session implementation backed by the OpenSSH client executables.
#[cfg(feature = "openssh")]
pub mod openssh;

/// Connection retry policy.
pub mod retry;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{SessionBackend, SshSettings};
use crate::inventory::HostRecord;
use retry::RetryPolicy;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish a connection to the host.
    #[error("Connection to '{host}' failed: {message}")]
    ConnectionFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// Authentication was rejected by the remote host.
    #[error("Authentication to '{host}' failed: {message}")]
    AuthenticationFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// The operation did not finish within its timeout.
    #[error("Operation on '{host}' timed out after {seconds} seconds")]
    Timeout {
        /// Target host
        host: String,
        /// Timeout in seconds
        seconds: u64,
    },

    /// Command could not be started (not a non-zero exit code).
    #[error("Command execution on '{host}' failed: {message}")]
    ExecutionFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// File upload or download failed.
    #[error("File transfer with '{host}' failed: {message}")]
    TransferFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// Session settings are invalid or incomplete.
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// I/O error during session operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Creates a new connection failure.
    pub fn connection_failed(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new transfer failure.
    pub fn transfer_failed(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransferFailed {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Transport-level failures eligible for bounded retry.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed { .. } | ConnectionError::Timeout { .. }
        )
    }
}

/// Result type for session operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result of a command execution
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandResult {
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Exit status of the command (0 typically indicates success).
    pub status: i32,
}

impl CommandResult {
    /// Create a new command result
    pub fn new(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status,
        }
    }

    /// `true` if the command exited with status 0
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Connection parameters for one host, resolved from settings and the record.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    /// Address to connect to
    pub hostname: String,
    /// Login user
    pub username: String,
    /// SSH port
    pub port: u16,
    /// Private key file
    pub key_filename: Option<std::path::PathBuf>,
}

impl SessionTarget {
    /// Resolve the target for a host record; `username`, `port` and
    /// `key_filename` attributes on the record override the settings.
    pub fn resolve(host: &HostRecord, settings: &SshSettings) -> ConnectionResult<Self> {
        let hostname = host.hostname.clone().ok_or_else(|| {
            ConnectionError::InvalidConfig(format!("host '{}' has no hostname", host.identity()))
        })?;
        let username = host
            .attribute("username")
            .and_then(|v| v.as_str())
            .map_or_else(|| settings.username.clone(), str::to_string);
        let port = host
            .attribute("port")
            .and_then(serde_json::Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(settings.port);
        let key_filename = host
            .attribute("key_filename")
            .and_then(|v| v.as_str())
            .map(std::path::PathBuf::from)
            .or_else(|| settings.key_filename.clone());
        Ok(Self {
            hostname,
            username,
            port,
            key_filename,
        })
    }
}

/// A command-execution and file-transfer channel to one host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Host this session talks to
    fn hostname(&self) -> &str;

    /// Establish (or re-check) the connection
    async fn connect(&self) -> ConnectionResult<()>;

    /// Execute a command without any timeout
    async fn execute(&self, command: &str) -> ConnectionResult<CommandResult>;

    /// Copy a local file to the host
    async fn upload(&self, local: &Path, remote: &str) -> ConnectionResult<()>;

    /// Copy a file from the host to the local machine
    async fn download(&self, remote: &str, local: &Path) -> ConnectionResult<()>;

    /// Attach the terminal to an interactive shell; returns its exit status
    async fn interactive_shell(&self) -> ConnectionResult<i32>;

    /// Execute a command, failing this host only if it exceeds `timeout`
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> ConnectionResult<CommandResult> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute(command))
                .await
                .map_err(|_| ConnectionError::Timeout {
                    host: self.hostname().to_string(),
                    seconds: limit.as_secs(),
                })?,
            None => self.execute(command).await,
        }
    }
}

/// Opens sessions for host records.
pub trait SessionFactory: Send + Sync {
    /// Build an unconnected session for `host`
    fn open(&self, host: &HostRecord) -> ConnectionResult<Arc<dyn Session>>;

    /// Retry policy applied to `connect`
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Session factory that picks the transport from settings.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    settings: SshSettings,
}

impl TransportFactory {
    /// Create a factory from session settings
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

impl SessionFactory for TransportFactory {
    fn open(&self, host: &HostRecord) -> ConnectionResult<Arc<dyn Session>> {
        let target = SessionTarget::resolve(host, &self.settings)?;
        match self.settings.backend {
            #[cfg(feature = "openssh")]
            SessionBackend::Openssh => Ok(Arc::new(openssh::OpensshSession::new(
                target,
                self.settings.clone(),
            )?)),
            #[cfg(feature = "local")]
            SessionBackend::Local => Ok(Arc::new(local::LocalSession::new(target.hostname))),
            #[allow(unreachable_patterns)]
            other => Err(ConnectionError::InvalidConfig(format!(
                "session backend {other:?} is not compiled in"
            ))),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry.clone()
    }
}

/// Open a session and connect it under the factory's retry policy.
pub async fn establish(
    factory: &dyn SessionFactory,
    host: &HostRecord,
) -> ConnectionResult<Arc<dyn Session>> {
    let session = factory.open(host)?;
    let policy = factory.retry_policy();
    retry::retry(&policy, || {
        let session = Arc::clone(&session);
        async move { session.connect().await }
    })
    .await?;
    Ok(session)
}
