//! Error types for Broker.
//!
//! Every layer has its own error enum (`InventoryError`, `ProviderError`,
//! `ConnectionError`); this module folds them into the taxonomy surfaced to
//! callers and maps each kind to a stable process exit code.

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::inventory::{FilterError, HostRecord, InventoryError};
use crate::providers::ProviderError;
use crate::scenario::ScenarioError;

/// Result type alias for Broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A single host's failure inside a parallel fan-out.
#[derive(Debug)]
pub struct HostFailure {
    /// Host identity (hostname, name, or request label for checkouts)
    pub host: String,
    /// What went wrong
    pub error: Error,
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.host, self.error)
    }
}

/// The main error type for Broker.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller Errors
    // ========================================================================
    /// Malformed scenario, filter, selector or provider arguments.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A selector or filter matched no hosts where at least one was required.
    #[error("Selection error: {0}")]
    Selection(String),

    /// Settings could not be loaded or resolved.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// A provider rejected or failed a request.
    #[error(transparent)]
    Provider(ProviderError),

    /// The chosen provider does not implement the requested capability.
    #[error("Provider '{provider}' does not support '{operation}'")]
    UnsupportedOperation {
        /// Provider name
        provider: String,
        /// Operation that was requested
        operation: String,
    },

    /// Transport-level failure talking to a host.
    #[error(transparent)]
    Connectivity(#[from] ConnectionError),

    /// Some checkouts failed; the acquired hosts are recorded and must be
    /// checked in by the caller.
    #[error(
        "Checkout failed for {} request(s); acquired host(s) requiring checkin: [{}]. Failures: {}",
        .failures.len(),
        acquired_names(.acquired),
        join_failures(.failures)
    )]
    Checkout {
        /// Hosts that were successfully acquired before or alongside the failures
        acquired: Vec<HostRecord>,
        /// Per-request failures
        failures: Vec<HostFailure>,
    },

    /// Some hosts in a fan-out failed while siblings completed.
    #[error("{operation} failed on {} host(s): {}", .failures.len(), join_failures(.failures))]
    HostFailures {
        /// Operation name
        operation: String,
        /// Per-host failures
        failures: Vec<HostFailure>,
    },

    // ========================================================================
    // Store Errors
    // ========================================================================
    /// Inventory store failure (lock timeout, unreadable file).
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    // ========================================================================
    // Scenario Errors
    // ========================================================================
    /// A scenario step failed.
    #[error("Step '{step}' failed: {message}")]
    Scenario {
        /// Step name
        step: String,
        /// Error message
        message: String,
    },

    /// An `exit` action ended the run.
    #[error("Scenario exited with code {code}: {message}")]
    Exit {
        /// Requested exit code
        code: i32,
        /// Exit message
        message: String,
    },

    /// Scenario file could not be found.
    #[error("Scenario not found: {0}")]
    ScenarioNotFound(PathBuf),

    /// Template error.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    // ========================================================================
    // Serialization / IO Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Generic error with source.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

fn acquired_names(hosts: &[HostRecord]) -> String {
    hosts
        .iter()
        .map(HostRecord::identity)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unsupported {
                provider,
                operation,
            } => Error::UnsupportedOperation {
                provider,
                operation,
            },
            ProviderError::InvalidArguments { .. } | ProviderError::UnknownProvider(_) => {
                Error::Validation(err.to_string())
            }
            other => Error::Provider(other),
        }
    }
}

impl From<FilterError> for Error {
    fn from(err: FilterError) -> Self {
        Error::Validation(err.to_string())
    }
}

impl From<ScenarioError> for Error {
    fn from(err: ScenarioError) -> Self {
        match err {
            ScenarioError::NotFound(path) => Error::ScenarioNotFound(path),
            other => Error::Validation(other.to_string()),
        }
    }
}

impl Error {
    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new step failure.
    pub fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scenario {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Hosts acquired by a partially failed checkout, empty for other errors.
    pub fn acquired_hosts(&self) -> &[HostRecord] {
        match self {
            Error::Checkout { acquired, .. } => acquired,
            _ => &[],
        }
    }

    /// Returns true if this error came from the transport and may be retried.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(e) if e.is_connectivity())
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) | Error::ScenarioNotFound(_) => 2,
            Error::Selection(_) => 3,
            Error::Connectivity(_) => 4,
            Error::Provider(_) => 7,
            Error::Configuration(_) => 8,
            Error::UnsupportedOperation { .. } => 9,
            Error::Checkout { .. } => 10,
            Error::Exit { code, .. } => *code,
            Error::HostFailures { failures, .. } => shared_exit_code(failures),
            _ => 1,
        }
    }
}

/// Exit code every failure agrees on, or 1 for a mix
fn shared_exit_code(failures: &[HostFailure]) -> i32 {
    let mut codes = failures.iter().map(|failure| failure.error.exit_code());
    match codes.next() {
        Some(first) if codes.all(|code| code == first) => first,
        _ => 1,
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: f().into(),
            source: Some(Box::new(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::validation("bad").exit_code(), 2);
        assert_eq!(Error::Selection("none".into()).exit_code(), 3);
        assert_eq!(
            Error::Exit {
                code: 42,
                message: "bye".into()
            }
            .exit_code(),
            42
        );
        assert_eq!(Error::step_failed("s", "m").exit_code(), 1);
    }

    #[test]
    fn test_host_failures_share_a_uniform_exit_code() {
        let failure = |host: &str, error: Error| HostFailure {
            host: host.into(),
            error,
        };
        let unsupported = || Error::UnsupportedOperation {
            provider: "Static".into(),
            operation: "extend".into(),
        };
        let uniform = Error::HostFailures {
            operation: "extend".into(),
            failures: vec![failure("a", unsupported()), failure("b", unsupported())],
        };
        assert_eq!(uniform.exit_code(), 9);

        let mixed = Error::HostFailures {
            operation: "extend".into(),
            failures: vec![
                failure("a", unsupported()),
                failure("b", Error::Selection("gone".into())),
            ],
        };
        assert_eq!(mixed.exit_code(), 1);
    }

    #[test]
    fn test_unsupported_provider_error_maps_to_unsupported_operation() {
        let err: Error = ProviderError::Unsupported {
            provider: "Container".into(),
            operation: "extend".into(),
        }
        .into();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert_eq!(err.exit_code(), 9);
    }

    #[test]
    fn test_checkout_error_lists_acquired_hosts() {
        let acquired = vec![
            HostRecord::new("a.example.com"),
            HostRecord::new("b.example.com"),
        ];
        let err = Error::Checkout {
            acquired,
            failures: vec![HostFailure {
                host: "request 3".into(),
                error: Error::validation("boom"),
            }],
        };
        let message = err.to_string();
        assert!(message.contains("a.example.com, b.example.com"));
        assert!(message.contains("request 3"));
        assert_eq!(err.acquired_hosts().len(), 2);
    }

    #[test]
    fn test_context() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        let err = res.context("saving inventory").unwrap_err();
        assert_eq!(err.to_string(), "saving inventory");
    }
}
