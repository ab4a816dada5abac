//! Shared test utilities and fixtures for the Broker test suite.
//!
//! This module provides:
//! - A temporary broker directory with a matching `Config`
//! - A recording session factory standing in for SSH
//! - Scenario file helpers
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tempfile::TempDir;

use broker::config::Config;
use broker::connection::retry::RetryPolicy;
use broker::connection::{
    CommandResult, ConnectionError, ConnectionResult, Session, SessionFactory,
};
use broker::inventory::{HostRecord, InventoryStore};
use broker::lifecycle::Broker;
use broker::providers::{Args, ProviderRegistry};

// ============================================================================
// Broker Directory
// ============================================================================

/// A throwaway broker directory and the settings pointing at it
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Arc<Config>,
}

impl TestEnv {
    /// Empty broker directory; the test provider is the default
    pub fn new() -> Self {
        Self::with_settings(Value::Null)
    }

    /// Broker directory with extra settings layered on top
    /// (e.g. `json!({"providers": {"TestProvider": {"fail_on": [2]}}})`)
    pub fn with_settings(settings: Value) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let base = Config {
            broker_directory: dir.path().to_path_buf(),
            default_provider: Some("TestProvider".to_string()),
            lock_timeout: std::time::Duration::from_secs(5),
            ..Config::default()
        };
        let config = if settings.is_null() {
            base
        } else {
            base.with_settings(&settings).expect("layer settings")
        };
        Self {
            dir,
            config: Arc::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Broker with the built-in providers and `sessions` as transport
    pub fn broker_with(&self, sessions: Arc<dyn SessionFactory>) -> Broker {
        Broker::from_parts(
            Arc::clone(&self.config),
            ProviderRegistry::with_builtins(Arc::clone(&self.config)),
            InventoryStore::from_config(&self.config),
            sessions,
        )
    }

    pub fn broker(&self) -> Broker {
        self.broker_with(Arc::new(RecordingSessions::new()))
    }

    /// Hosts currently in the inventory file
    pub fn stored_hosts(&self) -> Vec<HostRecord> {
        InventoryStore::from_config(&self.config)
            .load()
            .expect("load inventory")
    }

    /// Write a scenario into `<broker_directory>/scenarios/<name>.yaml`
    pub fn write_scenario(&self, name: &str, yaml: &str) -> PathBuf {
        let directory = self.config.scenarios_directory();
        std::fs::create_dir_all(&directory).expect("create scenarios dir");
        let path = directory.join(format!("{name}.yaml"));
        std::fs::write(&path, yaml).expect("write scenario");
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Build provider arguments from a `json!` mapping
pub fn args(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a mapping, got {other}"),
    }
}

// ============================================================================
// Recording Sessions
// ============================================================================

/// Everything the mock transport was asked to do
#[derive(Debug, Default)]
pub struct SessionLog {
    pub commands: Vec<(String, String)>,
    pub uploads: Vec<(String, PathBuf, String)>,
    pub downloads: Vec<(String, String, PathBuf)>,
}

/// Session factory that never touches the network.
///
/// Commands echo back `ran: <command>` with status 0, except `false`, which
/// exits 1. Hosts listed as unreachable fail to connect.
#[derive(Debug, Clone, Default)]
pub struct RecordingSessions {
    log: Arc<RwLock<SessionLog>>,
    unreachable: Arc<RwLock<HashSet<String>>>,
}

impl RecordingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections to `host` fail
    pub fn set_unreachable(&self, host: impl Into<String>) {
        self.unreachable.write().insert(host.into());
    }

    /// `(host, command)` pairs in execution order
    pub fn commands(&self) -> Vec<(String, String)> {
        self.log.read().commands.clone()
    }

    pub fn uploads(&self) -> Vec<(String, PathBuf, String)> {
        self.log.read().uploads.clone()
    }

    pub fn downloads(&self) -> Vec<(String, String, PathBuf)> {
        self.log.read().downloads.clone()
    }
}

impl SessionFactory for RecordingSessions {
    fn open(&self, host: &HostRecord) -> ConnectionResult<Arc<dyn Session>> {
        Ok(Arc::new(RecordingSession {
            host: host.identity().to_string(),
            log: Arc::clone(&self.log),
            reachable: !self.unreachable.read().contains(host.identity()),
        }))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        }
    }
}

struct RecordingSession {
    host: String,
    log: Arc<RwLock<SessionLog>>,
    reachable: bool,
}

#[async_trait]
impl Session for RecordingSession {
    fn hostname(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(ConnectionError::connection_failed(
                &self.host,
                "no route to host",
            ))
        }
    }

    async fn execute(&self, command: &str) -> ConnectionResult<CommandResult> {
        self.log
            .write()
            .commands
            .push((self.host.clone(), command.to_string()));
        if command == "false" {
            return Ok(CommandResult::new(1, "", ""));
        }
        Ok(CommandResult::new(0, format!("ran: {command}"), ""))
    }

    async fn upload(&self, local: &Path, remote: &str) -> ConnectionResult<()> {
        self.log
            .write()
            .uploads
            .push((self.host.clone(), local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> ConnectionResult<()> {
        self.log
            .write()
            .downloads
            .push((self.host.clone(), remote.to_string(), local.to_path_buf()));
        Ok(())
    }

    async fn interactive_shell(&self) -> ConnectionResult<i32> {
        Ok(0)
    }
}
