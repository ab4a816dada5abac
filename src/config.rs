//! Configuration module for Broker
//!
//! Settings are resolved once into an immutable snapshot, layered as:
//! - Built-in defaults
//! - Settings file (`broker_settings.{yaml,yml,toml,json}` in the broker directory)
//! - Environment variables (`BROKER_` prefix, `__` separates nesting)
//! - Dotted overrides (scenario `config.settings`, CLI `--config`)
//!
//! Layers are merged as JSON trees before deserializing, so a later layer only
//! needs to name the keys it changes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::retry::RetryPolicy;
use crate::error::{Error, Result};

/// Environment variable naming the broker working directory.
pub const BROKER_DIRECTORY_ENV: &str = "BROKER_DIRECTORY";
/// Environment variable naming an explicit settings file.
pub const SETTINGS_FILE_ENV: &str = "BROKER_SETTINGS_FILE";
const ENV_PREFIX: &str = "BROKER_";
const SETTINGS_FILE_NAMES: [&str; 4] = [
    "broker_settings.yaml",
    "broker_settings.yml",
    "broker_settings.toml",
    "broker_settings.json",
];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Working directory holding the inventory, logs and scenarios
    pub broker_directory: PathBuf,

    /// Inventory file override (default: `<broker_directory>/inventory.yaml`)
    pub inventory_path: Option<PathBuf>,

    /// Upper bound on parallel provider/session workers (None: one per item)
    pub thread_limit: Option<usize>,

    /// Provider used when neither a provider nor a nick resolves one
    pub default_provider: Option<String>,

    /// How long to wait for the inventory lock before giving up
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Remote session settings
    pub ssh: SshSettings,

    /// Logging settings
    pub logging: LoggingSettings,

    /// Named bundles of checkout arguments
    pub nicks: IndexMap<String, Map<String, Value>>,

    /// Per-provider settings and instances
    pub providers: IndexMap<String, ProviderSettings>,

    /// Column name to field expression used when listing the inventory
    pub inventory_fields: IndexMap<String, String>,

    /// Field expression used for the short inventory listing
    pub inventory_list_vars: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut inventory_fields = IndexMap::new();
        inventory_fields.insert("Host".to_string(), "hostname | name".to_string());
        inventory_fields.insert("Provider".to_string(), "_broker_provider".to_string());
        Self {
            broker_directory: default_broker_directory(),
            inventory_path: None,
            thread_limit: None,
            default_provider: None,
            lock_timeout: Duration::from_secs(30),
            ssh: SshSettings::default(),
            logging: LoggingSettings::default(),
            nicks: IndexMap::new(),
            providers: IndexMap::new(),
            inventory_fields,
            inventory_list_vars: "hostname | name".to_string(),
        }
    }
}

/// Which session transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// System `ssh`/`scp`/`sftp` executables
    #[default]
    Openssh,
    /// Run everything on the control node
    Local,
}

/// Remote session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Transport backend
    pub backend: SessionBackend,

    /// Login user
    pub username: String,

    /// SSH port
    pub port: u16,

    /// Private key file
    pub key_filename: Option<PathBuf>,

    /// Connection establishment timeout
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Default per-command timeout (None: unbounded)
    #[serde(with = "humantime_serde")]
    pub command_timeout: Option<Duration>,

    /// Connection retry policy
    pub retry: RetryPolicy,

    /// `ssh` executable
    pub ssh_executable: String,

    /// `scp` executable
    pub scp_executable: String,

    /// Extra arguments passed to every ssh/scp invocation
    pub extra_args: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            username: "root".to_string(),
            port: 22,
            key_filename: None,
            connection_timeout: Duration::from_secs(60),
            command_timeout: None,
            retry: RetryPolicy::default(),
            ssh_executable: "ssh".to_string(),
            scp_executable: "scp".to_string(),
            extra_args: vec![
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Console log level
    pub console_level: String,

    /// Log file level
    pub file_level: String,

    /// Log file override (default: `<broker_directory>/logs/broker.log`)
    pub log_path: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file_level: "debug".to_string(),
            log_path: None,
        }
    }
}

/// Settings for one provider: named instances plus shared settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Instance name to instance settings
    pub instances: IndexMap<String, Map<String, Value>>,

    /// Settings shared by every instance
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ProviderSettings {
    /// Resolve an instance: the named one, else the one flagged `default: true`,
    /// else the only one. Instance settings are layered over the shared ones.
    pub fn resolve_instance(
        &self,
        name: Option<&str>,
    ) -> Result<Option<(String, Map<String, Value>)>> {
        let chosen = match name {
            Some(name) => match self.instances.get_key_value(name) {
                Some(entry) => Some(entry),
                None => {
                    return Err(Error::Configuration(format!(
                        "unknown provider instance '{name}'"
                    )))
                }
            },
            None => self
                .instances
                .iter()
                .find(|(_, settings)| {
                    settings.get("default").and_then(Value::as_bool) == Some(true)
                })
                .or_else(|| {
                    if self.instances.len() == 1 {
                        self.instances.iter().next()
                    } else {
                        None
                    }
                }),
        };

        Ok(chosen.map(|(instance, overrides)| {
            let mut merged = self.settings.clone();
            for (key, value) in overrides {
                if key != "default" {
                    merged.insert(key.clone(), value.clone());
                }
            }
            (instance.clone(), merged)
        }))
    }
}

/// Broker directory from `BROKER_DIRECTORY`, else `~/.broker`.
pub fn default_broker_directory() -> PathBuf {
    if let Ok(dir) = std::env::var(BROKER_DIRECTORY_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".broker")
}

impl Config {
    /// Load configuration from all sources
    pub fn load(settings_path: Option<&Path>) -> Result<Self> {
        let defaults = Config::default();
        let mut tree = serde_json::to_value(&defaults)?;

        let explicit = settings_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(SETTINGS_FILE_ENV).ok().map(PathBuf::from));
        if let Some(path) = Self::settings_file(explicit, &defaults.broker_directory)? {
            tracing::debug!("Loading settings from {}", path.display());
            merge_values(&mut tree, Self::read_settings_file(&path)?);
        }

        apply_env_overrides(&mut tree, std::env::vars());

        serde_json::from_value(tree).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Find the settings file to read, if any.
    fn settings_file(explicit: Option<PathBuf>, directory: &Path) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Configuration(format!(
                    "settings file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }
        Ok(SETTINGS_FILE_NAMES
            .iter()
            .map(|name| directory.join(name))
            .find(|path| path.exists()))
    }

    /// Parse a settings file into a JSON tree, choosing the format by extension.
    fn read_settings_file(path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let value = match extension {
            "toml" => serde_json::to_value(toml::from_str::<toml::Value>(&content)?)?,
            "json" => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str::<Option<Value>>(&content)?.unwrap_or(Value::Null),
        };
        match value {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::Object(_) => Ok(value),
            _ => Err(Error::Configuration(format!(
                "settings file {} must contain a mapping",
                path.display()
            ))),
        }
    }

    /// Derive a new snapshot with dotted-path overrides applied
    /// (`ssh.port`, `providers.TestProvider.prefix`, ...).
    pub fn with_overrides<'a, I>(&self, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut tree = serde_json::to_value(self)?;
        for (path, value) in overrides {
            set_path(&mut tree, &split_dotted(path), value.clone());
        }
        serde_json::from_value(tree).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Derive a new snapshot with a nested settings mapping merged in.
    pub fn with_settings(&self, settings: &Value) -> Result<Self> {
        let mut tree = serde_json::to_value(self)?;
        merge_values(&mut tree, settings.clone());
        serde_json::from_value(tree).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Effective inventory file.
    pub fn inventory_file(&self) -> PathBuf {
        self.inventory_path
            .clone()
            .unwrap_or_else(|| self.broker_directory.join("inventory.yaml"))
    }

    /// Effective log file.
    pub fn log_file(&self) -> PathBuf {
        self.logging
            .log_path
            .clone()
            .unwrap_or_else(|| self.broker_directory.join("logs").join("broker.log"))
    }

    /// Directory searched for scenario documents.
    pub fn scenarios_directory(&self) -> PathBuf {
        self.broker_directory.join("scenarios")
    }

    /// Worker pool bound for `items` parallel units of work.
    pub fn worker_limit(&self, items: usize) -> usize {
        match self.thread_limit {
            Some(limit) if limit > 0 => limit.min(items.max(1)),
            _ => items.max(1),
        }
    }
}

/// Apply `BROKER_*` environment overrides to a settings tree.
///
/// `BROKER_SSH__PORT=2222` sets `ssh.port`; values are parsed as YAML scalars
/// so numbers and booleans keep their type.
pub fn apply_env_overrides<I>(tree: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in vars {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if key == BROKER_DIRECTORY_ENV || key == SETTINGS_FILE_ENV || name.is_empty() {
            continue;
        }
        let path: Vec<String> = name.split("__").map(str::to_lowercase).collect();
        let value = serde_yaml::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
        set_path(tree, &path, value);
    }
}

fn split_dotted(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Set a nested value, creating intermediate mappings as needed.
pub(crate) fn set_path(tree: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = tree;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else { return };
        cursor = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.clone(), value);
    }
}

/// Recursively merge `overlay` into `base`; overlay wins on conflicts and
/// nested mappings are merged key by key. Null overlay values are ignored.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
