//! Provider capability interface and registry.
//!
//! A provider is a backend that creates, releases and describes remote
//! resources. The core never depends on a concrete backend: every provider
//! implements [`Provider`], declares the arguments it accepts, and reports
//! unsupported capabilities through a typed [`ProviderError::Unsupported`]
//! instead of failing by omission.
//!
//! The [`ProviderRegistry`] is the closed set of providers this build knows
//! about. It decides which provider a request is for, validates the request's
//! arguments against that provider's schema, and hands out one shared
//! instance per `Name::instance`.

pub mod test_provider;

pub use test_provider::TestProvider;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{merge_values, Config};
use crate::error::{Error, Result};
use crate::inventory::HostRecord;

/// Provider arguments: a JSON mapping
pub type Args = Map<String, Value>;

/// Keys the core consumes itself; never forwarded to a provider
pub const RESERVED_ARGS: [&str; 7] = [
    "provider",
    ARGS_FILE,
    "nick",
    "count",
    "_count",
    "artifacts",
    "background",
];

/// Argument naming a JSON or YAML file of further arguments
pub const ARGS_FILE: &str = "args_file";

/// Errors a provider can report
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend rejected or failed the request
    #[error("Provider '{provider}' failed: {message}")]
    Rejected {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// The provider does not implement this capability
    #[error("Provider '{provider}' does not support '{operation}'")]
    Unsupported {
        /// Provider name
        provider: String,
        /// Operation name
        operation: String,
    },

    /// Arguments do not fit the provider's schema
    #[error("Invalid arguments for provider '{provider}': {message}")]
    InvalidArguments {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// No provider with this name is registered
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    /// Provider settings are missing or invalid
    #[error("Provider '{provider}' is misconfigured: {message}")]
    Configuration {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },
}

impl ProviderError {
    /// Creates a new rejection.
    pub fn rejected(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a new unsupported-capability error.
    pub fn unsupported(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            operation: operation.into(),
        }
    }
}

/// Result type for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// One accepted argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgumentSpec {
    /// Argument key
    pub name: String,
    /// Help text
    pub help: String,
    /// Must be present
    pub required: bool,
    /// Presence of this argument selects the provider
    pub selects: bool,
}

impl ArgumentSpec {
    /// Optional argument
    pub fn optional(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            required: false,
            selects: false,
        }
    }

    /// Required argument
    pub fn required(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            required: true,
            ..Self::optional(name, help)
        }
    }

    /// Argument whose presence routes a request to this provider
    pub fn selecting(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            selects: true,
            ..Self::optional(name, help)
        }
    }
}

/// Optional capabilities a provider advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Lease extension
    pub extend: bool,
    /// Non-checkout actions
    pub execute: bool,
    /// Reporting its own host list for sync
    pub inventory: bool,
}

/// Outcome of a checkin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The provider released the resource
    Released,
    /// The provider no longer knew the resource
    AlreadyReleased,
}

/// Result of `execute`: a final result plus the outputs of nested calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutput {
    /// The provider's result
    pub result: Value,
    /// Outputs of nested calls, oldest first
    pub artifacts: Vec<Value>,
}

/// Uniform operation set every backend implements
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (`TestProvider`)
    fn name(&self) -> &str;

    /// Configured instance, if the provider has instances
    fn instance(&self) -> Option<&str>;

    /// Accepted-argument schema
    fn arguments(&self) -> Vec<ArgumentSpec>;

    /// Whether arguments outside the schema are forwarded instead of rejected
    fn accepts_extra_arguments(&self) -> bool {
        false
    }

    /// Optional capabilities
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Acquire one resource
    async fn checkout(&self, args: &Args) -> ProviderResult<HostRecord>;

    /// Release one resource
    async fn checkin(&self, host: &HostRecord) -> ProviderResult<Release>;

    /// Extend a resource's lease
    async fn extend(&self, _host: &HostRecord, _args: &Args) -> ProviderResult<bool> {
        Err(ProviderError::unsupported(self.name(), "extend"))
    }

    /// Run a non-checkout action
    async fn execute(&self, _args: &Args) -> ProviderResult<ExecuteOutput> {
        Err(ProviderError::unsupported(self.name(), "execute"))
    }

    /// Describe the provider or answer a query
    async fn info(&self, query: &Args) -> ProviderResult<Value>;

    /// The provider's authoritative host list
    async fn inventory(&self, _extra: Option<&str>) -> ProviderResult<Vec<HostRecord>> {
        Err(ProviderError::unsupported(self.name(), "inventory"))
    }
}

impl fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name())
            .field("instance", &self.instance())
            .finish()
    }
}

/// `Name`, `Name::instance`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderRef {
    /// Provider name
    pub name: String,
    /// Instance name
    pub instance: Option<String>,
}

impl ProviderRef {
    /// Parse `Name` or `Name::instance`
    pub fn parse(spec: &str) -> Self {
        match spec.split_once("::") {
            Some((name, instance)) if !instance.is_empty() => Self {
                name: name.trim().to_string(),
                instance: Some(instance.trim().to_string()),
            },
            _ => Self {
                name: spec.trim().trim_end_matches("::").to_string(),
                instance: None,
            },
        }
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}::{instance}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

type Constructor =
    Arc<dyn Fn(Option<String>, Args) -> ProviderResult<Arc<dyn Provider>> + Send + Sync>;

struct RegistryEntry {
    arguments: Vec<ArgumentSpec>,
    construct: Constructor,
}

/// The set of providers known to this build
pub struct ProviderRegistry {
    config: Arc<Config>,
    entries: IndexMap<String, RegistryEntry>,
    instances: Mutex<HashMap<ProviderRef, Arc<dyn Provider>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Registry with no providers
    pub fn empty(config: Arc<Config>) -> Self {
        Self {
            config,
            entries: IndexMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with every built-in provider
    pub fn with_builtins(config: Arc<Config>) -> Self {
        let mut registry = Self::empty(config);
        registry.register(
            TestProvider::NAME,
            TestProvider::argument_specs(),
            |instance, settings| {
                Ok(Arc::new(TestProvider::new(instance, &settings)) as Arc<dyn Provider>)
            },
        );
        registry
    }

    /// Register a provider constructor
    pub fn register<F>(&mut self, name: &str, arguments: Vec<ArgumentSpec>, construct: F)
    where
        F: Fn(Option<String>, Args) -> ProviderResult<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            RegistryEntry {
                arguments,
                construct: Arc::new(construct),
            },
        );
    }

    /// Register an already-built provider; it is returned for its own
    /// `Name::instance` and for plain `Name`
    pub fn register_instance(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        let shared = Arc::clone(&provider);
        self.register(&name, provider.arguments(), move |_, _| Ok(Arc::clone(&shared)));
        let key = ProviderRef {
            name,
            instance: provider.instance().map(str::to_string),
        };
        self.instances.lock().insert(key, provider);
    }

    /// Registered provider names
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Accepted arguments of a registered provider
    pub fn arguments(&self, name: &str) -> Option<&[ArgumentSpec]> {
        self.entries.get(name).map(|e| e.arguments.as_slice())
    }

    /// Configuration snapshot this registry builds providers from
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Shared provider instance for `Name` or `Name::instance`
    pub fn get(&self, spec: &ProviderRef) -> Result<Arc<dyn Provider>> {
        let entry = self
            .entries
            .get(&spec.name)
            .ok_or_else(|| ProviderError::UnknownProvider(spec.name.clone()))?;

        let resolved = match self.config.providers.get(&spec.name) {
            Some(settings) => settings.resolve_instance(spec.instance.as_deref())?,
            None => None,
        };
        let (instance, settings) = match resolved {
            Some((instance, settings)) => (Some(instance), settings),
            None => (
                spec.instance.clone(),
                self.config
                    .providers
                    .get(&spec.name)
                    .map(|p| p.settings.clone())
                    .unwrap_or_default(),
            ),
        };
        let key = ProviderRef {
            name: spec.name.clone(),
            instance,
        };

        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&key) {
            return Ok(Arc::clone(existing));
        }
        debug!(provider = %key, "Instantiating provider");
        let provider = (entry.construct)(key.instance.clone(), settings)?;
        instances.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// The provider owning a stored host
    pub fn for_host(&self, host: &HostRecord) -> Result<Arc<dyn Provider>> {
        let name = host.provider.clone().ok_or_else(|| {
            Error::validation(format!("host '{}' has no owning provider", host.identity()))
        })?;
        self.get(&ProviderRef {
            name,
            instance: host.provider_instance.clone(),
        })
    }

    /// Choose the provider for a request and return it with validated,
    /// provider-ready arguments.
    ///
    /// Order: explicit `provider`, the nick's provider, the first provider
    /// declaring a selecting argument present in the request, then the
    /// configured default.
    pub fn resolve(&self, args: &Args) -> Result<(Arc<dyn Provider>, Args)> {
        let merged = self.apply_nick(args)?;

        let spec = if let Some(explicit) = merged.get("provider").and_then(Value::as_str) {
            ProviderRef::parse(explicit)
        } else if let Some(name) = self.select_by_arguments(&merged) {
            ProviderRef::parse(name)
        } else if let Some(default) = &self.config.default_provider {
            ProviderRef::parse(default)
        } else {
            return Err(Error::validation(
                "could not determine a provider: \
                 pass 'provider', a nick, or a provider-specific argument",
            ));
        };

        let provider = self.get(&spec)?;
        let cleaned = strip_reserved(&merged);
        validate_arguments(provider.as_ref(), &cleaned)?;
        Ok((provider, cleaned))
    }

    /// Load file arguments, then layer a nick's bundle under the explicit
    /// arguments
    pub fn apply_nick(&self, args: &Args) -> Result<Args> {
        let args = resolve_file_args(args)?;
        let Some(nick) = args.get("nick").and_then(Value::as_str) else {
            return Ok(args);
        };
        let bundle = self
            .config
            .nicks
            .get(nick)
            .ok_or_else(|| Error::validation(format!("unknown nick '{nick}'")))?;
        let mut merged = Value::Object(bundle.clone());
        merge_values(&mut merged, Value::Object(args.clone()));
        match merged {
            Value::Object(map) => Ok(map),
            _ => Ok(args),
        }
    }

    fn select_by_arguments(&self, args: &Args) -> Option<&str> {
        self.entries.iter().find_map(|(name, entry)| {
            entry
                .arguments
                .iter()
                .any(|spec| spec.selects && args.contains_key(&spec.name))
                .then_some(name.as_str())
        })
    }
}

/// Expand file-backed arguments.
///
/// `args_file` is loaded first and its mapping (or every mapping of a list)
/// becomes the base; explicit arguments override it. Any other value that
/// names a JSON or YAML file is replaced by the file's contents, or kept as
/// given when nothing loads from it.
pub fn resolve_file_args(args: &Args) -> Result<Args> {
    let mut resolved = Args::new();
    if let Some(source) = args.get(ARGS_FILE) {
        let path = file_reference(source).ok_or_else(|| {
            Error::validation(format!("{ARGS_FILE} must name a JSON or YAML file, got {source}"))
        })?;
        match load_structured_file(path)? {
            Some(Value::Object(map)) => resolved.extend(map),
            Some(Value::Array(items)) => {
                for item in items {
                    let Value::Object(map) = item else {
                        return Err(Error::validation(format!(
                            "{} must hold mappings, found {item}",
                            path.display()
                        )));
                    };
                    resolved.extend(map);
                }
            }
            Some(other) => {
                return Err(Error::validation(format!(
                    "{} must hold a mapping or a list of mappings, found {other}",
                    path.display()
                )))
            }
            None => {
                return Err(Error::validation(format!(
                    "no data loaded from {}",
                    path.display()
                )))
            }
        }
    }
    for (key, value) in args {
        if key == ARGS_FILE {
            continue;
        }
        let loaded = match file_reference(value) {
            Some(path) => load_structured_file(path)?,
            None => None,
        };
        resolved.insert(key.clone(), loaded.unwrap_or_else(|| value.clone()));
    }
    Ok(resolved)
}

fn file_reference(value: &Value) -> Option<&Path> {
    let text = value.as_str()?;
    ["json", "yaml", ".yml"]
        .iter()
        .any(|suffix| text.ends_with(suffix))
        .then(|| Path::new(text))
}

/// Contents of a JSON or YAML file; `None` when the file is missing or empty
fn load_structured_file(path: &Path) -> Result<Option<Value>> {
    if !path.is_file() {
        warn!(path = %path.display(), "Argument file not found");
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value: Option<Value> = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text)
            .map_err(|e| Error::validation(format!("{}: {e}", path.display())))?
    } else {
        serde_yaml::from_str(&text)
            .map_err(|e| Error::validation(format!("{}: {e}", path.display())))?
    };
    Ok(value.filter(|value| match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(text) => !text.is_empty(),
        _ => true,
    }))
}

/// Drop the keys the core consumes
pub fn strip_reserved(args: &Args) -> Args {
    args.iter()
        .filter(|(key, _)| !RESERVED_ARGS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Check `args` against the provider's schema
pub fn validate_arguments(provider: &dyn Provider, args: &Args) -> ProviderResult<()> {
    let specs = provider.arguments();
    if let Some(missing) = specs
        .iter()
        .find(|spec| spec.required && !args.contains_key(&spec.name))
    {
        return Err(ProviderError::InvalidArguments {
            provider: provider.name().to_string(),
            message: format!("missing required argument '{}'", missing.name),
        });
    }
    if !provider.accepts_extra_arguments() {
        if let Some(unknown) = args
            .keys()
            .find(|key| !specs.iter().any(|spec| &spec.name == *key))
        {
            return Err(ProviderError::InvalidArguments {
                provider: provider.name().to_string(),
                message: format!("unknown argument '{unknown}'"),
            });
        }
    }
    Ok(())
}
