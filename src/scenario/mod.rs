//! Scenario runner.
//!
//! A scenario is a YAML document describing an ordered list of steps, each
//! naming one action (checkout, ssh, output, ...). The runner walks the
//! steps in order, keeping:
//!
//! - a memory of every step's status and output, visible to later steps
//!   as `steps.<name>` and `previous_step`
//! - the run's variables, seeded from the document and command line and
//!   extended by `capture`
//! - the *scenario inventory*: hosts acquired by this run, persisted after
//!   every step so a crashed run can still be cleaned up
//!
//! Recovery sequences (`on_error: [...]`) and nested scenarios
//! (`run_scenarios`) recurse into the same machinery.

mod actions;
pub mod document;
pub mod hosts;
pub mod memory;
pub mod template;
pub mod vars;

pub use document::{Action, ScenarioConfig, ScenarioDocument, Step};
pub use memory::{Memory, StepMemory, StepStatus};
pub use template::TemplateEngine;

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::connection::{SessionFactory, TransportFactory};
use crate::error::{Error, Result};
use crate::inventory::{HostRecord, InventoryStore};
use crate::lifecycle::Broker;
use crate::providers::ProviderRegistry;

use document::{LoopFailure, LoopSpec, OnError};
use hosts::{records_from_value, HostReference, HostSource};
use template::bare_expression;

/// Problems with a scenario document itself, found before any step runs
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse scenario {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("template error in {location}: {message}")]
    Template { location: String, message: String },
}

/// Inputs shared by a runner and the sub-scenarios it starts
#[derive(Clone, Default)]
pub struct RunnerOptions {
    /// `--var NAME=VALUE`, coerced to the declared variable types
    pub cli_vars: IndexMap<String, String>,
    /// `--config path=value`, applied to the document's `config` block
    pub cli_config: IndexMap<String, String>,
    /// Session factory override (default: transport from settings)
    pub sessions: Option<Arc<dyn SessionFactory>>,
}

impl fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("cli_vars", &self.cli_vars)
            .field("cli_config", &self.cli_config)
            .field("sessions", &self.sessions.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// How a run ended
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    /// 0 on success, the `exit` action's code, or the failing error's code
    pub exit_code: i32,
    /// Exit message or the error that ended the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub steps: Vec<StepMemory>,
    /// Hosts still held by the run when it ended
    pub hosts: Vec<HostRecord>,
}

impl ScenarioOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Step summary for `scenarios info`
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub action: Action,
}

/// Static description of a scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioInfo {
    pub name: String,
    pub path: PathBuf,
    pub config: ScenarioConfig,
    pub variables: Map<String, Value>,
    pub steps: Vec<StepSummary>,
}

impl ScenarioInfo {
    fn describe(path: &Path, document: &ScenarioDocument) -> Self {
        Self {
            name: scenario_name(path),
            path: path.to_path_buf(),
            config: document.config.clone(),
            variables: document.variables.clone(),
            steps: document
                .steps
                .iter()
                .map(|step| StepSummary {
                    name: step.name.clone(),
                    action: step.action,
                })
                .collect(),
        }
    }
}

/// Executes one scenario document
pub struct ScenarioRunner {
    path: PathBuf,
    name: String,
    document: ScenarioDocument,
    options: RunnerOptions,
    /// Configuration before the document's own settings, handed to children
    base_config: Arc<Config>,
    broker: Broker,
    engine: TemplateEngine,
    variables: Map<String, Value>,
    memory: Memory,
    scenario_hosts: Vec<HostRecord>,
    scenario_store: InventoryStore,
}

impl fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("path", &self.path)
            .field("steps", &self.document.steps.len())
            .field("scenario_hosts", &self.scenario_hosts.len())
            .finish_non_exhaustive()
    }
}

impl ScenarioRunner {
    /// Load, configure and validate a scenario. Nothing runs yet.
    pub fn new(
        path: impl Into<PathBuf>,
        base: Arc<Config>,
        options: RunnerOptions,
    ) -> Result<Self> {
        let path = path.into();
        let mut document = ScenarioDocument::load(&path)?;

        if !options.cli_config.is_empty() {
            let mut tree = serde_json::to_value(&document.config)?;
            vars::apply_config_overrides(&mut tree, &options.cli_config);
            document.config = serde_json::from_value(tree)
                .map_err(|e| Error::validation(format!("invalid scenario config override: {e}")))?;
        }

        let engine = TemplateEngine::new();
        document.validate(&engine)?;

        let config = if document.config.settings.is_empty() {
            Arc::clone(&base)
        } else {
            Arc::new(base.with_settings(&Value::Object(document.config.settings.clone()))?)
        };

        let mut variables = document.variables.clone();
        vars::apply_cli_vars(&mut variables, &options.cli_vars);

        let sessions: Arc<dyn SessionFactory> = match &options.sessions {
            Some(sessions) => Arc::clone(sessions),
            None => Arc::new(TransportFactory::new(config.ssh.clone())),
        };
        let broker = Broker::from_parts(
            Arc::clone(&config),
            ProviderRegistry::with_builtins(Arc::clone(&config)),
            InventoryStore::from_config(&config),
            sessions,
        );

        let name = scenario_name(&path);
        let inventory_path = document.config.inventory_path.as_deref().map_or_else(
            || {
                config
                    .broker_directory
                    .join(format!("scenario_{name}_inventory.yaml"))
            },
            expand_home,
        );
        let scenario_store = InventoryStore::new(inventory_path, config.lock_timeout);

        Ok(Self {
            path,
            name,
            document,
            options,
            base_config: base,
            broker,
            engine,
            variables,
            memory: Memory::new(),
            scenario_hosts: Vec::new(),
            scenario_store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The broker this run acts through
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Where the scenario inventory is persisted
    pub fn inventory_path(&self) -> &Path {
        self.scenario_store.path()
    }

    /// Variables as they currently stand
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn info(&self) -> ScenarioInfo {
        ScenarioInfo::describe(&self.path, &self.document)
    }

    /// Run every step. Step failures end up in the outcome's exit code; only
    /// failures outside the steps (the scenario inventory file) are `Err`.
    #[instrument(skip(self), fields(scenario = %self.name))]
    pub async fn run(&mut self) -> Result<ScenarioOutcome> {
        info!("Starting scenario: {}", self.name);
        self.memory = Memory::new();
        self.scenario_hosts.clear();
        self.scenario_store.clear().await?;

        let steps = self.document.steps.clone();
        let (exit_code, message) = match self.execute_steps(&steps).await {
            Ok(()) => {
                info!("Scenario '{}' completed successfully", self.name);
                (0, None)
            }
            Err(Error::Exit { code, message }) => {
                if code == 0 {
                    info!("Scenario '{}' exited: {message}", self.name);
                } else {
                    warn!("Scenario '{}' exited with code {code}: {message}", self.name);
                }
                (code, Some(message))
            }
            Err(failure) => {
                error!("Scenario '{}' failed: {failure}", self.name);
                (failure.exit_code().max(1), Some(failure.to_string()))
            }
        };

        if !self.scenario_hosts.is_empty() {
            warn!(
                "Scenario '{}' still holds {} host(s), recorded in {}",
                self.name,
                self.scenario_hosts.len(),
                self.scenario_store.path().display()
            );
        }

        Ok(ScenarioOutcome {
            name: self.name.clone(),
            exit_code,
            message,
            steps: self.memory.clone().into_vec(),
            hosts: self.scenario_hosts.clone(),
        })
    }

    fn execute_steps<'a>(&'a mut self, steps: &'a [Step]) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut previous: Option<&str> = None;
            for step in steps {
                let result = self.execute_step(step, previous).await;
                let saved = self.save_scenario_inventory().await;
                result?;
                saved?;
                previous = Some(step.name.as_str());
            }
            Ok(())
        }
        .boxed()
    }

    async fn execute_step(&mut self, step: &Step, previous: Option<&str>) -> Result<()> {
        self.memory.begin(&step.name);
        let context = self.context(&step.name, previous);

        if step.loop_spec.is_none() {
            if let Some(guard) = &step.when {
                match self.engine.evaluate_condition(guard, &context) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Skipping step '{}': condition not met", step.name);
                        self.memory.skip(&step.name);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("Skipping step '{}': condition failed to evaluate: {e}", step.name);
                        self.memory.skip(&step.name);
                        return Ok(());
                    }
                }
            }
        }

        info!("Executing step '{}' ({})", step.name, step.action);
        let outcome = match self.perform(step, &context).await {
            Ok(output) => {
                self.memory.complete(&step.name, output.clone());
                self.capture(step, output, &context)
            }
            Err(e) => Err(e),
        };
        let Err(failure) = outcome else {
            return Ok(());
        };

        if let Error::Exit { code, message } = &failure {
            self.memory
                .complete(&step.name, json!({"return_code": code, "message": message}));
            return Err(failure);
        }

        error!(step = %step.name, "Step '{}' failed: {failure}", step.name);
        self.memory.fail(&step.name, &failure);

        match &step.on_error {
            Some(OnError::Continue) => {
                warn!("Continuing past failed step '{}'", step.name);
                Ok(())
            }
            Some(OnError::Steps(recovery)) => {
                info!("Running {} recovery step(s) for '{}'", recovery.len(), step.name);
                self.execute_steps(recovery).await
            }
            None if step.exit_on_error.unwrap_or(true) => Err(failure),
            None => {
                warn!("Continuing past failed step '{}' (exit_on_error: false)", step.name);
                Ok(())
            }
        }
    }

    async fn perform(&mut self, step: &Step, context: &Value) -> Result<Value> {
        let hosts = match &step.with {
            Some(with) => Some(self.resolve_hosts(&with.hosts, context)?),
            None => None,
        };
        match &step.loop_spec {
            Some(spec) => self.run_loop(step, spec, hosts, context).await,
            None => {
                let arguments = self.engine.render_map(&step.arguments, context)?;
                self.dispatch(step, arguments, hosts, step.parallel).await
            }
        }
    }

    /// Run a looped step once per item, sequentially.
    ///
    /// The output maps each iteration's key to its result: the item itself
    /// for scalars, the first element for `key, value` pairs, the index
    /// otherwise, or `capture.key` when given.
    async fn run_loop(
        &mut self,
        step: &Step,
        spec: &LoopSpec,
        hosts: Option<Vec<HostRecord>>,
        context: &Value,
    ) -> Result<Value> {
        let items = self.loop_items(&spec.iterable, context)?;
        let names = spec.variable_names();
        let key_expression = step.capture.as_ref().and_then(|c| c.key.as_deref());
        debug!("Looping '{}' over {} item(s)", step.name, items.len());

        let mut output = Map::new();
        for (index, item) in items.into_iter().enumerate() {
            let mut scope = context.clone();
            let default_key = bind_loop_item(&mut scope, &names, item, index)
                .map_err(|message| Error::step_failed(&step.name, message))?;

            if let Some(guard) = &step.when {
                match self.engine.evaluate_condition(guard, &scope) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("Skipping iteration {default_key} of '{}'", step.name);
                        continue;
                    }
                    Err(e) => {
                        warn!("Skipping iteration {default_key} of '{}': {e}", step.name);
                        continue;
                    }
                }
            }

            let attempt = match self.engine.render_map(&step.arguments, &scope) {
                Ok(arguments) => self.dispatch(step, arguments, hosts.clone(), false).await,
                Err(e) => Err(e.into()),
            };

            match attempt {
                Ok(result) => {
                    let key = match key_expression {
                        Some(expression) => {
                            if let Value::Object(map) = &mut scope {
                                map.insert("result".to_string(), result.clone());
                            }
                            let rendered =
                                self.engine.evaluate(bare_expression(expression), &scope)?;
                            key_text(&rendered)
                        }
                        None => default_key,
                    };
                    output.insert(key, result);
                }
                Err(exit @ Error::Exit { .. }) => return Err(exit),
                Err(failure) if spec.on_error == LoopFailure::Continue => {
                    warn!("Iteration {default_key} of '{}' failed: {failure}", step.name);
                    output.insert(
                        default_key,
                        json!({"status": "failed", "error": failure.to_string()}),
                    );
                }
                Err(failure) => return Err(failure),
            }
        }
        Ok(Value::Object(output))
    }

    fn loop_items(&self, iterable: &str, context: &Value) -> Result<Vec<Value>> {
        if let Some(reference) = HostReference::parse(iterable) {
            return Ok(self
                .referenced_hosts(&reference)?
                .iter()
                .map(HostRecord::to_value)
                .collect());
        }
        Ok(match self.engine.evaluate(bare_expression(iterable), context)? {
            Value::Array(items) => items,
            Value::Object(map) => map.into_iter().map(|(k, v)| json!([k, v])).collect(),
            Value::Null => Vec::new(),
            scalar => vec![scalar],
        })
    }

    fn capture(&mut self, step: &Step, output: Value, context: &Value) -> Result<()> {
        let Some(capture) = &step.capture else {
            return Ok(());
        };
        let value = match &capture.transform {
            Some(transform) => {
                let mut scope = context.clone();
                if let Value::Object(map) = &mut scope {
                    map.insert(
                        "step".to_string(),
                        json!({
                            "name": step.name,
                            "output": output,
                            "status": StepStatus::Completed,
                        }),
                    );
                }
                self.engine.render(transform, &scope)?
            }
            None => output,
        };
        debug!("Captured '{}' from step '{}'", capture.into, step.name);
        self.variables.insert(capture.into.clone(), value);
        Ok(())
    }

    /// Template context: step bookkeeping first, variables on top
    fn context(&self, current: &str, previous: Option<&str>) -> Value {
        let mut context = Map::new();
        context.insert(
            "step".to_string(),
            self.memory.get(current).map_or(Value::Null, StepMemory::to_value),
        );
        context.insert(
            "previous_step".to_string(),
            previous
                .and_then(|name| self.memory.get(name))
                .map_or(Value::Null, StepMemory::to_value),
        );
        context.insert("steps".to_string(), self.memory.to_value());
        context.insert(
            "scenario_inventory".to_string(),
            Value::Array(self.scenario_hosts.iter().map(HostRecord::to_value).collect()),
        );
        for (name, value) in &self.variables {
            context.insert(name.clone(), value.clone());
        }
        Value::Object(context)
    }

    fn resolve_hosts(&self, text: &str, context: &Value) -> Result<Vec<HostRecord>> {
        if let Some(reference) = HostReference::parse(text) {
            return self.referenced_hosts(&reference);
        }
        records_from_value(self.engine.render(text, context)?)
    }

    fn referenced_hosts(&self, reference: &HostReference) -> Result<Vec<HostRecord>> {
        let records = match reference.source {
            HostSource::Scenario => self.scenario_hosts.clone(),
            HostSource::Inventory => self.broker.inventory(None)?,
        };
        Ok(reference.apply(&records))
    }

    async fn save_scenario_inventory(&self) -> Result<()> {
        self.scenario_store
            .replace(self.scenario_hosts.clone())
            .await?;
        Ok(())
    }
}

/// Bind one loop item into `scope`, returning its default output key
fn bind_loop_item(
    scope: &mut Value,
    names: &[String],
    item: Value,
    index: usize,
) -> std::result::Result<String, String> {
    let Value::Object(map) = scope else {
        return Err("loop scope is not a mapping".to_string());
    };
    if let [name] = names {
        let key = scalar_key(&item).unwrap_or_else(|| index.to_string());
        map.insert(name.clone(), item);
        return Ok(key);
    }
    match &item {
        Value::Array(parts) if parts.len() >= names.len() => {
            for (name, part) in names.iter().zip(parts) {
                map.insert(name.clone(), part.clone());
            }
            Ok(parts
                .first()
                .and_then(scalar_key)
                .unwrap_or_else(|| index.to_string()))
        }
        other => Err(format!(
            "loop item {other} cannot be unpacked into {} variables",
            names.len()
        )),
    }
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn key_text(value: &Value) -> String {
    scalar_key(value).unwrap_or_else(|| value.to_string())
}

fn scenario_name(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "scenario".to_string(), |s| s.to_string_lossy().into_owned())
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Locate a scenario by path or by name under `scenarios_dir`.
///
/// Tried in order: the path as given, the path with `.yaml`, then
/// `<scenarios_dir>/<name>`, `<name>.yaml` and `<name>.yml`.
pub fn find_scenario(name_or_path: &str, scenarios_dir: &Path) -> Result<PathBuf> {
    let direct = PathBuf::from(name_or_path);
    let candidates = [
        direct.clone(),
        PathBuf::from(format!("{name_or_path}.yaml")),
        scenarios_dir.join(name_or_path),
        scenarios_dir.join(format!("{name_or_path}.yaml")),
        scenarios_dir.join(format!("{name_or_path}.yml")),
    ];
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or(Error::ScenarioNotFound(direct))
}

/// Scenario names (file stems) under `scenarios_dir`, sorted
pub fn list_scenarios(scenarios_dir: &Path) -> Result<Vec<String>> {
    if !scenarios_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for pattern in ["*.yaml", "*.yml"] {
        let pattern = scenarios_dir.join(pattern);
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::validation(format!("bad scenario pattern: {e}")))?;
        for path in entries.flatten() {
            names.push(scenario_name(&path));
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Parse and validate a scenario without running it
pub fn validate_scenario(path: &Path) -> Result<ScenarioInfo> {
    let document = ScenarioDocument::load(path)?;
    document.validate(&TemplateEngine::new())?;
    Ok(ScenarioInfo::describe(path, &document))
}

/// Describe a scenario without validating its templates
pub fn scenario_info(path: &Path) -> Result<ScenarioInfo> {
    let document = ScenarioDocument::load(path)?;
    Ok(ScenarioInfo::describe(path, &document))
}

/// Resolve a scenario's `log_path`.
///
/// A bare file name lands in `<broker_directory>/logs`. An absolute path
/// with an extension is used as is; one without is a directory that gets
/// `<scenario>.log`. Other relative paths are taken from the broker
/// directory.
pub fn resolve_log_path(configured: &Path, broker_directory: &Path, scenario: &str) -> PathBuf {
    let configured = expand_home(configured);
    if configured.is_absolute() {
        return if configured.extension().is_some() {
            configured
        } else {
            configured.join(format!("{scenario}.log"))
        };
    }
    let mut resolved = if configured.components().count() == 1 {
        broker_directory.join("logs").join(configured)
    } else {
        broker_directory.join(configured)
    };
    if resolved.extension().is_none() {
        resolved.set_extension("log");
    }
    resolved
}

/// The log file a scenario asks for, if any.
///
/// Read before logging is initialized so the file layer can be attached;
/// a document that fails to load yields `None` and the error surfaces later.
pub fn scenario_log_path(path: &Path, broker_directory: &Path) -> Option<PathBuf> {
    let document = ScenarioDocument::load(path).ok()?;
    document
        .config
        .log_path
        .as_deref()
        .map(|configured| resolve_log_path(configured, broker_directory, &scenario_name(path)))
}
