//! Scenario documents.
//!
//! A scenario is a YAML file with three top-level keys:
//!
//! ```yaml
//! config:
//!   inventory_path: /tmp/my_scenario_inventory.yaml
//!   log_path: my_scenario.log
//!   settings:
//!     providers:
//!       TestProvider: {prefix: ci}
//! variables:
//!   COUNT: 2
//! steps:
//!   - name: Provision
//!     action: checkout
//!     arguments: {nick: rhel9, count: "{{ COUNT }}"}
//!   - name: Smoke test
//!     action: ssh
//!     with: {hosts: scenario_inventory}
//!     arguments: {command: "echo ok"}
//! ```
//!
//! Unknown keys are rejected so typos surface at validation time rather
//! than being silently ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use super::template::{bare_expression, TemplateEngine};
use super::ScenarioError;

/// The step actions a scenario can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Checkout,
    Checkin,
    Ssh,
    Scp,
    Sftp,
    Execute,
    ProviderInfo,
    Inventory,
    Output,
    Exit,
    RunScenarios,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Checkout,
        Action::Checkin,
        Action::Ssh,
        Action::Scp,
        Action::Sftp,
        Action::Execute,
        Action::ProviderInfo,
        Action::Inventory,
        Action::Output,
        Action::Exit,
        Action::RunScenarios,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Checkin => "checkin",
            Self::Ssh => "ssh",
            Self::Scp => "scp",
            Self::Sftp => "sftp",
            Self::Execute => "execute",
            Self::ProviderInfo => "provider_info",
            Self::Inventory => "inventory",
            Self::Output => "output",
            Self::Exit => "exit",
            Self::RunScenarios => "run_scenarios",
        }
    }

    /// Actions that operate on target hosts through a session
    pub fn uses_sessions(self) -> bool {
        matches!(self, Self::Ssh | Self::Scp | Self::Sftp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The document's `config` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Where this run's acquired hosts are persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_path: Option<PathBuf>,
    /// Log file for this run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Settings layered over the global configuration for this run
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,
}

/// `with:` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct With {
    pub hosts: String,
}

/// What a failed loop iteration does to the rest of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopFailure {
    #[default]
    Halt,
    Continue,
}

/// `loop:` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    /// Host reference or expression yielding the items
    pub iterable: String,
    /// `item` or `key, value`
    pub iter_var: String,
    #[serde(default)]
    pub on_error: LoopFailure,
}

impl LoopSpec {
    /// Variable names bound per iteration
    pub fn variable_names(&self) -> Vec<String> {
        self.iter_var
            .split(',')
            .map(|name| name.trim().to_string())
            .collect()
    }
}

/// `capture:` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Capture {
    /// Variable that receives the value
    #[serde(rename = "as")]
    pub into: String,
    /// Template applied to the output first (`step.output` is bound)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    /// Per-iteration key for looped steps (`result` is bound)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// What happens when a step fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OnErrorRepr", into = "OnErrorRepr")]
pub enum OnError {
    /// Record the failure and carry on
    Continue,
    /// Run these steps, then carry on unless they fail too
    Steps(Vec<Step>),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum OnErrorRepr {
    Marker(String),
    Steps(Vec<Step>),
}

impl TryFrom<OnErrorRepr> for OnError {
    type Error = String;

    fn try_from(repr: OnErrorRepr) -> Result<Self, Self::Error> {
        match repr {
            OnErrorRepr::Marker(marker) if marker == "continue" => Ok(Self::Continue),
            OnErrorRepr::Marker(other) => Err(format!(
                "on_error must be 'continue' or a list of steps, got '{other}'"
            )),
            OnErrorRepr::Steps(steps) => Ok(Self::Steps(steps)),
        }
    }
}

impl From<OnError> for OnErrorRepr {
    fn from(on_error: OnError) -> Self {
        match on_error {
            OnError::Continue => Self::Marker("continue".to_string()),
            OnError::Steps(steps) => Self::Steps(steps),
        }
    }
}

/// One step of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<With>,
    #[serde(
        default,
        deserialize_with = "guard_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub when: Option<String>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_on_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<Capture>,
}

fn default_parallel() -> bool {
    true
}

/// `when:` may be written as a bare YAML boolean or number
fn guard_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// A parsed scenario document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioDocument {
    #[serde(default)]
    pub config: ScenarioConfig,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ScenarioDocument {
    /// Read and parse a scenario file
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScenarioError::NotFound(path.to_path_buf())
            } else {
                ScenarioError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            }
        })?;
        Self::parse(&content).map_err(|e| match e {
            ScenarioError::Parse { message, .. } => ScenarioError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse scenario YAML
    pub fn parse(content: &str) -> Result<Self, ScenarioError> {
        let document: Option<Self> =
            serde_yaml::from_str(content).map_err(|e| ScenarioError::Parse {
                path: PathBuf::new(),
                message: e.to_string(),
            })?;
        Ok(document.unwrap_or_default())
    }

    /// Check structure and template syntax without running anything
    pub fn validate(&self, engine: &TemplateEngine) -> Result<(), ScenarioError> {
        if self.steps.is_empty() {
            return Err(ScenarioError::Invalid("scenario has no steps".to_string()));
        }
        let mut names = HashSet::new();
        validate_steps(&self.steps, engine, &mut names)
    }

    /// Every step name, depth first through recovery sequences
    pub fn step_names(&self) -> Vec<&str> {
        fn walk<'a>(steps: &'a [Step], names: &mut Vec<&'a str>) {
            for step in steps {
                names.push(&step.name);
                if let Some(OnError::Steps(recovery)) = &step.on_error {
                    walk(recovery, names);
                }
            }
        }
        let mut names = Vec::new();
        walk(&self.steps, &mut names);
        names
    }
}

fn validate_steps(
    steps: &[Step],
    engine: &TemplateEngine,
    names: &mut HashSet<String>,
) -> Result<(), ScenarioError> {
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(ScenarioError::Invalid(format!(
                "a '{}' step has an empty name",
                step.action
            )));
        }
        if !names.insert(step.name.clone()) {
            return Err(ScenarioError::DuplicateStep(step.name.clone()));
        }

        let template = |location: &str, text: &str| {
            engine
                .check_syntax(text)
                .map_err(|e| ScenarioError::Template {
                    location: format!("step '{}' {location}", step.name),
                    message: e.to_string(),
                })
        };
        let expression = |location: &str, text: &str| {
            engine
                .check_expression(bare_expression(text))
                .map_err(|e| ScenarioError::Template {
                    location: format!("step '{}' {location}", step.name),
                    message: e.to_string(),
                })
        };

        for (key, value) in &step.arguments {
            check_value(value, &|text| template(&format!("argument '{key}'"), text))?;
        }
        if let Some(when) = &step.when {
            expression("when", when)?;
        }
        if let Some(with) = &step.with {
            if with.hosts.trim().is_empty() {
                return Err(ScenarioError::Invalid(format!(
                    "step '{}' has an empty with.hosts",
                    step.name
                )));
            }
            template("with.hosts", &with.hosts)?;
        }
        if let Some(spec) = &step.loop_spec {
            let variables = spec.variable_names();
            if variables.is_empty()
                || variables.len() > 2
                || variables.iter().any(String::is_empty)
            {
                return Err(ScenarioError::Invalid(format!(
                    "step '{}' loop.iter_var must be one name or 'key, value'",
                    step.name
                )));
            }
            if super::hosts::HostReference::parse(&spec.iterable).is_none() {
                expression("loop.iterable", &spec.iterable)?;
            }
        }
        if let Some(capture) = &step.capture {
            if capture.into.trim().is_empty() {
                return Err(ScenarioError::Invalid(format!(
                    "step '{}' capture.as is empty",
                    step.name
                )));
            }
            if let Some(transform) = &capture.transform {
                template("capture.transform", transform)?;
            }
            if let Some(key) = &capture.key {
                expression("capture.key", key)?;
            }
        }
        if let Some(OnError::Steps(recovery)) = &step.on_error {
            validate_steps(recovery, engine, names)?;
        }
    }
    Ok(())
}

fn check_value(
    value: &Value,
    check: &dyn Fn(&str) -> Result<(), ScenarioError>,
) -> Result<(), ScenarioError> {
    match value {
        Value::String(text) => check(text),
        Value::Array(items) => items.iter().try_for_each(|item| check_value(item, check)),
        Value::Object(map) => map.values().try_for_each(|item| check_value(item, check)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SAMPLE: &str = r#"
config:
  inventory_path: /tmp/sample_inventory.yaml
variables:
  COUNT: 2
steps:
  - name: Provision
    action: checkout
    arguments:
      count: "{{ COUNT }}"
    on_error:
      - name: Report
        action: output
        arguments: {content: "checkout failed"}
  - name: Check
    action: ssh
    with: {hosts: scenario_inventory}
    when: COUNT > 1
    parallel: false
    arguments: {command: "echo ok"}
    capture: {as: check_result}
  - name: Per host
    action: ssh
    loop: {iterable: scenario_inventory, iter_var: host, on_error: continue}
    arguments: {command: "hostname"}
    on_error: continue
"#;

    #[test]
    fn test_parse_sample() {
        let doc = ScenarioDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.variables["COUNT"], json!(2));
        assert_eq!(doc.steps.len(), 3);
        assert_eq!(doc.steps[0].action, Action::Checkout);
        assert!(matches!(doc.steps[0].on_error, Some(OnError::Steps(ref s)) if s.len() == 1));
        assert!(!doc.steps[1].parallel);
        assert_eq!(doc.steps[1].capture.as_ref().unwrap().into, "check_result");
        let spec = doc.steps[2].loop_spec.as_ref().unwrap();
        assert_eq!(spec.on_error, LoopFailure::Continue);
        assert_eq!(doc.steps[2].on_error, Some(OnError::Continue));
        assert_eq!(doc.step_names(), vec!["Provision", "Report", "Check", "Per host"]);
        doc.validate(&TemplateEngine::new()).unwrap();
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = ScenarioDocument::parse("steps:\n  - {name: a, action: reboot}\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Parse { .. }));
    }

    #[test]
    fn test_unknown_step_key_is_rejected() {
        let err = ScenarioDocument::parse("steps:\n  - {name: a, action: exit, argumnts: {}}\n")
            .unwrap_err();
        assert!(matches!(err, ScenarioError::Parse { .. }));
    }

    #[test]
    fn test_bad_on_error_marker() {
        let err = ScenarioDocument::parse("steps:\n  - {name: a, action: exit, on_error: ignore}\n")
            .unwrap_err();
        assert!(matches!(err, ScenarioError::Parse { .. }));
    }

    #[test]
    fn test_duplicate_names_across_recovery() {
        let doc = ScenarioDocument::parse(
            "steps:\n  - name: a\n    action: exit\n    \
             on_error:\n      - {name: a, action: exit}\n",
        )
        .unwrap();
        assert!(matches!(
            doc.validate(&TemplateEngine::new()),
            Err(ScenarioError::DuplicateStep(name)) if name == "a"
        ));
    }

    #[test]
    fn test_template_syntax_errors() {
        let doc = ScenarioDocument::parse(
            "steps:\n  - {name: a, action: output, arguments: {content: \"{{ broken \"}}\n",
        )
        .unwrap();
        assert!(matches!(
            doc.validate(&TemplateEngine::new()),
            Err(ScenarioError::Template { .. })
        ));
    }

    #[test]
    fn test_bool_guard() {
        let doc =
            ScenarioDocument::parse("steps:\n  - {name: a, action: exit, when: false}\n").unwrap();
        assert_eq!(doc.steps[0].when.as_deref(), Some("false"));
    }

    #[test]
    fn test_iter_var_names() {
        let spec = LoopSpec {
            iterable: "items".into(),
            iter_var: "key, value".into(),
            on_error: LoopFailure::Halt,
        };
        assert_eq!(spec.variable_names(), vec!["key", "value"]);
    }
}
