//! Step action handlers.
//!
//! Each handler receives the step's rendered arguments and, for actions
//! that act on hosts, the hosts resolved from `with.hosts`.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::hosts::records_from_value;
use super::{find_scenario, Action, ScenarioOutcome, ScenarioRunner, Step};
use crate::connection::{establish, CommandResult, Session};
use crate::error::{Error, HostFailure, Result};
use crate::inventory::{Filter, HostRecord};
use crate::lifecycle::parallel::run_bounded;
use crate::output::{self, Destination, WriteMode};
use crate::providers::Args;

/// Which way an `sftp` step moves a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

impl ScenarioRunner {
    pub(super) async fn dispatch(
        &mut self,
        step: &Step,
        arguments: Args,
        hosts: Option<Vec<HostRecord>>,
        parallel: bool,
    ) -> Result<Value> {
        debug!("Dispatching '{}' as {}", step.name, step.action);
        match step.action {
            Action::Checkout => self.checkout(arguments).await,
            Action::Checkin => self.checkin(arguments, hosts, parallel).await,
            Action::Ssh => self.ssh(arguments, hosts, parallel).await,
            Action::Scp => self.scp(arguments, hosts, parallel).await,
            Action::Sftp => self.sftp(arguments, hosts, parallel).await,
            Action::Execute => self.broker.execute(arguments, None).await,
            Action::ProviderInfo => self.provider_info(arguments).await,
            Action::Inventory => self.inventory(&arguments).await,
            Action::Output => self.output(&arguments),
            Action::Exit => exit(&arguments),
            Action::RunScenarios => self.run_scenarios(step, &arguments).await,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn checkout(&mut self, arguments: Args) -> Result<Value> {
        match self.broker.checkout(arguments).await {
            Ok(hosts) => {
                self.scenario_hosts.extend(hosts.iter().cloned());
                self.save_scenario_inventory().await?;
                Ok(hosts_value(&hosts))
            }
            Err(failure) => {
                let acquired = failure.acquired_hosts();
                if !acquired.is_empty() {
                    self.scenario_hosts.extend(acquired.iter().cloned());
                    if let Err(e) = self.save_scenario_inventory().await {
                        error!("Could not record partially acquired hosts: {e}");
                    }
                }
                Err(failure)
            }
        }
    }

    /// Release hosts from `with`, `arguments.hosts`, or the whole scenario
    /// inventory. Released hosts leave the scenario inventory; failed ones
    /// stay.
    async fn checkin(
        &mut self,
        arguments: Args,
        hosts: Option<Vec<HostRecord>>,
        parallel: bool,
    ) -> Result<Value> {
        let hosts = match hosts {
            Some(hosts) => hosts,
            None => match arguments.get("hosts") {
                Some(value) => records_from_value(value.clone())?,
                None => self.scenario_hosts.clone(),
            },
        };
        if hosts.is_empty() {
            info!("No hosts to check in");
            return Ok(Value::Bool(true));
        }

        let identities: Vec<String> = hosts.iter().map(|h| h.identity().to_string()).collect();
        let outcome = self.broker.checkin_hosts(hosts, !parallel).await;
        let released: HashSet<String> = match &outcome {
            Ok(_) => identities.into_iter().collect(),
            Err(Error::HostFailures { failures, .. }) => {
                let failed: HashSet<&str> = failures.iter().map(|f| f.host.as_str()).collect();
                identities
                    .into_iter()
                    .filter(|id| !failed.contains(id.as_str()))
                    .collect()
            }
            Err(_) => HashSet::new(),
        };
        self.scenario_hosts
            .retain(|host| !released.contains(host.identity()));
        let saved = self.save_scenario_inventory().await;
        let checked_in = outcome?;
        saved?;
        Ok(Value::Bool(checked_in))
    }

    async fn provider_info(&self, mut arguments: Args) -> Result<Value> {
        let provider = match arguments.remove("provider") {
            Some(Value::String(provider)) => provider,
            _ => return Err(Error::validation("provider_info requires a 'provider' argument")),
        };
        match arguments.remove("query") {
            Some(Value::String(flag)) => {
                arguments.insert(flag, Value::Bool(true));
            }
            Some(Value::Object(query)) => arguments.extend(query),
            Some(other) => {
                return Err(Error::validation(format!(
                    "provider_info query must be a name or a mapping, got {other}"
                )))
            }
            None => return Err(Error::validation("provider_info requires a 'query' argument")),
        }
        self.broker.provider_info(&provider, arguments).await
    }

    /// `sync: <provider[:instance]>` refreshes first; `filter:` narrows
    async fn inventory(&self, arguments: &Args) -> Result<Value> {
        if let Some(spec) = arguments.get("sync").and_then(Value::as_str) {
            let retain = arguments
                .get("retain")
                .is_some_and(super::template::truthy);
            let summary = self.broker.sync_inventory(spec, retain).await?;
            info!(
                "Synced {spec}: {} added, {} updated, {} removed",
                summary.added.len(),
                summary.updated.len(),
                summary.removed.len()
            );
        }
        let filter = match arguments.get("filter") {
            Some(Value::String(expression)) => Some(Filter::parse(expression)?),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(Error::validation(format!(
                    "inventory filter must be a string, got {other}"
                )))
            }
        };
        Ok(hosts_value(&self.broker.inventory(filter.as_ref())?))
    }

    // ========================================================================
    // Remote sessions
    // ========================================================================

    async fn ssh(
        &self,
        arguments: Args,
        hosts: Option<Vec<HostRecord>>,
        parallel: bool,
    ) -> Result<Value> {
        let hosts = session_targets(Action::Ssh, hosts, &arguments)?;
        let command = Arc::new(required_text(Action::Ssh, &arguments, "command")?);
        let timeout = match arguments.get("timeout") {
            Some(value) => Some(duration_argument(value)?),
            None => self.broker.config().ssh.command_timeout,
        };
        self.on_hosts(Action::Ssh, hosts, parallel, move |session| {
            let command = Arc::clone(&command);
            async move { Ok(session.run(&command, timeout).await?) }
        })
        .await
    }

    async fn scp(
        &self,
        arguments: Args,
        hosts: Option<Vec<HostRecord>>,
        parallel: bool,
    ) -> Result<Value> {
        let hosts = session_targets(Action::Scp, hosts, &arguments)?;
        let source = PathBuf::from(required_text(Action::Scp, &arguments, "source")?);
        let destination = Arc::new(required_text(Action::Scp, &arguments, "destination")?);
        let source = Arc::new(source);
        self.on_hosts(Action::Scp, hosts, parallel, move |session| {
            let source = Arc::clone(&source);
            let destination = Arc::clone(&destination);
            async move {
                session.upload(&source, &destination).await?;
                Ok(CommandResult::new(
                    0,
                    format!("Copied {} to {destination}", source.display()),
                    "",
                ))
            }
        })
        .await
    }

    async fn sftp(
        &self,
        arguments: Args,
        hosts: Option<Vec<HostRecord>>,
        parallel: bool,
    ) -> Result<Value> {
        let hosts = session_targets(Action::Sftp, hosts, &arguments)?;
        let source = Arc::new(required_text(Action::Sftp, &arguments, "source")?);
        let destination = Arc::new(required_text(Action::Sftp, &arguments, "destination")?);
        let direction = match arguments.get("direction").and_then(Value::as_str) {
            None | Some("upload") => Direction::Upload,
            Some("download") => Direction::Download,
            Some(other) => {
                return Err(Error::validation(format!(
                    "sftp direction must be 'upload' or 'download', got '{other}'"
                )))
            }
        };
        self.on_hosts(Action::Sftp, hosts, parallel, move |session| {
            let source = Arc::clone(&source);
            let destination = Arc::clone(&destination);
            async move {
                let verb = match direction {
                    Direction::Upload => {
                        session.upload(Path::new(source.as_str()), &destination).await?;
                        "Uploaded"
                    }
                    Direction::Download => {
                        session.download(&source, Path::new(destination.as_str())).await?;
                        "Downloaded"
                    }
                };
                Ok(CommandResult::new(0, format!("{verb} {source} to {destination}"), ""))
            }
        })
        .await
    }

    /// Open a session per host and run `operation` on each.
    ///
    /// One host yields its result directly; several yield a mapping from
    /// host identity to result. A nonzero command status is a result, not a
    /// failure.
    async fn on_hosts<F, Fut>(
        &self,
        action: Action,
        hosts: Vec<HostRecord>,
        parallel: bool,
        operation: F,
    ) -> Result<Value>
    where
        F: Fn(Arc<dyn Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandResult>> + Send + 'static,
    {
        let labels: Vec<String> = hosts.iter().map(|h| h.identity().to_string()).collect();
        let limit = if parallel {
            self.broker.config().worker_limit(hosts.len())
        } else {
            1
        };
        let sessions = Arc::clone(self.broker.sessions());
        let operation = Arc::new(operation);

        let results = run_bounded(hosts, limit, move |host: HostRecord| {
            let sessions = Arc::clone(&sessions);
            let operation = Arc::clone(&operation);
            async move {
                let session = establish(sessions.as_ref(), &host).await?;
                let result = operation(session).await?;
                debug!("{} on {} exited {}", action, host.identity(), result.status);
                Ok(serde_json::to_value(result)?)
            }
        })
        .await;

        if labels.len() == 1 {
            return results.into_iter().next().unwrap_or(Ok(Value::Null));
        }

        let mut output = serde_json::Map::new();
        let mut failures = Vec::new();
        for (label, result) in labels.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    output.insert(label, value);
                }
                Err(error) => {
                    error!("{action} failed on {label}: {error}");
                    failures.push(HostFailure { host: label, error });
                }
            }
        }
        if failures.is_empty() {
            Ok(Value::Object(output))
        } else {
            Err(Error::HostFailures {
                operation: action.to_string(),
                failures,
            })
        }
    }

    // ========================================================================
    // Flow
    // ========================================================================

    /// Write `content`; a string naming a variable writes that variable
    fn output(&self, arguments: &Args) -> Result<Value> {
        let content = match arguments.get("content") {
            Some(Value::String(name)) if self.variables.contains_key(name) => {
                self.variables.get(name).cloned().unwrap_or_default()
            }
            Some(content) => content.clone(),
            None => return Err(Error::validation("output requires a 'content' argument")),
        };
        let destination = Destination::parse(
            arguments
                .get("destination")
                .and_then(Value::as_str)
                .unwrap_or("stdout"),
        );
        let mode = match arguments.get("mode").and_then(Value::as_str) {
            Some(mode) => WriteMode::parse(mode)?,
            None => WriteMode::default(),
        };
        output::write(&destination, &content, mode)?;
        Ok(content)
    }

    /// Run other scenarios in turn with this run's options.
    ///
    /// The output lists `{path, success}` per child. Failed children only
    /// fail the step when it sets `exit_on_error: true`.
    async fn run_scenarios(&self, step: &Step, arguments: &Args) -> Result<Value> {
        let paths: Vec<String> = match arguments.get("paths") {
            Some(Value::String(path)) => vec![path.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        Error::validation(format!(
                            "run_scenarios paths must be strings, got {item}"
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            _ => return Err(Error::validation("run_scenarios requires a 'paths' list")),
        };

        let mut results = Vec::with_capacity(paths.len());
        let mut failed = Vec::new();
        for path in paths {
            let success = match self.run_child(&path).await {
                Ok(outcome) => outcome.success(),
                Err(e) => {
                    error!("Sub-scenario {path} could not run: {e}");
                    false
                }
            };
            if !success {
                failed.push(path.clone());
            }
            results.push(json!({"path": path, "success": success}));
        }

        if !failed.is_empty() && step.exit_on_error == Some(true) {
            return Err(Error::step_failed(
                &step.name,
                format!("sub-scenario(s) failed: {}", failed.join(", ")),
            ));
        }
        Ok(Value::Array(results))
    }

    async fn run_child(&self, path: &str) -> Result<ScenarioOutcome> {
        let location = find_scenario(path, &self.base_config.scenarios_directory())?;
        info!("Running sub-scenario {}", location.display());
        let mut child = ScenarioRunner::new(
            location,
            Arc::clone(&self.base_config),
            self.options.clone(),
        )?;
        child.run().await
    }
}

/// End the run with `return_code` (default 0)
fn exit(arguments: &Args) -> Result<Value> {
    let code = match arguments.get("return_code") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| Error::validation(format!("invalid return_code {n}")))?,
        Some(Value::String(text)) => text
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid return_code '{text}'")))?,
        Some(other) => return Err(Error::validation(format!("invalid return_code {other}"))),
    };
    let message = arguments
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Scenario exited")
        .to_string();
    Err(Error::Exit { code, message })
}

fn session_targets(
    action: Action,
    hosts: Option<Vec<HostRecord>>,
    arguments: &Args,
) -> Result<Vec<HostRecord>> {
    let hosts = match hosts {
        Some(hosts) => hosts,
        None => match arguments.get("hosts") {
            Some(value) => records_from_value(value.clone())?,
            None => Vec::new(),
        },
    };
    if hosts.is_empty() {
        return Err(Error::Selection(format!(
            "{action} needs target hosts: set 'with.hosts' or a 'hosts' argument"
        )));
    }
    Ok(hosts)
}

fn required_text(action: Action, arguments: &Args, key: &str) -> Result<String> {
    match arguments.get(key) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::validation(format!("{action} requires a '{key}' argument"))),
    }
}

/// Seconds as a number, or a humantime string such as `90s` or `2m`
fn duration_argument(value: &Value) -> Result<Duration> {
    let invalid = || Error::validation(format!("invalid timeout {value}"));
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(invalid),
        Value::String(text) => match text.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            _ => humantime_serde::re::humantime::parse_duration(text.trim()).map_err(|_| invalid()),
        },
        _ => Err(invalid()),
    }
}

fn hosts_value(hosts: &[HostRecord]) -> Value {
    Value::Array(hosts.iter().map(HostRecord::to_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn args(value: Value) -> Args {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_exit_codes_from_arguments() {
        let code = |value: Value| match exit(&args(value)) {
            Err(Error::Exit { code, .. }) => Some(code),
            _ => None,
        };
        assert_eq!(code(json!({})), Some(0));
        assert_eq!(code(json!({"return_code": 3})), Some(3));
        assert_eq!(code(json!({"return_code": "5"})), Some(5));
        assert_eq!(code(json!({"return_code": "five"})), None);
    }

    #[test]
    fn test_duration_argument() {
        assert_eq!(duration_argument(&json!(30)).unwrap(), Duration::from_secs(30));
        assert_eq!(duration_argument(&json!("2m")).unwrap(), Duration::from_secs(120));
        assert_eq!(duration_argument(&json!("1.5")).unwrap(), Duration::from_millis(1500));
        assert!(duration_argument(&json!(-1)).is_err());
        assert!(duration_argument(&json!(true)).is_err());
    }

    #[test]
    fn test_session_targets() {
        let err = session_targets(Action::Ssh, None, &Map::new()).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        let from_args =
            session_targets(Action::Ssh, None, &args(json!({"hosts": [{"hostname": "h1"}]})))
                .unwrap();
        assert_eq!(from_args[0].identity(), "h1");

        let explicit = session_targets(Action::Ssh, Some(vec![HostRecord::new("h2")]), &Map::new())
            .unwrap();
        assert_eq!(explicit[0].identity(), "h2");
    }

    #[test]
    fn test_required_text() {
        let arguments = args(json!({"command": "uptime", "port": 22}));
        assert_eq!(required_text(Action::Ssh, &arguments, "command").unwrap(), "uptime");
        assert_eq!(required_text(Action::Ssh, &arguments, "port").unwrap(), "22");
        assert!(required_text(Action::Ssh, &arguments, "missing").is_err());
    }
}
