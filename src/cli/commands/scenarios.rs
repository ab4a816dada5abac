//! Scenario commands - list, execute, validate, info
//!
//! Scenarios are looked up by path or by name in
//! `<broker_directory>/scenarios`.

use super::{CommandContext, Runnable};
use anyhow::Result;
use broker::scenario::vars::parse_assignments;
use broker::scenario::{
    find_scenario, list_scenarios, scenario_info, validate_scenario, RunnerOptions, ScenarioRunner,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Scenario subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ScenarioCommand {
    /// List scenarios in the scenarios directory
    List,

    /// Run a scenario
    Execute(ScenarioExecuteArgs),

    /// Check a scenario without running it
    Validate(ScenarioTarget),

    /// Describe a scenario's config, variables and steps
    Info(ScenarioTarget),
}

/// Arguments for `scenarios execute`
#[derive(Parser, Debug, Clone)]
pub struct ScenarioExecuteArgs {
    /// Scenario name or path
    pub scenario: String,

    /// Override a scenario variable (NAME=VALUE, repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", action = clap::ArgAction::Append)]
    pub vars: Vec<String>,

    /// Override a scenario config value (config.path=VALUE, repeatable)
    #[arg(long = "config", value_name = "PATH=VALUE", action = clap::ArgAction::Append)]
    pub config: Vec<String>,
}

/// A scenario named on the command line
#[derive(Parser, Debug, Clone)]
pub struct ScenarioTarget {
    /// Scenario name or path
    pub scenario: String,
}

impl ScenarioCommand {
    /// Execute the scenario command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        match self {
            Self::List => {
                let names = list_scenarios(&ctx.config.scenarios_directory())?;
                if ctx.output.is_structured() {
                    ctx.output.data(&names)?;
                } else if names.is_empty() {
                    println!(
                        "No scenarios in {}",
                        ctx.config.scenarios_directory().display()
                    );
                } else {
                    for name in names {
                        println!("{name}");
                    }
                }
                Ok(0)
            }
            Self::Execute(args) => args.execute(ctx).await,
            Self::Validate(target) => {
                let path = target.locate(ctx)?;
                validate_scenario(&path)?;
                ctx.output
                    .success(&format!("Scenario {} is valid", path.display()));
                Ok(0)
            }
            Self::Info(target) => {
                let path = target.locate(ctx)?;
                ctx.output.data(&scenario_info(&path)?)?;
                Ok(0)
            }
        }
    }
}

impl ScenarioTarget {
    fn locate(&self, ctx: &CommandContext) -> broker::Result<PathBuf> {
        find_scenario(&self.scenario, &ctx.config.scenarios_directory())
    }
}

impl ScenarioExecuteArgs {
    /// Run the scenario and report its outcome; the exit code is the run's
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let path = find_scenario(&self.scenario, &ctx.config.scenarios_directory())?;
        let options = RunnerOptions {
            cli_vars: parse_assignments(&self.vars)?,
            cli_config: parse_assignments(&self.config)?,
            sessions: None,
        };
        let mut runner = ScenarioRunner::new(path, Arc::clone(&ctx.config), options)?;
        ctx.output.info(&format!(
            "Scenario inventory: {}",
            runner.inventory_path().display()
        ));
        let outcome = runner.run().await?;
        ctx.output.scenario_outcome(&outcome)?;
        Ok(outcome.exit_code)
    }
}

#[async_trait::async_trait]
impl Runnable for ScenarioCommand {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        command: ScenarioCommand,
    }

    #[test]
    fn test_execute_args_parsing() {
        let parsed = Harness::try_parse_from([
            "scenarios",
            "execute",
            "smoke",
            "--var",
            "COUNT=3",
            "--config",
            "config.settings.thread_limit=2",
        ])
        .unwrap();
        let ScenarioCommand::Execute(args) = parsed.command else {
            panic!("expected execute");
        };
        assert_eq!(args.scenario, "smoke");
        assert_eq!(args.vars, vec!["COUNT=3"]);
        assert_eq!(args.config, vec!["config.settings.thread_limit=2"]);
    }

    #[test]
    fn test_list_parsing() {
        let parsed = Harness::try_parse_from(["scenarios", "list"]).unwrap();
        assert!(matches!(parsed.command, ScenarioCommand::List));
    }
}
