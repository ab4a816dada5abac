//! Host lifecycle commands - checkout, checkin, extend, duplicate, execute
//!
//! Every command here maps to one [`Broker`](broker::lifecycle::Broker)
//! operation. `--background` (on every command here) is handled before
//! dispatch by re-launching the process detached, so these only ever run in
//! the foreground.

use super::{CommandContext, Runnable};
use crate::cli::parse_provider_args;
use anyhow::Result;
use broker::inventory::{Filter, HostRecord};
use broker::lifecycle::{ArtifactsPolicy, HostSelector};
use broker::providers::ARGS_FILE;
use broker::Error;
use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Arguments for the checkout command
#[derive(Parser, Debug, Clone)]
pub struct CheckoutArgs {
    /// Named argument bundle from settings
    #[arg(long, short = 'n')]
    pub nick: Option<String>,

    /// Number of hosts to check out
    #[arg(long, short = 'c')]
    pub count: Option<usize>,

    /// Run detached; results land in the inventory and log
    #[arg(long, short = 'b')]
    pub background: bool,

    /// JSON or YAML file of provider arguments (a mapping or a list of mappings)
    #[arg(long, value_name = "FILE")]
    pub args_file: Option<PathBuf>,

    /// Provider arguments as key=value
    #[arg(value_name = "KEY=VALUE")]
    pub args: Vec<String>,
}

/// Arguments for the checkin command
#[derive(Parser, Debug, Clone)]
pub struct CheckinArgs {
    /// Inventory positions (negative counts from the end) or hostnames
    #[arg(value_name = "HOST", allow_negative_numbers = true)]
    pub hosts: Vec<String>,

    /// Check in every host in the inventory
    #[arg(long, short = 'a')]
    pub all: bool,

    /// Narrow the candidates with a filter expression
    #[arg(long)]
    pub filter: Option<String>,

    /// One host at a time
    #[arg(long)]
    pub sequential: bool,

    /// Run detached; results land in the inventory and log
    #[arg(long, short = 'b')]
    pub background: bool,
}

/// Arguments for the extend command
#[derive(Parser, Debug, Clone)]
pub struct ExtendArgs {
    /// Inventory positions (negative counts from the end) or hostnames
    #[arg(value_name = "HOST", allow_negative_numbers = true)]
    pub hosts: Vec<String>,

    /// Extend every host in the inventory
    #[arg(long, short = 'a')]
    pub all: bool,

    /// Narrow the candidates with a filter expression
    #[arg(long)]
    pub filter: Option<String>,

    /// One host at a time
    #[arg(long)]
    pub sequential: bool,

    /// Provider arguments as key=value (repeatable)
    #[arg(long = "arg", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    pub args: Vec<String>,
    /// Run detached; results land in the inventory and log
    #[arg(long, short = 'b')]
    pub background: bool,
}

/// Arguments for the duplicate command
#[derive(Parser, Debug, Clone)]
pub struct DuplicateArgs {
    /// Inventory positions (negative counts from the end) or hostnames
    #[arg(value_name = "HOST", allow_negative_numbers = true)]
    pub hosts: Vec<String>,

    /// Duplicate every host in the inventory
    #[arg(long, short = 'a')]
    pub all: bool,

    /// Narrow the candidates with a filter expression
    #[arg(long)]
    pub filter: Option<String>,

    /// Copies per selected host (default: the stored count)
    #[arg(long, short = 'c')]
    pub count: Option<usize>,

    /// Run detached; results land in the inventory and log
    #[arg(long, short = 'b')]
    pub background: bool,
}

/// Arguments for the execute command
#[derive(Parser, Debug, Clone)]
pub struct ExecuteArgs {
    /// Named argument bundle from settings
    #[arg(long, short = 'n')]
    pub nick: Option<String>,

    /// How to combine artifacts: merge or last
    #[arg(long)]
    pub artifacts: Option<String>,

    /// JSON or YAML file of provider arguments (a mapping or a list of mappings)
    #[arg(long, value_name = "FILE")]
    pub args_file: Option<PathBuf>,

    /// Run detached; results land in the inventory and log
    #[arg(long, short = 'b')]
    pub background: bool,

    /// Provider arguments as key=value
    #[arg(value_name = "KEY=VALUE")]
    pub args: Vec<String>,
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn parse_filter(filter: Option<&str>) -> broker::Result<Option<Filter>> {
    filter.map(Filter::parse).transpose().map_err(Error::from)
}

/// Print hosts acquired by a partially failed checkout before failing
fn report_partial(ctx: &CommandContext, error: &Error) {
    let acquired = error.acquired_hosts();
    if !acquired.is_empty() {
        let names: Vec<&str> = acquired.iter().map(HostRecord::identity).collect();
        ctx.output.warning(&format!(
            "acquired before the failure and still checked out: {}",
            names.join(", ")
        ));
    }
}

impl CheckoutArgs {
    /// Execute the checkout command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let mut args = parse_provider_args(&self.args)?;
        if let Some(nick) = &self.nick {
            args.insert("nick".to_string(), Value::String(nick.clone()));
        }
        if let Some(path) = &self.args_file {
            args.insert(ARGS_FILE.to_string(), path_value(path));
        }
        if let Some(count) = self.count {
            args.insert("count".to_string(), Value::from(count));
        }

        let result = ctx.broker().checkout(args).await;
        let hosts = match result {
            Ok(hosts) => hosts,
            Err(e) => {
                report_partial(ctx, &e);
                return Err(e.into());
            }
        };
        if ctx.output.is_structured() {
            let values: Vec<_> = hosts.iter().map(HostRecord::to_value).collect();
            ctx.output.data(&values)?;
        } else {
            for host in &hosts {
                ctx.output.success(&format!("Checked out {}", host.identity()));
            }
        }
        Ok(0)
    }
}

impl CheckinArgs {
    /// Execute the checkin command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let selector = HostSelector::from_items(self.hosts.iter().cloned(), self.all);
        let filter = parse_filter(self.filter.as_deref())?;
        ctx.broker()
            .checkin(&selector, filter.as_ref(), self.sequential)
            .await?;
        ctx.output.success("Checkin complete");
        Ok(0)
    }
}

impl ExtendArgs {
    /// Execute the extend command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let selector = HostSelector::from_items(self.hosts.iter().cloned(), self.all);
        let filter = parse_filter(self.filter.as_deref())?;
        let args = parse_provider_args(&self.args)?;
        ctx.broker()
            .extend(&selector, filter.as_ref(), args, self.sequential)
            .await?;
        ctx.output.success("Extend complete");
        Ok(0)
    }
}

impl DuplicateArgs {
    /// Execute the duplicate command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let selector = HostSelector::from_items(self.hosts.iter().cloned(), self.all);
        let filter = parse_filter(self.filter.as_deref())?;
        let result = ctx.broker().duplicate(&selector, filter.as_ref(), self.count).await;
        let hosts = match result {
            Ok(hosts) => hosts,
            Err(e) => {
                report_partial(ctx, &e);
                return Err(e.into());
            }
        };
        for host in &hosts {
            ctx.output.success(&format!("Checked out {}", host.identity()));
        }
        if ctx.output.is_structured() {
            let values: Vec<_> = hosts.iter().map(HostRecord::to_value).collect();
            ctx.output.data(&values)?;
        }
        Ok(0)
    }
}

impl ExecuteArgs {
    /// Execute the execute command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let mut args = parse_provider_args(&self.args)?;
        if let Some(nick) = &self.nick {
            args.insert("nick".to_string(), Value::String(nick.clone()));
        }
        if let Some(path) = &self.args_file {
            args.insert(ARGS_FILE.to_string(), path_value(path));
        }
        let policy = self
            .artifacts
            .as_deref()
            .map(ArtifactsPolicy::parse)
            .transpose()?;
        let result = ctx.broker().execute(args, policy).await?;
        ctx.output.data(&result)?;
        Ok(0)
    }
}

#[async_trait::async_trait]
impl Runnable for CheckoutArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[async_trait::async_trait]
impl Runnable for CheckinArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[async_trait::async_trait]
impl Runnable for ExtendArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[async_trait::async_trait]
impl Runnable for DuplicateArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[async_trait::async_trait]
impl Runnable for ExecuteArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_args_parsing() {
        let args =
            CheckoutArgs::try_parse_from(["checkout", "--nick", "rhel9", "-c", "2", "workflow=x"])
                .unwrap();
        assert_eq!(args.nick.as_deref(), Some("rhel9"));
        assert_eq!(args.count, Some(2));
        assert_eq!(args.args, vec!["workflow=x"]);
        assert!(!args.background);
    }

    #[test]
    fn test_checkin_args_parsing() {
        let args = CheckinArgs::try_parse_from([
            "checkin",
            "0",
            "host1.example.com",
            "--filter",
            "_broker_provider=TestProvider",
            "--sequential",
        ])
        .unwrap();
        assert_eq!(args.hosts, vec!["0", "host1.example.com"]);
        assert!(args.sequential);
        assert!(parse_filter(args.filter.as_deref()).unwrap().is_some());
    }

    #[test]
    fn test_background_and_args_file_flags() {
        let args =
            ExecuteArgs::try_parse_from(["execute", "-b", "--args-file", "job.yaml"]).unwrap();
        assert!(args.background);
        assert_eq!(args.args_file, Some(PathBuf::from("job.yaml")));
        assert!(ExtendArgs::try_parse_from(["extend", "0", "--background"])
            .unwrap()
            .background);
        assert!(DuplicateArgs::try_parse_from(["duplicate", "-b", "0"])
            .unwrap()
            .background);
    }

    #[test]
    fn test_negative_position_is_a_host_item() {
        let args = CheckinArgs::try_parse_from(["checkin", "-1"]).unwrap();
        assert_eq!(args.hosts, vec!["-1"]);
    }

    #[test]
    fn test_bad_filter_is_validation_error() {
        let err = parse_filter(Some("hostname")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
