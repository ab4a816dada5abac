//! CLI module for Broker
//!
//! Argument parsing and subcommand dispatch. The commands are thin: each one
//! builds a request, hands it to the library, and renders the result.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

use broker::providers::Args;
use broker::scenario::vars::parse_assignment;

/// Broker - check out, use and check in hosts across provider backends
#[derive(Parser, Debug, Clone)]
#[command(name = "broker")]
#[command(author = "Broker Contributors")]
#[command(version)]
#[command(about = "An infrastructure middleman for provisioning and managing hosts")]
#[command(long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Settings file (default: broker_settings.* in the broker directory)
    #[arg(short = 's', long, global = true, env = "BROKER_SETTINGS_FILE")]
    pub settings: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// JSON output for scripting
    Json,
    /// YAML output
    Yaml,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Check out one or more hosts
    Checkout(commands::hosts::CheckoutArgs),

    /// Check in hosts from the inventory
    Checkin(commands::hosts::CheckinArgs),

    /// Extend the lease of hosts in the inventory
    Extend(commands::hosts::ExtendArgs),

    /// Check out hosts using the arguments of existing ones
    Duplicate(commands::hosts::DuplicateArgs),

    /// Run a provider action without touching the inventory
    Execute(commands::hosts::ExecuteArgs),

    /// Show or refresh the local inventory
    Inventory(commands::inventory::InventoryArgs),

    /// Query a provider, or list the available providers
    Providers(commands::providers::ProvidersArgs),

    /// List, run, validate and describe scenarios
    #[command(subcommand)]
    Scenarios(commands::scenarios::ScenarioCommand),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }

    /// Whether `--background` was requested for this command
    pub fn background(&self) -> bool {
        match &self.command {
            Commands::Checkout(args) => args.background,
            Commands::Checkin(args) => args.background,
            Commands::Extend(args) => args.background,
            Commands::Duplicate(args) => args.background,
            Commands::Execute(args) => args.background,
            _ => false,
        }
    }

    /// Scenario whose own `log_path` should receive the log, if any
    pub fn scenario_to_run(&self) -> Option<&str> {
        match &self.command {
            Commands::Scenarios(commands::scenarios::ScenarioCommand::Execute(args)) => {
                Some(&args.scenario)
            }
            _ => None,
        }
    }
}

/// Parse `key=value` provider arguments.
///
/// Values are read as YAML scalars, so `count=2` is a number and
/// `tags=[a, b]` a list; anything unparseable stays a string.
pub fn parse_provider_args<S: AsRef<str>>(items: &[S]) -> broker::Result<Args> {
    let mut args = Args::new();
    for item in items {
        let (key, raw) = parse_assignment(item.as_ref())?;
        let value = serde_yaml::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
        args.insert(key, value);
    }
    Ok(args)
}
