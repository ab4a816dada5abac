//! Subcommands module for Broker CLI
//!
//! This module contains all the subcommand implementations.

pub mod hosts;
pub mod inventory;
pub mod providers;
pub mod scenarios;

use crate::cli::output::OutputFormatter;
use anyhow::Result;
use broker::config::Config;
use broker::lifecycle::Broker;
use std::sync::Arc;

/// Common context shared between commands
pub struct CommandContext {
    /// Effective settings
    pub config: Arc<Config>,
    /// Output formatter
    pub output: OutputFormatter,
    /// Verbosity level
    pub verbosity: u8,
    broker: Option<Broker>,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &crate::cli::Cli, config: Arc<Config>) -> Self {
        let output = OutputFormatter::new(!cli.no_color, cli.output, cli.verbosity());

        Self {
            config,
            output,
            verbosity: cli.verbosity(),
            broker: None,
        }
    }

    /// The broker for this invocation, built on first use
    pub fn broker(&mut self) -> &Broker {
        let config = Arc::clone(&self.config);
        self.broker.get_or_insert_with(|| Broker::new(config))
    }
}

/// Trait for runnable commands
#[async_trait::async_trait]
pub trait Runnable {
    /// Execute the command
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32>;
}
