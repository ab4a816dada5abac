//! Broker - an infrastructure middleman
//!
//! This is the main entry point for the Broker CLI.

mod cli;

use anyhow::Result;
use broker::config::{Config, LoggingSettings};
use broker::lifecycle::background::{
    is_background_child, spawn_detached_process, strip_background_flag,
};
use broker::scenario::{find_scenario, scenario_log_path};
use cli::commands::{CommandContext, Runnable};
use cli::{Cli, Commands};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Hand `--background` work to a detached copy of ourselves
    if cli.background() && !is_background_child() {
        let args = strip_background_flag(std::env::args_os().skip(1));
        let pid = spawn_detached_process(args)?;
        println!("Running in the background (pid {pid}); see the log for results");
        return Ok(());
    }

    // Load configuration
    let config = match Config::load(cli.settings.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let log_file = scenario_log_file(&cli, &config).unwrap_or_else(|| config.log_file());
    init_logging(cli.verbosity(), &config.logging, &log_file, is_background_child());

    if cli.verbosity() >= 2 {
        eprintln!("Broker v{VERSION}");
    }
    tracing::debug!("Logging to {}", log_file.display());

    // Create command context
    let mut ctx = CommandContext::new(&cli, config);

    // Execute the appropriate command
    let outcome = match &cli.command {
        Commands::Checkout(args) => args.run(&mut ctx).await,
        Commands::Checkin(args) => args.run(&mut ctx).await,
        Commands::Extend(args) => args.run(&mut ctx).await,
        Commands::Duplicate(args) => args.run(&mut ctx).await,
        Commands::Execute(args) => args.run(&mut ctx).await,
        Commands::Inventory(args) => args.run(&mut ctx).await,
        Commands::Providers(args) => args.run(&mut ctx).await,
        Commands::Scenarios(command) => command.run(&mut ctx).await,
    };

    let exit_code = match outcome {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ctx.output.error(&format!("{e:#}"));
            e.downcast_ref::<broker::Error>()
                .map_or(1, broker::Error::exit_code)
        }
    };

    std::process::exit(exit_code);
}

/// A scenario run logs to the scenario's own `log_path` when it names one
fn scenario_log_file(cli: &Cli, config: &Config) -> Option<PathBuf> {
    let scenario = cli.scenario_to_run()?;
    let path = find_scenario(scenario, &config.scenarios_directory()).ok()?;
    scenario_log_path(&path, &config.broker_directory)
}

/// Initialize logging: console by verbosity, file by configured level.
///
/// `RUST_LOG` overrides the console filter. Background children have no
/// console, so the file is their only channel.
fn init_logging(verbosity: u8, settings: &LoggingSettings, log_file: &Path, background: bool) {
    let level = match verbosity {
        0 => settings.console_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = (!background).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbosity >= 2)
            .with_filter(console_filter)
    });
    let file = open_log_file(log_file).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(EnvFilter::new(&settings.file_level))
    });

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_open_log_file_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("broker.log");
        assert!(open_log_file(&path).is_some());
        assert!(path.exists());
    }
}
