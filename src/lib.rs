//! # Broker - an infrastructure middleman
//!
//! Broker checks hosts out of pluggable back-end providers, keeps a local
//! inventory of what is checked out, opens sessions to those hosts, and
//! checks them back in. Scenarios chain these operations into YAML-defined
//! workflows with templated arguments, loops, guards and error recovery.
//!
//! ## Core Concepts
//!
//! - **Providers**: Back ends that create, extend and release hosts
//! - **Inventory**: The local file of checked-out host records
//! - **Filters**: A small expression language for selecting hosts
//! - **Sessions**: Command execution and file transfer on a host
//! - **Scenarios**: Ordered steps over all of the above
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      CLI Interface                       │
//! │               (clap-based command parsing)               │
//! └──────────────────────────────────────────────────────────┘
//!               │                              │
//!               ▼                              ▼
//! ┌──────────────────────────┐   ┌───────────────────────────┐
//! │     Lifecycle Broker     │◀──│      Scenario Runner      │
//! │ (checkout, checkin, ...) │   │ (steps, loops, templates) │
//! └──────────────────────────┘   └───────────────────────────┘
//!       │              │                       │
//!       ▼              ▼                       ▼
//! ┌───────────┐  ┌────────────┐   ┌───────────────────────────┐
//! │ Providers │  │ Inventory  │   │         Sessions          │
//! │           │  │ (locked)   │   │    (openssh, local)       │
//! └───────────┘  └────────────┘   └───────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use broker::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::new(Arc::new(Config::load(None)?));
//!
//!     let mut args = Args::new();
//!     args.insert("count".into(), 2.into());
//!     let hosts = broker.checkout(args).await?;
//!
//!     broker.checkin_hosts(hosts, false).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use std::sync::Arc;

    pub use crate::config::Config;
    pub use crate::connection::{CommandResult, Session, SessionFactory, TransportFactory};
    pub use crate::error::{Error, Result};
    pub use crate::inventory::{Filter, HostRecord, InventoryStore};
    pub use crate::lifecycle::{ArtifactsPolicy, Broker, HostSelector};
    pub use crate::providers::{Args, Provider, ProviderRegistry, TestProvider};
    pub use crate::scenario::{RunnerOptions, ScenarioOutcome, ScenarioRunner};
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types, result aliases and process exit codes.
pub mod error;

/// Settings file loading, environment overrides and per-provider instances.
pub mod config;

/// Writing step output to stdout, stderr or files.
pub mod output;

// ============================================================================
// Hosts
// ============================================================================

/// Host records, the filter language and the locked inventory file.
pub mod inventory;

/// The provider contract, the registry and the built-in test provider.
pub mod providers;

/// Sessions to checked-out hosts.
///
/// Command execution and file transfer go through the [`Session`] trait;
/// the OpenSSH client backs it by default and a local backend is kept for
/// hosts that are the machine Broker runs on.
///
/// [`Session`]: connection::Session
pub mod connection;

// ============================================================================
// Orchestration
// ============================================================================

/// Checkout, checkin, extend, duplicate and execute over providers.
pub mod lifecycle;

/// YAML scenarios: loading, templating and step execution.
pub mod scenario;

pub use error::{Error, Result};
