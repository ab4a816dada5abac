//! Inventory command - show or refresh the local inventory
//!
//! This module implements the `inventory` subcommand.

use super::{CommandContext, Runnable};
use anyhow::Result;
use broker::inventory::Filter;
use clap::Parser;

/// Arguments for the inventory command
#[derive(Parser, Debug, Clone)]
pub struct InventoryArgs {
    /// Print full host records instead of the table
    #[arg(long, short = 'd')]
    pub details: bool,

    /// One short line per host
    #[arg(long, short = 'l', conflicts_with = "details")]
    pub list: bool,

    /// Pull a provider's hosts first (Provider[::instance][:extra])
    #[arg(long, value_name = "SPEC")]
    pub sync: Option<String>,

    /// Keep local hosts the provider no longer reports when syncing
    #[arg(long, requires = "sync")]
    pub retain: bool,

    /// Only show hosts matching a filter expression
    #[arg(long)]
    pub filter: Option<String>,
}

impl InventoryArgs {
    /// Execute the inventory command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let filter = self
            .filter
            .as_deref()
            .map(Filter::parse)
            .transpose()
            .map_err(broker::Error::from)?;

        if let Some(spec) = &self.sync {
            let summary = ctx.broker().sync_inventory(spec, self.retain).await?;
            ctx.output.info(&format!(
                "Synced {spec}: {} added, {} updated, {} removed",
                summary.added.len(),
                summary.updated.len(),
                summary.removed.len()
            ));
        }

        let hosts = ctx.broker().inventory(filter.as_ref())?;
        if self.details {
            let values: Vec<_> = hosts.iter().map(|h| h.to_value()).collect();
            ctx.output.data(&values)?;
        } else if self.list {
            ctx.output
                .hosts_list(&hosts, &ctx.config.inventory_list_vars)?;
        } else {
            ctx.output
                .hosts_table(&hosts, &ctx.config.inventory_fields)?;
        }
        Ok(0)
    }
}

#[async_trait::async_trait]
impl Runnable for InventoryArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_args_parsing() {
        let args =
            InventoryArgs::try_parse_from(["inventory", "--sync", "TestProvider", "--retain"])
                .unwrap();
        assert_eq!(args.sync.as_deref(), Some("TestProvider"));
        assert!(args.retain);
    }

    #[test]
    fn test_retain_requires_sync() {
        assert!(InventoryArgs::try_parse_from(["inventory", "--retain"]).is_err());
        assert!(InventoryArgs::try_parse_from(["inventory", "--details", "--list"]).is_err());
    }
}
