//! Providers command - query a provider or list what is available
//!
//! `broker providers` lists registered providers and their arguments;
//! `broker providers TestProvider hosts` asks one provider a question.

use super::{CommandContext, Runnable};
use crate::cli::parse_provider_args;
use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};

/// Arguments for the providers command
#[derive(Parser, Debug, Clone)]
pub struct ProvidersArgs {
    /// Provider (`Name` or `Name::instance`); omit to list providers
    pub provider: Option<String>,

    /// Query flags (`hosts`) or key=value arguments
    #[arg(value_name = "QUERY")]
    pub query: Vec<String>,
}

impl ProvidersArgs {
    /// Execute the providers command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let Some(provider) = &self.provider else {
            return self.list(ctx);
        };

        let (assignments, flags): (Vec<&String>, Vec<&String>) =
            self.query.iter().partition(|item| item.contains('='));
        let mut query = parse_provider_args(&assignments)?;
        for flag in flags {
            query.insert(flag.clone(), Value::Bool(true));
        }

        let result = ctx.broker().provider_info(provider, query).await?;
        ctx.output.data(&result)?;
        Ok(0)
    }

    fn list(&self, ctx: &mut CommandContext) -> Result<i32> {
        let registry = ctx.broker().registry();
        let listing: Vec<Value> = registry
            .names()
            .into_iter()
            .map(|name| {
                json!({
                    "name": name,
                    "arguments": registry.arguments(name).unwrap_or_default(),
                })
            })
            .collect();
        ctx.output.data(&listing)?;
        Ok(0)
    }
}

#[async_trait::async_trait]
impl Runnable for ProvidersArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_providers_args_parsing() {
        let args = ProvidersArgs::try_parse_from(["providers", "TestProvider", "hosts", "limit=2"])
            .unwrap();
        assert_eq!(args.provider.as_deref(), Some("TestProvider"));
        assert_eq!(args.query, vec!["hosts", "limit=2"]);

        let args = ProvidersArgs::try_parse_from(["providers"]).unwrap();
        assert!(args.provider.is_none());
    }
}
