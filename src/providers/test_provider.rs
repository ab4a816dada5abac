//! In-process provider for exercising the lifecycle without a backend.
//!
//! `TestProvider` fabricates hosts with unique hostnames, keeps them in
//! memory until they are checked in, and supports every optional
//! capability. Settings (under `providers.TestProvider`):
//!
//! - `prefix`: hostname prefix (default `test`)
//! - `fail_on`: 1-based checkout ordinals that fail, e.g. `[4, 5]`
//! - `lease`: lease length added by `extend` (humantime, default `1h`)

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::{
    ArgumentSpec, Args, Capabilities, ExecuteOutput, Provider, ProviderError, ProviderResult,
    Release,
};
use crate::inventory::HostRecord;

/// Stub provider backed by memory
#[derive(Debug)]
pub struct TestProvider {
    instance: Option<String>,
    prefix: String,
    fail_on: HashSet<usize>,
    lease: std::time::Duration,
    checkouts: AtomicUsize,
    live: Mutex<IndexMap<String, HostRecord>>,
}

impl TestProvider {
    /// Registered provider name
    pub const NAME: &'static str = "TestProvider";

    /// Build from instance settings
    pub fn new(instance: Option<String>, settings: &Args) -> Self {
        let prefix = settings
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or("test")
            .to_string();
        let fail_on = settings
            .get("fail_on")
            .and_then(Value::as_array)
            .map(|ordinals| {
                ordinals
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|n| usize::try_from(n).ok())
                    .collect()
            })
            .unwrap_or_default();
        let lease = settings
            .get("lease")
            .and_then(Value::as_str)
            .and_then(|text| humantime_serde::re::humantime::parse_duration(text).ok())
            .unwrap_or(std::time::Duration::from_secs(3600));
        Self {
            instance,
            prefix,
            fail_on,
            lease,
            checkouts: AtomicUsize::new(0),
            live: Mutex::new(IndexMap::new()),
        }
    }

    /// Accepted arguments
    pub fn argument_specs() -> Vec<ArgumentSpec> {
        vec![
            ArgumentSpec::selecting("test_action", "Route the request to the test provider"),
            ArgumentSpec::optional("prefix", "Hostname prefix for this checkout"),
            ArgumentSpec::optional("fail", "Fail this request when true"),
        ]
    }

    /// Hosts currently checked out from this provider
    pub fn live_hosts(&self) -> Vec<HostRecord> {
        self.live.lock().values().cloned().collect()
    }

    fn fabricate(&self, args: &Args) -> HostRecord {
        let prefix = args
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or(&self.prefix);
        let short = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{prefix}-{}", &short[..8]);
        let mut host = HostRecord::new(format!("{name}.test.example.com"))
            .with_attribute("checked_out_at", json!(Utc::now().to_rfc3339()));
        host.name = Some(name);
        host
    }
}

#[async_trait]
impl Provider for TestProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    fn arguments(&self) -> Vec<ArgumentSpec> {
        Self::argument_specs()
    }

    fn accepts_extra_arguments(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            extend: true,
            execute: true,
            inventory: true,
        }
    }

    async fn checkout(&self, args: &Args) -> ProviderResult<HostRecord> {
        let ordinal = self.checkouts.fetch_add(1, Ordering::SeqCst) + 1;
        let forced = args.get("fail").and_then(Value::as_bool).unwrap_or(false);
        if forced || self.fail_on.contains(&ordinal) {
            return Err(ProviderError::rejected(
                Self::NAME,
                format!("checkout #{ordinal} refused"),
            ));
        }

        let host = self.fabricate(args);
        debug!(host = %host.identity(), ordinal, "Test host checked out");
        self.live
            .lock()
            .insert(host.identity().to_string(), host.clone());
        Ok(host)
    }

    async fn checkin(&self, host: &HostRecord) -> ProviderResult<Release> {
        Ok(match self.live.lock().shift_remove(host.identity()) {
            Some(_) => Release::Released,
            None => Release::AlreadyReleased,
        })
    }

    async fn extend(&self, host: &HostRecord, _args: &Args) -> ProviderResult<bool> {
        let lease = ChronoDuration::from_std(self.lease)
            .map_err(|e| ProviderError::rejected(Self::NAME, e.to_string()))?;
        let expires = (Utc::now() + lease).to_rfc3339();
        let mut live = self.live.lock();
        match live.get_mut(host.identity()) {
            Some(record) => {
                record
                    .attributes
                    .insert("lease_expires_at".to_string(), json!(expires));
                Ok(true)
            }
            None => Err(ProviderError::rejected(
                Self::NAME,
                format!("no live host '{}'", host.identity()),
            )),
        }
    }

    async fn execute(&self, args: &Args) -> ProviderResult<ExecuteOutput> {
        if args.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ProviderError::rejected(Self::NAME, "execute refused"));
        }
        Ok(ExecuteOutput {
            result: json!({"provider": Self::NAME, "arguments": args}),
            artifacts: vec![
                json!({"job": 1, "status": "successful", "data": {"first": true}}),
                json!({"job": 2, "status": "successful", "data": {"second": true}}),
            ],
        })
    }

    async fn info(&self, query: &Args) -> ProviderResult<Value> {
        let live = self.live.lock();
        if query.get("hosts").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(json!(live.keys().collect::<Vec<_>>()));
        }
        Ok(json!({
            "name": Self::NAME,
            "instance": self.instance,
            "prefix": self.prefix,
            "live_hosts": live.len(),
            "query": query,
        }))
    }

    async fn inventory(&self, _extra: Option<&str>) -> ProviderResult<Vec<HostRecord>> {
        Ok(self.live_hosts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(value: Value) -> Args {
        match value {
            Value::Object(map) => map,
            _ => Args::new(),
        }
    }

    #[tokio::test]
    async fn test_checkout_and_checkin() {
        let provider = TestProvider::new(None, &Args::new());
        let host = provider.checkout(&Args::new()).await.unwrap();
        assert!(host.identity().ends_with(".test.example.com"));
        assert!(host.name.as_deref().unwrap().starts_with("test-"));
        assert_eq!(provider.live_hosts().len(), 1);

        assert_eq!(provider.checkin(&host).await.unwrap(), Release::Released);
        assert_eq!(
            provider.checkin(&host).await.unwrap(),
            Release::AlreadyReleased
        );
    }

    #[tokio::test]
    async fn test_fail_on_ordinals() {
        let provider = TestProvider::new(None, &settings(json!({"fail_on": [2]})));
        assert!(provider.checkout(&Args::new()).await.is_ok());
        assert!(provider.checkout(&Args::new()).await.is_err());
        assert!(provider.checkout(&Args::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_extend_sets_lease() {
        let provider = TestProvider::new(None, &settings(json!({"lease": "2h"})));
        let host = provider.checkout(&Args::new()).await.unwrap();
        assert!(provider.extend(&host, &Args::new()).await.unwrap());
        assert!(provider.live_hosts()[0]
            .attribute("lease_expires_at")
            .is_some());
        assert!(provider
            .extend(&HostRecord::new("ghost"), &Args::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_execute_artifacts() {
        let provider = TestProvider::new(None, &Args::new());
        let output = provider
            .execute(&settings(json!({"job": "patch"})))
            .await
            .unwrap();
        assert_eq!(output.artifacts.len(), 2);
        assert_eq!(output.result["arguments"]["job"], json!("patch"));
    }
}
