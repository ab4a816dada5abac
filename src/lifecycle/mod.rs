//! Host lifecycle manager.
//!
//! [`Broker`] is the orchestration core: it resolves which provider a
//! request is for, fans provider calls out over a bounded worker pool, and
//! keeps the inventory store in step with what was actually acquired or
//! released.
//!
//! # Guarantees
//!
//! - each successful checkout is recorded the moment it lands; a later
//!   failure never rolls back an acquired host
//! - each successful checkin removes exactly that host, regardless of how
//!   its siblings fared
//! - a host the provider no longer knows counts as released
//! - the inventory lock is never held across a provider call
//! - provider failures are not retried; only session connects are

pub mod background;
pub mod parallel;
pub mod selector;

pub use background::{detach, BackgroundTicket};
pub use selector::HostSelector;

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{merge_values, Config};
use crate::connection::{SessionFactory, TransportFactory};
use crate::error::{Error, HostFailure, Result};
use crate::inventory::{Filter, HostRecord, InventoryStore, SyncSummary};
use crate::providers::{
    strip_reserved, validate_arguments, Args, Provider, ProviderRef, ProviderRegistry, Release,
};
use parallel::run_bounded;

/// How `execute` combines the outputs of a provider's nested calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactsPolicy {
    /// Deep-merge every artifact, later values winning
    Merge,
    /// Keep only the most recent artifact
    Last,
}

impl ArtifactsPolicy {
    /// Parse `merge` / `last`
    pub fn parse(text: &str) -> Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "last" => Ok(Self::Last),
            other => Err(Error::validation(format!(
                "unknown artifacts policy '{other}' (expected merge or last)"
            ))),
        }
    }
}

struct Inner {
    config: Arc<Config>,
    registry: ProviderRegistry,
    store: InventoryStore,
    sessions: Arc<dyn SessionFactory>,
}

/// The host lifecycle manager; cheap to clone
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("inventory", &self.inner.store.path())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Broker with the built-in providers and the configured transport
    pub fn new(config: Arc<Config>) -> Self {
        let registry = ProviderRegistry::with_builtins(Arc::clone(&config));
        let store = InventoryStore::from_config(&config);
        let sessions = Arc::new(TransportFactory::new(config.ssh.clone()));
        Self::from_parts(config, registry, store, sessions)
    }

    /// Broker from explicit parts
    pub fn from_parts(
        config: Arc<Config>,
        registry: ProviderRegistry,
        store: InventoryStore,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                sessions,
            }),
        }
    }

    /// Effective settings
    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Provider registry
    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    /// Inventory store
    pub fn store(&self) -> &InventoryStore {
        &self.inner.store
    }

    /// Session factory for the `ssh`/`scp`/`sftp` actions
    pub fn sessions(&self) -> &Arc<dyn SessionFactory> {
        &self.inner.sessions
    }

    /// Hand an operation on this broker to a background task.
    ///
    /// Returns immediately; the outcome only reaches the log and the
    /// inventory store.
    pub fn detach<T, F, Fut>(&self, label: &str, operation: F) -> BackgroundTicket
    where
        T: std::fmt::Debug + Send + 'static,
        F: FnOnce(Broker) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        detach(label, operation(self.clone()))
    }

    fn worker_limit(&self, items: usize, sequential: bool) -> usize {
        if sequential {
            1
        } else {
            self.inner.config.worker_limit(items)
        }
    }

    // ========================================================================
    // Checkout
    // ========================================================================

    /// Acquire `count` hosts (from the `count`/`_count` argument or the
    /// nick's bundle, default 1).
    ///
    /// Fails with [`Error::Checkout`] if any request failed; the error
    /// carries every host that was acquired, all of which are already in the
    /// inventory.
    #[instrument(skip(self, args))]
    pub async fn checkout(&self, args: Args) -> Result<Vec<HostRecord>> {
        let merged = self.inner.registry.apply_nick(&args)?;
        let count = requested_count(&merged)?;
        let (provider, cleaned) = self.inner.registry.resolve(&merged)?;
        self.checkout_resolved(provider, cleaned, count).await
    }

    /// Checkout several named targets at once, grouped by name.
    ///
    /// Every request is validated before any provider is called.
    pub async fn checkout_many(
        &self,
        requests: IndexMap<String, Args>,
    ) -> Result<IndexMap<String, Vec<HostRecord>>> {
        let mut resolved = Vec::with_capacity(requests.len());
        for (label, args) in requests {
            let merged = self.inner.registry.apply_nick(&args)?;
            let count = requested_count(&merged)?;
            let (provider, cleaned) = self.inner.registry.resolve(&merged)?;
            resolved.push((label, provider, cleaned, count));
        }

        let outcomes = futures::future::join_all(resolved.into_iter().map(
            |(label, provider, cleaned, count)| async move {
                (label, self.checkout_resolved(provider, cleaned, count).await)
            },
        ))
        .await;

        let mut grouped = IndexMap::new();
        let mut acquired = Vec::new();
        let mut failures = Vec::new();
        for (label, outcome) in outcomes {
            match outcome {
                Ok(hosts) => {
                    acquired.extend(hosts.iter().cloned());
                    grouped.insert(label, hosts);
                }
                Err(Error::Checkout {
                    acquired: partial,
                    failures: failed,
                }) => {
                    acquired.extend(partial);
                    failures.extend(failed.into_iter().map(|f| HostFailure {
                        host: format!("{label}: {}", f.host),
                        error: f.error,
                    }));
                }
                Err(other) => failures.push(HostFailure {
                    host: label,
                    error: other,
                }),
            }
        }
        if failures.is_empty() {
            Ok(grouped)
        } else {
            Err(checkout_failed(acquired, failures))
        }
    }

    async fn checkout_resolved(
        &self,
        provider: Arc<dyn Provider>,
        args: Args,
        count: usize,
    ) -> Result<Vec<HostRecord>> {
        info!(
            provider = provider.name(),
            count, "Checking out {count} host(s)"
        );
        let args = Arc::new(args);
        let broker = self.clone();
        let limit = self.worker_limit(count, false);

        let results = run_bounded((1..=count).collect(), limit, move |ordinal: usize| {
            let provider = Arc::clone(&provider);
            let args = Arc::clone(&args);
            let broker = broker.clone();
            async move {
                let mut host = provider.checkout(&args).await.map_err(Error::from)?;
                host.provider = Some(provider.name().to_string());
                host.provider_instance = provider.instance().map(str::to_string);
                host.broker_args = Some(args.as_ref().clone());
                if !host.has_identity() {
                    return Err(Error::Provider(crate::providers::ProviderError::rejected(
                        provider.name(),
                        format!("checkout #{ordinal} returned a host without hostname or name"),
                    )));
                }
                broker.inner.store.add(vec![host.clone()]).await?;
                debug!(host = %host.identity(), "Recorded checked-out host");
                Ok(host)
            }
        })
        .await;

        let mut acquired = Vec::new();
        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(host) => acquired.push(host),
                Err(error) => failures.push(HostFailure {
                    host: format!("checkout #{}", index + 1),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(acquired)
        } else {
            Err(checkout_failed(acquired, failures))
        }
    }

    /// Re-run checkout with each selected host's stored `_broker_args`.
    ///
    /// Hosts without stored arguments are skipped with a warning.
    #[instrument(skip(self, filter))]
    pub async fn duplicate(
        &self,
        selector: &HostSelector,
        filter: Option<&Filter>,
        count: Option<usize>,
    ) -> Result<Vec<HostRecord>> {
        let hosts = self.select(selector, filter)?;
        let mut acquired = Vec::new();
        let mut failures = Vec::new();

        for host in hosts {
            let Some(stored) = host.broker_args.clone() else {
                warn!("Host {} has no stored checkout arguments; skipping", host.identity());
                continue;
            };
            let count = match count {
                Some(count) => count,
                None => requested_count(&stored)?,
            };
            let provider = self.inner.registry.for_host(&host)?;
            let cleaned = strip_reserved(&stored);
            validate_arguments(provider.as_ref(), &cleaned)?;

            match self.checkout_resolved(provider, cleaned, count).await {
                Ok(hosts) => acquired.extend(hosts),
                Err(Error::Checkout {
                    acquired: partial,
                    failures: failed,
                }) => {
                    acquired.extend(partial);
                    failures.extend(failed);
                }
                Err(other) => return Err(other),
            }
        }

        if failures.is_empty() {
            Ok(acquired)
        } else {
            Err(checkout_failed(acquired, failures))
        }
    }

    // ========================================================================
    // Checkin / Extend
    // ========================================================================

    /// Stored hosts picked by `selector`, after `filter`
    pub fn select(
        &self,
        selector: &HostSelector,
        filter: Option<&Filter>,
    ) -> Result<Vec<HostRecord>> {
        let records = self.inner.store.load()?;
        selector.select(&records, filter)
    }

    /// Release the selected hosts
    #[instrument(skip(self, filter))]
    pub async fn checkin(
        &self,
        selector: &HostSelector,
        filter: Option<&Filter>,
        sequential: bool,
    ) -> Result<bool> {
        let hosts = self.select(selector, filter)?;
        self.checkin_hosts(hosts, sequential).await
    }

    /// Release `hosts`, removing each from the inventory as it succeeds
    pub async fn checkin_hosts(&self, hosts: Vec<HostRecord>, sequential: bool) -> Result<bool> {
        if hosts.is_empty() {
            return Ok(true);
        }
        info!("Checking in {} host(s)", hosts.len());
        let labels: Vec<String> = hosts.iter().map(|h| h.identity().to_string()).collect();
        let limit = self.worker_limit(hosts.len(), sequential);
        let broker = self.clone();

        let results = run_bounded(hosts, limit, move |host: HostRecord| {
            let broker = broker.clone();
            async move {
                let provider = broker.inner.registry.for_host(&host)?;
                match provider.checkin(&host).await? {
                    Release::Released => info!("Checked in {}", host.identity()),
                    Release::AlreadyReleased => {
                        info!("{} was already released by {}", host.identity(), provider.name());
                    }
                }
                broker
                    .inner
                    .store
                    .remove(&[host.identity().to_string()])
                    .await?;
                Ok(())
            }
        })
        .await;

        collect_host_failures("checkin", &labels, results)
    }

    /// Extend the leases of the selected hosts
    #[instrument(skip(self, filter, args))]
    pub async fn extend(
        &self,
        selector: &HostSelector,
        filter: Option<&Filter>,
        args: Args,
        sequential: bool,
    ) -> Result<bool> {
        let hosts = self.select(selector, filter)?;
        self.extend_hosts(hosts, args, sequential).await
    }

    /// Extend `hosts`; a provider without the capability fails only its own hosts
    pub async fn extend_hosts(
        &self,
        hosts: Vec<HostRecord>,
        args: Args,
        sequential: bool,
    ) -> Result<bool> {
        if hosts.is_empty() {
            return Ok(true);
        }
        let labels: Vec<String> = hosts.iter().map(|h| h.identity().to_string()).collect();
        let limit = self.worker_limit(hosts.len(), sequential);
        let broker = self.clone();
        let args = Arc::new(args);

        let results = run_bounded(hosts, limit, move |host: HostRecord| {
            let broker = broker.clone();
            let args = Arc::clone(&args);
            async move {
                let provider = broker.inner.registry.for_host(&host)?;
                if !provider.capabilities().extend {
                    return Err(Error::UnsupportedOperation {
                        provider: provider.name().to_string(),
                        operation: "extend".to_string(),
                    });
                }
                let extended = provider.extend(&host, &args).await?;
                info!("Extended {}: {extended}", host.identity());
                Ok(())
            }
        })
        .await;

        collect_host_failures("extend", &labels, results)
    }

    // ========================================================================
    // Execute / Query
    // ========================================================================

    /// Run a provider action. The inventory is not touched.
    ///
    /// `artifacts` overrides an `artifacts` argument; with neither, the
    /// provider's plain result is returned.
    #[instrument(skip(self, args))]
    pub async fn execute(&self, args: Args, artifacts: Option<ArtifactsPolicy>) -> Result<Value> {
        let args = self.inner.registry.apply_nick(&args)?;
        let policy = match artifacts {
            Some(policy) => Some(policy),
            None => args
                .get("artifacts")
                .and_then(Value::as_str)
                .map(ArtifactsPolicy::parse)
                .transpose()?,
        };
        let (provider, cleaned) = self.inner.registry.resolve(&args)?;
        if !provider.capabilities().execute {
            return Err(Error::UnsupportedOperation {
                provider: provider.name().to_string(),
                operation: "execute".to_string(),
            });
        }
        let output = provider.execute(&cleaned).await?;
        Ok(match policy {
            None => output.result,
            Some(ArtifactsPolicy::Last) => {
                output.artifacts.into_iter().last().unwrap_or(output.result)
            }
            Some(ArtifactsPolicy::Merge) => {
                if output.artifacts.is_empty() {
                    output.result
                } else {
                    output
                        .artifacts
                        .into_iter()
                        .fold(Value::Object(Args::new()), |mut merged, artifact| {
                            merge_values(&mut merged, artifact);
                            merged
                        })
                }
            }
        })
    }

    /// Ask a provider about itself
    pub async fn provider_info(&self, spec: &str, query: Args) -> Result<Value> {
        let provider = self.inner.registry.get(&ProviderRef::parse(spec))?;
        Ok(provider.info(&query).await?)
    }

    /// Stored hosts, optionally filtered
    pub fn inventory(&self, filter: Option<&Filter>) -> Result<Vec<HostRecord>> {
        Ok(self.inner.store.query(filter)?)
    }

    /// Pull a provider's host list into the inventory.
    ///
    /// `spec` is `Provider[::instance][:extra]`; `extra` is passed through to
    /// the provider's inventory call.
    #[instrument(skip(self))]
    pub async fn sync_inventory(&self, spec: &str, retain: bool) -> Result<SyncSummary> {
        let (provider_ref, extra) = parse_sync_spec(spec);
        let provider = self.inner.registry.get(&provider_ref)?;
        if !provider.capabilities().inventory {
            return Err(Error::UnsupportedOperation {
                provider: provider.name().to_string(),
                operation: "inventory".to_string(),
            });
        }
        let reported = provider.inventory(extra.as_deref()).await?;
        Ok(self
            .inner
            .store
            .sync(provider.name(), provider.instance(), reported, retain)
            .await?)
    }
}

/// `Provider[::instance][:extra]`
pub fn parse_sync_spec(spec: &str) -> (ProviderRef, Option<String>) {
    let (name, rest) = match spec.split_once("::") {
        Some((name, rest)) => (name, Some(rest)),
        None => match spec.split_once(':') {
            Some((name, extra)) => {
                return (ProviderRef::parse(name), Some(extra.to_string()).filter(|e| !e.is_empty()))
            }
            None => (spec, None),
        },
    };
    let (instance, extra) = match rest {
        Some(rest) => match rest.split_once(':') {
            Some((instance, extra)) => (Some(instance), Some(extra)),
            None => (Some(rest), None),
        },
        None => (None, None),
    };
    (
        ProviderRef {
            name: name.trim().to_string(),
            instance: instance.filter(|i| !i.is_empty()).map(str::to_string),
        },
        extra.filter(|e| !e.is_empty()).map(str::to_string),
    )
}

/// `count` or `_count`, default 1
pub fn requested_count(args: &Args) -> Result<usize> {
    let raw = args.get("count").or_else(|| args.get("_count"));
    let count = match raw {
        None | Some(Value::Null) => 1,
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::validation(format!("invalid count {n}")))?,
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid count '{s}'")))?,
        Some(other) => return Err(Error::validation(format!("invalid count {other}"))),
    };
    if count == 0 {
        return Err(Error::validation("count must be at least 1"));
    }
    Ok(count)
}

fn checkout_failed(acquired: Vec<HostRecord>, failures: Vec<HostFailure>) -> Error {
    for failure in &failures {
        error!("{failure}");
    }
    if !acquired.is_empty() {
        let names: Vec<&str> = acquired.iter().map(HostRecord::identity).collect();
        error!(
            "Checkout partially failed; these hosts were acquired and still need checkin: {}",
            names.join(", ")
        );
    }
    Error::Checkout { acquired, failures }
}

fn collect_host_failures(
    operation: &str,
    labels: &[String],
    results: Vec<Result<()>>,
) -> Result<bool> {
    let failures: Vec<HostFailure> = labels
        .iter()
        .zip(results)
        .filter_map(|(label, result)| {
            result.err().map(|error| {
                error!("{operation} failed for {label}: {error}");
                HostFailure {
                    host: label.clone(),
                    error,
                }
            })
        })
        .collect();
    if failures.is_empty() {
        Ok(true)
    } else {
        Err(Error::HostFailures {
            operation: operation.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        match value {
            Value::Object(map) => map,
            _ => Args::new(),
        }
    }

    #[test]
    fn test_requested_count() {
        assert_eq!(requested_count(&Args::new()).unwrap(), 1);
        assert_eq!(requested_count(&args(json!({"count": 3}))).unwrap(), 3);
        assert_eq!(requested_count(&args(json!({"_count": "2"}))).unwrap(), 2);
        assert!(requested_count(&args(json!({"count": 0}))).is_err());
        assert!(requested_count(&args(json!({"count": "many"}))).is_err());
    }

    #[test]
    fn test_parse_sync_spec() {
        let (p, extra) = parse_sync_spec("Container");
        assert_eq!((p.name.as_str(), p.instance, extra), ("Container", None, None));

        let (p, extra) = parse_sync_spec("AnsibleTower::prod:my-user");
        assert_eq!(p.name, "AnsibleTower");
        assert_eq!(p.instance.as_deref(), Some("prod"));
        assert_eq!(extra.as_deref(), Some("my-user"));

        let (p, extra) = parse_sync_spec("Beaker:jobs");
        assert_eq!(p.name, "Beaker");
        assert_eq!(p.instance, None);
        assert_eq!(extra.as_deref(), Some("jobs"));
    }

    #[test]
    fn test_artifacts_policy_parse() {
        assert_eq!(ArtifactsPolicy::parse("merge").unwrap(), ArtifactsPolicy::Merge);
        assert_eq!(ArtifactsPolicy::parse("LAST").unwrap(), ArtifactsPolicy::Last);
        assert!(ArtifactsPolicy::parse("first").is_err());
    }
}
