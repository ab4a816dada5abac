//! Inventory store for Broker.
//!
//! The inventory is the durable record of every host Broker currently holds:
//! - one YAML file, a sequence of host records, human-editable
//! - unique identity (hostname, else name) per record
//! - every mutation is a load-modify-save cycle under the file lock
//! - saves are atomic (temp file + rename), so readers never see a torn file
//!
//! Nothing in this module talks to a provider; syncing takes the provider's
//! reported host list as input so the lock is never held across a network
//! call.

pub mod filter;
pub mod host;
pub mod lock;

pub use filter::{matches, Condition, Filter, FilterError, Predicate};
pub use host::{HostRecord, UNKNOWN_FIELD};
pub use lock::InventoryLock;

use serde_json::Value;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Errors that can occur during inventory operations
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("inventory file {} is malformed: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("could not acquire inventory lock {} within {waited:?}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
}

/// Result type for inventory operations
pub type InventoryResult<T> = Result<T, InventoryError>;

/// What a sync changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Identities that were not in the store before
    pub added: Vec<String>,
    /// Identities that were merged with an existing record
    pub updated: Vec<String>,
    /// Identities dropped because the provider no longer reports them
    pub removed: Vec<String>,
}

/// The persisted host inventory
#[derive(Debug)]
pub struct InventoryStore {
    path: PathBuf,
    lock_timeout: Duration,
    /// Serializes mutations from this process before they contend on the file lock
    local: tokio::sync::Mutex<()>,
}

impl InventoryStore {
    /// Create a store over `path`
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
            local: tokio::sync::Mutex::new(()),
        }
    }

    /// Create the store configured for this run
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.inventory_file(), config.lock_timeout)
    }

    /// Inventory file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the inventory file. A missing file is an empty inventory;
    /// entries that are not valid host records are discarded with a warning.
    pub fn load(&self) -> InventoryResult<Vec<HostRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        self.parse(&content)
    }

    fn parse(&self, content: &str) -> InventoryResult<Vec<HostRecord>> {
        let document: Option<Value> =
            serde_yaml::from_str(content).map_err(|e| InventoryError::Malformed {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        let entries = match document {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(InventoryError::Malformed {
                    path: self.path.clone(),
                    message: "expected a sequence of host records".to_string(),
                })
            }
        };

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match HostRecord::from_value(entry) {
                Ok(record) => {
                    if seen.insert(record.identity().to_string()) {
                        records.push(record);
                    } else {
                        warn!(
                            "Discarding duplicate inventory entry {index} for '{}'",
                            record.identity()
                        );
                    }
                }
                Err(reason) => {
                    warn!("Discarding malformed inventory entry {index}: {reason}");
                }
            }
        }
        Ok(records)
    }

    /// Atomically replace the inventory file with `records`.
    ///
    /// Callers mutating the store should go through [`InventoryStore::update`],
    /// which holds the lock around load and save.
    pub fn save(&self, records: &[HostRecord]) -> InventoryResult<()> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&directory)?;

        let mut temp = tempfile::NamedTempFile::new_in(&directory)?;
        serde_yaml::to_writer(&mut temp, records)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| InventoryError::Io(e.error))?;
        debug!(path = %self.path.display(), count = records.len(), "Inventory saved");
        Ok(())
    }

    /// Run one load-modify-save cycle under the inventory lock
    pub async fn update<T, F>(&self, modify: F) -> InventoryResult<T>
    where
        F: FnOnce(&mut Vec<HostRecord>) -> T,
    {
        let _local = self.local.lock().await;
        let _lock = InventoryLock::acquire(&self.path, self.lock_timeout).await?;
        let mut records = self.load()?;
        let result = modify(&mut records);
        self.save(&records)?;
        Ok(result)
    }

    /// Add records; a record whose identity is already stored is merged
    /// into the existing entry, with the incoming fields winning
    pub async fn add(&self, incoming: Vec<HostRecord>) -> InventoryResult<()> {
        self.update(|records| upsert(records, incoming)).await
    }

    /// Remove records by identity, returning the removed ones
    pub async fn remove(&self, identities: &[String]) -> InventoryResult<Vec<HostRecord>> {
        self.update(|records| {
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(records)
                .into_iter()
                .partition(|r| identities.iter().any(|id| r.is_named(id)));
            *records = kept;
            removed
        })
        .await
    }

    /// Merge a provider's reported hosts into the store
    pub async fn sync(
        &self,
        provider: &str,
        instance: Option<&str>,
        reported: Vec<HostRecord>,
        retain: bool,
    ) -> InventoryResult<SyncSummary> {
        let summary = self
            .update(|records| merge_sync(records, provider, instance, reported, retain))
            .await?;
        info!(
            provider,
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            "Inventory synced"
        );
        Ok(summary)
    }

    /// Overwrite the whole store with `records`
    pub async fn replace(&self, records: Vec<HostRecord>) -> InventoryResult<()> {
        self.update(|stored| *stored = records).await
    }

    /// Empty the store
    pub async fn clear(&self) -> InventoryResult<()> {
        self.update(Vec::clear).await
    }

    /// Read the store, narrowed by an optional filter
    pub fn query(&self, filter: Option<&Filter>) -> InventoryResult<Vec<HostRecord>> {
        let records = self.load()?;
        Ok(match filter {
            Some(filter) => filter.apply(&records),
            None => records,
        })
    }
}

/// Insert or merge records by identity
pub fn upsert(records: &mut Vec<HostRecord>, incoming: Vec<HostRecord>) {
    for record in incoming {
        match records
            .iter_mut()
            .find(|existing| existing.identity() == record.identity())
        {
            Some(existing) => existing.merge_from(record),
            None => records.push(record),
        }
    }
}

/// Merge `reported` (the provider's authoritative list) into `records`.
///
/// Matching records take every reported field and keep local-only ones.
/// Records of this provider (and instance, when given) the provider did not
/// report are dropped unless `retain` is set. Other providers' records are
/// untouched.
pub fn merge_sync(
    records: &mut Vec<HostRecord>,
    provider: &str,
    instance: Option<&str>,
    reported: Vec<HostRecord>,
    retain: bool,
) -> SyncSummary {
    let mut summary = SyncSummary::default();
    let reported_ids: HashSet<String> = reported
        .iter()
        .map(|r| r.identity().to_string())
        .collect();

    if !retain {
        records.retain(|record| {
            let owned = record.provider.as_deref() == Some(provider)
                && instance.map_or(true, |inst| record.provider_instance.as_deref() == Some(inst));
            if owned && !reported_ids.contains(record.identity()) {
                summary.removed.push(record.identity().to_string());
                false
            } else {
                true
            }
        });
    }

    for mut record in reported {
        if !record.has_identity() {
            warn!("Provider {provider} reported a host without identity; skipping");
            continue;
        }
        if record.provider.is_none() {
            record.provider = Some(provider.to_string());
        }
        if record.provider_instance.is_none() {
            record.provider_instance = instance.map(str::to_string);
        }
        match records
            .iter_mut()
            .find(|existing| existing.identity() == record.identity())
        {
            Some(existing) => {
                summary.updated.push(record.identity().to_string());
                existing.merge_from(record);
            }
            None => {
                summary.added.push(record.identity().to_string());
                records.push(record);
            }
        }
    }
    summary
}
