//! Host record definition for the Broker inventory.
//!
//! A `HostRecord` is plain structured data: identity, owning provider and
//! instance, the arguments it was checked out with, and whatever attributes
//! the provider reported. It never holds handles or backend-specific state,
//! so it can be persisted, sent to a worker, or rendered into a template
//! as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder shown for display fields a record does not carry.
pub const UNKNOWN_FIELD: &str = "Unknown";

/// One checked-out resource
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostRecord {
    /// Network hostname, the primary identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Generated or provider-assigned name, used as identity when there is no hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Owning provider
    #[serde(
        rename = "_broker_provider",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub provider: Option<String>,

    /// Owning provider instance
    #[serde(
        rename = "_broker_provider_instance",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_instance: Option<String>,

    /// Arguments the host was checked out with
    #[serde(
        rename = "_broker_args",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub broker_args: Option<Map<String, Value>>,

    /// Provider-specific attributes
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl HostRecord {
    /// Create a record identified by hostname
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Self::default()
        }
    }

    /// Create a record identified only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the owning provider and instance
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>, instance: Option<String>) -> Self {
        self.provider = Some(provider.into());
        self.provider_instance = instance;
        self
    }

    /// Set an attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Unique key within an inventory: hostname, else name
    pub fn identity(&self) -> &str {
        self.hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    /// A record without any identity cannot be stored
    pub fn has_identity(&self) -> bool {
        !self.identity().is_empty()
    }

    /// Whether `selector` names this record by hostname or name
    pub fn is_named(&self, selector: &str) -> bool {
        self.hostname.as_deref() == Some(selector) || self.name.as_deref() == Some(selector)
    }

    /// Look up a top-level provider attribute
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// The whole record as one JSON mapping, in persisted field names
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a record from a JSON value, rejecting ones without identity
    pub fn from_value(value: Value) -> Result<Self, String> {
        let record: HostRecord = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if record.has_identity() {
            Ok(record)
        } else {
            Err("record has neither hostname nor name".to_string())
        }
    }

    /// Resolve a dotted attribute path (`_broker_args.template`, `os.version`)
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let root = match first {
            "hostname" => self.hostname.clone().map(Value::String),
            "name" => self.name.clone().map(Value::String),
            "_broker_provider" => self.provider.clone().map(Value::String),
            "_broker_provider_instance" => self.provider_instance.clone().map(Value::String),
            "_broker_args" => self.broker_args.clone().map(Value::Object),
            key => self.attributes.get(key).cloned(),
        }?;
        segments.try_fold(root, |current, segment| match current {
            Value::Object(mut map) => map.remove(segment),
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                (index < items.len()).then(|| items.swap_remove(index))
            }
            _ => None,
        })
    }

    /// Fold a newer view of the same host into this one. Fields present in
    /// `newer` win; fields only this record carries are kept.
    pub fn merge_from(&mut self, newer: HostRecord) {
        if newer.hostname.is_some() {
            self.hostname = newer.hostname;
        }
        if newer.name.is_some() {
            self.name = newer.name;
        }
        if newer.provider.is_some() {
            self.provider = newer.provider;
        }
        if newer.provider_instance.is_some() {
            self.provider_instance = newer.provider_instance;
        }
        if newer.broker_args.is_some() {
            self.broker_args = newer.broker_args;
        }
        for (key, value) in newer.attributes {
            self.attributes.insert(key, value);
        }
    }

    /// Render a display field expression.
    ///
    /// `a | b` picks the first alternative that resolves to anything;
    /// whitespace-separated paths within an alternative are joined with a
    /// space. Nothing resolving yields [`UNKNOWN_FIELD`].
    pub fn display_field(&self, expression: &str) -> String {
        for alternative in expression.split('|') {
            let parts: Vec<String> = alternative
                .split_whitespace()
                .filter_map(|path| self.lookup(path))
                .filter_map(|value| match value {
                    Value::Null => None,
                    Value::String(s) if s.is_empty() => None,
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                })
                .collect();
            if !parts.is_empty() {
                return parts.join(" ");
            }
        }
        UNKNOWN_FIELD.to_string()
    }
}

impl std::fmt::Display for HostRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> HostRecord {
        serde_json::from_value(json!({
            "hostname": "test1.example.com",
            "name": "vm-01",
            "_broker_provider": "TestProvider",
            "_broker_args": {"template": "deploy-sat-6.9", "count": 1},
            "os": {"distribution": "RHEL", "version": "9.4"},
            "tags": ["sat", "lab"]
        }))
        .unwrap()
    }

    #[test]
    fn test_identity_prefers_hostname() {
        let host = sample();
        assert_eq!(host.identity(), "test1.example.com");
        assert_eq!(HostRecord::named("vm-02").identity(), "vm-02");
        assert!(!HostRecord::default().has_identity());
    }

    #[test]
    fn test_persisted_field_names() {
        let value = sample().to_value();
        assert_eq!(value["_broker_provider"], json!("TestProvider"));
        assert_eq!(value["_broker_args"]["template"], json!("deploy-sat-6.9"));
        assert_eq!(value["os"]["version"], json!("9.4"));
    }

    #[test]
    fn test_lookup() {
        let host = sample();
        assert_eq!(host.lookup("hostname"), Some(json!("test1.example.com")));
        assert_eq!(
            host.lookup("_broker_args.template"),
            Some(json!("deploy-sat-6.9"))
        );
        assert_eq!(host.lookup("os.distribution"), Some(json!("RHEL")));
        assert_eq!(host.lookup("tags.1"), Some(json!("lab")));
        assert_eq!(host.lookup("os.kernel"), None);
        assert_eq!(host.lookup("missing.path"), None);
    }

    #[test]
    fn test_from_value_requires_identity() {
        assert!(HostRecord::from_value(json!({"ip": "10.0.0.1"})).is_err());
        assert!(HostRecord::from_value(json!("just a string")).is_err());
        assert!(HostRecord::from_value(json!({"name": "vm"})).is_ok());
    }

    #[test]
    fn test_merge_from_keeps_local_only_fields() {
        let mut local = sample();
        let reported = HostRecord::new("test1.example.com")
            .with_provider("TestProvider", None)
            .with_attribute("os", json!({"distribution": "RHEL", "version": "9.5"}));
        local.merge_from(reported);

        assert_eq!(local.lookup("os.version"), Some(json!("9.5")));
        assert_eq!(
            local.lookup("_broker_args.template"),
            Some(json!("deploy-sat-6.9"))
        );
        assert_eq!(local.name.as_deref(), Some("vm-01"));
    }

    #[test]
    fn test_display_field() {
        let host = sample();
        assert_eq!(host.display_field("hostname | name"), "test1.example.com");
        assert_eq!(host.display_field("ip | name"), "vm-01");
        assert_eq!(host.display_field("os.distribution os.version"), "RHEL 9.4");
        assert_eq!(host.display_field("ip"), UNKNOWN_FIELD);
    }
}
