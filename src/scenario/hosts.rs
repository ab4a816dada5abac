//! Host references in `with.hosts` and loop iterables.
//!
//! ```text
//! reference := source ('[' slice ']')? ('|' filter)?
//! source    := 'scenario_inventory' | 'inventory'
//! slice     := int | int? ':' int?
//! ```
//!
//! Indices may be negative and count from the end. The filter uses the
//! inventory filter language and is applied after the slice. Text that does
//! not match this grammar is not a reference and is left to the template
//! engine.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::inventory::{Filter, HostRecord};

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^\s*(scenario_inventory|inventory)",
        r"\s*(?:\[\s*(-?\d*)\s*(:)?\s*(-?\d*)\s*\])?",
        r"\s*(?:\|\s*(.+?))?\s*$",
    ))
    .expect("Invalid host reference regex")
});

/// Which host collection a reference reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSource {
    /// Hosts acquired by this run
    Scenario,
    /// The global inventory store
    Inventory,
}

/// `[i]` or `[a:b]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    Index(i64),
    Range(Option<i64>, Option<i64>),
}

impl Slice {
    /// Apply to `records`; an out-of-range index selects nothing
    pub fn apply<T: Clone>(&self, records: &[T]) -> Vec<T> {
        let len = i64::try_from(records.len()).unwrap_or(i64::MAX);
        let clamp = |index: i64| -> usize {
            let absolute = if index < 0 { len + index } else { index };
            usize::try_from(absolute.clamp(0, len)).unwrap_or(0)
        };
        match *self {
            Self::Index(index) => {
                let absolute = if index < 0 { len + index } else { index };
                usize::try_from(absolute)
                    .ok()
                    .and_then(|i| records.get(i))
                    .cloned()
                    .into_iter()
                    .collect()
            }
            Self::Range(start, end) => {
                let start = start.map_or(0, clamp);
                let end = end.map_or(records.len(), clamp);
                if start >= end {
                    Vec::new()
                } else {
                    records[start..end].to_vec()
                }
            }
        }
    }
}

/// A parsed host reference
#[derive(Debug, Clone)]
pub struct HostReference {
    pub source: HostSource,
    pub slice: Option<Slice>,
    pub filter: Option<Filter>,
}

impl HostReference {
    /// Parse `text`; `None` when it is not a host reference
    pub fn parse(text: &str) -> Option<Self> {
        let captures = REFERENCE.captures(text)?;
        let source = match &captures[1] {
            "scenario_inventory" => HostSource::Scenario,
            _ => HostSource::Inventory,
        };

        let number = |index: usize| -> Option<Option<i64>> {
            match captures.get(index).map(|m| m.as_str()) {
                None | Some("") => Some(None),
                Some(text) => text.parse().ok().map(Some),
            }
        };
        let start = number(2)?;
        let end = number(4)?;
        let bracketed = captures.get(2).is_some();
        let slice = match (bracketed, captures.get(3).is_some()) {
            (false, _) => None,
            (true, true) => Some(Slice::Range(start, end)),
            (true, false) => Some(Slice::Index(start?)),
        };

        // `scenario_inventory | length` is a template, not a filter
        let filter = match captures.get(5) {
            Some(m) => Some(Filter::parse(m.as_str()).ok()?),
            None => None,
        };

        Some(Self {
            source,
            slice,
            filter,
        })
    }

    /// Narrow `records` by the slice, then the filter
    pub fn apply(&self, records: &[HostRecord]) -> Vec<HostRecord> {
        let sliced = match &self.slice {
            Some(slice) => slice.apply(records),
            None => records.to_vec(),
        };
        match &self.filter {
            Some(filter) => filter.apply(&sliced),
            None => sliced,
        }
    }
}

/// Interpret a rendered value as host records: a list of mappings, or one
pub fn records_from_value(value: Value) -> Result<Vec<HostRecord>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(Error::validation(format!(
                "hosts must resolve to a list of host records, got {other}"
            )))
        }
    };
    items
        .into_iter()
        .map(|item| {
            HostRecord::from_value(item)
                .map_err(|reason| Error::validation(format!("invalid host record: {reason}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records() -> Vec<HostRecord> {
        ["a.lab", "b.lab", "c.prod", "d.prod"]
            .into_iter()
            .map(HostRecord::new)
            .collect()
    }

    fn ids(hosts: &[HostRecord]) -> Vec<&str> {
        hosts.iter().map(HostRecord::identity).collect()
    }

    #[test]
    fn test_plain_sources() {
        let r = HostReference::parse("scenario_inventory").unwrap();
        assert_eq!(r.source, HostSource::Scenario);
        assert!(r.slice.is_none() && r.filter.is_none());
        assert_eq!(
            HostReference::parse(" inventory ").unwrap().source,
            HostSource::Inventory
        );
    }

    #[test]
    fn test_index_and_slices() {
        let hosts = records();
        let pick = |text: &str| ids(&HostReference::parse(text).unwrap().apply(&hosts))
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        assert_eq!(pick("inventory[0]"), vec!["a.lab"]);
        assert_eq!(pick("inventory[-1]"), vec!["d.prod"]);
        assert_eq!(pick("inventory[1:3]"), vec!["b.lab", "c.prod"]);
        assert_eq!(pick("inventory[:-2]"), vec!["a.lab", "b.lab"]);
        assert_eq!(pick("inventory[2:]"), vec!["c.prod", "d.prod"]);
        assert!(pick("inventory[9]").is_empty());
    }

    #[test]
    fn test_filter_after_slice() {
        let hosts = records();
        let reference = HostReference::parse("scenario_inventory[1:] | hostname}.prod").unwrap();
        assert_eq!(ids(&reference.apply(&hosts)), vec!["c.prod", "d.prod"]);
    }

    #[test]
    fn test_non_references() {
        assert!(HostReference::parse("{{ my_hosts }}").is_none());
        assert!(HostReference::parse("scenario_inventory | length").is_none());
        assert!(HostReference::parse("inventory_extra").is_none());
    }

    #[test]
    fn test_records_from_value() {
        let hosts = records_from_value(json!([{"hostname": "x"}, {"name": "y"}])).unwrap();
        assert_eq!(ids(&hosts), vec!["x", "y"]);
        assert_eq!(records_from_value(json!({"hostname": "z"})).unwrap().len(), 1);
        assert!(records_from_value(json!("nope")).is_err());
        assert!(records_from_value(json!([{"os": "rhel"}])).is_err());
    }
}
