//! Host selectors: which stored hosts an operation targets.

use crate::error::{Error, Result};
use crate::inventory::{Filter, HostRecord};

/// Positions, hostnames/names, or everything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSelector {
    /// Every stored host
    All,
    /// Inventory positions or hostnames/names
    Items(Vec<String>),
}

impl HostSelector {
    /// Build from CLI-style input: `--all` or positional items
    pub fn from_items<I, S>(items: I, all: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if all {
            Self::All
        } else {
            Self::Items(items.into_iter().map(Into::into).collect())
        }
    }

    /// Apply `filter` to `records`, then this selector. Order follows the
    /// inventory and each host is picked at most once.
    ///
    /// An empty result is a [`Error::Selection`].
    pub fn select(
        &self,
        records: &[HostRecord],
        filter: Option<&Filter>,
    ) -> Result<Vec<HostRecord>> {
        let candidates: Vec<HostRecord> = match filter {
            Some(filter) => filter.apply(records),
            None => records.to_vec(),
        };

        let count = candidates.len();
        let picked: Vec<HostRecord> = match self {
            Self::All => candidates,
            Self::Items(items) => candidates
                .iter()
                .enumerate()
                .filter(|(index, host)| {
                    items.iter().any(|item| {
                        position(item, count) == Some(*index) || host.is_named(item)
                    })
                })
                .map(|(_, host)| host.clone())
                .collect(),
        };

        if picked.is_empty() {
            return Err(Error::Selection(match (self, filter) {
                (Self::Items(items), Some(filter)) => {
                    format!("no hosts match [{}] with filter '{filter}'", items.join(", "))
                }
                (Self::Items(items), None) => format!("no hosts match [{}]", items.join(", ")),
                (Self::All, Some(filter)) => format!("no hosts match filter '{filter}'"),
                (Self::All, None) => "the inventory is empty".to_string(),
            }));
        }
        Ok(picked)
    }
}

/// Inventory position named by `item`; negative positions count from the end.
fn position(item: &str, count: usize) -> Option<usize> {
    let index: i64 = item.parse().ok()?;
    if index < 0 {
        count.checked_sub(usize::try_from(index.unsigned_abs()).ok()?)
    } else {
        usize::try_from(index).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<HostRecord> {
        vec![
            HostRecord::new("a.lab"),
            HostRecord::named("vm-b"),
            HostRecord::new("c.prod"),
        ]
    }

    fn ids(hosts: &[HostRecord]) -> Vec<&str> {
        hosts.iter().map(HostRecord::identity).collect()
    }

    #[test]
    fn test_select_by_position_and_name() {
        let selector = HostSelector::from_items(["2", "vm-b"], false);
        let picked = selector.select(&records(), None).unwrap();
        assert_eq!(ids(&picked), vec!["vm-b", "c.prod"]);
    }

    #[test]
    fn test_negative_positions_count_from_the_end() {
        let picked = HostSelector::from_items(["-1"], false)
            .select(&records(), None)
            .unwrap();
        assert_eq!(ids(&picked), vec!["c.prod"]);

        let picked = HostSelector::from_items(["-3", "-2"], false)
            .select(&records(), None)
            .unwrap();
        assert_eq!(ids(&picked), vec!["a.lab", "vm-b"]);

        assert!(HostSelector::from_items(["-4"], false)
            .select(&records(), None)
            .is_err());
    }

    #[test]
    fn test_filter_applies_before_positions() {
        let filter = Filter::parse("hostname}.prod").unwrap();
        let picked = HostSelector::from_items(["0"], false)
            .select(&records(), Some(&filter))
            .unwrap();
        assert_eq!(ids(&picked), vec!["c.prod"]);
    }

    #[test]
    fn test_all() {
        let picked = HostSelector::from_items(Vec::<String>::new(), true)
            .select(&records(), None)
            .unwrap();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_empty_selection_is_an_error() {
        let err = HostSelector::from_items(["nope"], false)
            .select(&records(), None)
            .unwrap_err();
        assert!(matches!(err, Error::Selection(_)));
        assert!(matches!(
            HostSelector::All.select(&[], None),
            Err(Error::Selection(_))
        ));
    }
}
