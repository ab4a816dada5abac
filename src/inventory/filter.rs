//! Filter expression language for narrowing host sets.
//!
//! ```text
//! filter    := predicate (',' predicate)*
//! predicate := path ['!'] operator value
//! operator  := '<' contains | '=' equals | '{' starts-with | '}' ends-with
//! ```
//!
//! Paths use dotted traversal into the record (`_broker_args.template`).
//! Predicates are ANDed. A path the record does not have makes its predicate
//! false; it is never an error. Evaluation is pure: [`matches`] only reads
//! the record and the parsed filter.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::HostRecord;

/// Errors raised while parsing a filter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter predicate '{0}' has no operator (expected one of < = {{ }})")]
    MissingOperator(String),

    #[error("filter predicate '{0}' has an empty property path")]
    EmptyPath(String),

    #[error("filter is empty")]
    Empty,
}

/// Comparison applied by a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// `<`: value is a substring
    Contains,
    /// `=`: exact match
    Equals,
    /// `{`: prefix match
    StartsWith,
    /// `}`: suffix match
    EndsWith,
}

impl Condition {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '<' => Some(Self::Contains),
            '=' => Some(Self::Equals),
            '{' => Some(Self::StartsWith),
            '}' => Some(Self::EndsWith),
            _ => None,
        }
    }

    fn symbol(self) -> char {
        match self {
            Self::Contains => '<',
            Self::Equals => '=',
            Self::StartsWith => '{',
            Self::EndsWith => '}',
        }
    }

    fn test(self, candidate: &str, expected: &str) -> bool {
        match self {
            Self::Contains => candidate.contains(expected),
            Self::Equals => candidate == expected,
            Self::StartsWith => candidate.starts_with(expected),
            Self::EndsWith => candidate.ends_with(expected),
        }
    }
}

/// One `(path, condition, value, negated)` test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Dotted property path
    pub path: String,
    /// Comparison
    pub condition: Condition,
    /// Expected value
    pub value: String,
    /// Invert the match
    pub negated: bool,
}

impl Predicate {
    fn parse(text: &str) -> Result<Self, FilterError> {
        let (index, op) = text
            .char_indices()
            .find_map(|(i, c)| Condition::from_char(c).map(|cond| (i, cond)))
            .ok_or_else(|| FilterError::MissingOperator(text.trim().to_string()))?;

        let mut path = text[..index].trim();
        let negated = path.ends_with('!');
        if negated {
            path = path[..path.len() - 1].trim_end();
        }
        if path.is_empty() {
            return Err(FilterError::EmptyPath(text.trim().to_string()));
        }

        Ok(Self {
            path: path.to_string(),
            condition: op,
            value: text[index + 1..].trim().to_string(),
            negated,
        })
    }

    /// Evaluate this predicate against a record
    pub fn matches(&self, record: &HostRecord) -> bool {
        let hit = record
            .lookup(&self.path)
            .is_some_and(|value| self.matches_value(&value));
        hit != self.negated
    }

    fn matches_value(&self, value: &Value) -> bool {
        match value {
            Value::Array(items) => items.iter().any(|item| self.matches_value(item)),
            Value::String(s) => self.condition.test(s, &self.value),
            Value::Null => false,
            other => self.condition.test(&other.to_string(), &self.value),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bang = if self.negated { "!" } else { "" };
        write!(f, "{}{}{}{}", self.path, bang, self.condition.symbol(), self.value)
    }
}

/// A conjunction of predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    /// Parse a comma-separated predicate list
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let predicates = text
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Predicate::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if predicates.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(Self { predicates })
    }

    /// Parsed predicates, in source order
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Whether every predicate matches `record`
    pub fn matches(&self, record: &HostRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    /// Narrow `records`, preserving their order
    pub fn apply<'a, I>(&self, records: I) -> Vec<HostRecord>
    where
        I: IntoIterator<Item = &'a HostRecord>,
    {
        records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect()
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.predicates.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Pure evaluation of `filter` against `record`
pub fn matches(record: &HostRecord, filter: &Filter) -> bool {
    filter.matches(record)
}
