//! Command-line variable and config overrides for scenarios.
//!
//! Variables arrive as strings (`--var COUNT=3`) and are coerced to the type
//! the scenario declared for them. Config overrides (`--config
//! config.settings.providers.TestProvider.prefix=ci`) are dotted paths into the
//! scenario's `config` block.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::set_path;
use crate::error::{Error, Result};

/// Split `KEY=VALUE`
pub fn parse_assignment(text: &str) -> Result<(String, String)> {
    match text.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(Error::validation(format!(
            "expected KEY=VALUE, got '{text}'"
        ))),
    }
}

/// Parse many `KEY=VALUE` assignments, later keys winning
pub fn parse_assignments<I, S>(items: I) -> Result<IndexMap<String, String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| parse_assignment(item.as_ref()))
        .collect()
}

/// Coerce a command-line string to the type of the declared value.
///
/// Undeclared (or null) variables stay strings; a failed coercion keeps the
/// string and logs a warning.
pub fn coerce(name: &str, raw: &str, declared: Option<&Value>) -> Value {
    let keep = || Value::String(raw.to_string());
    match declared {
        None | Some(Value::Null | Value::String(_)) => keep(),
        Some(Value::Bool(_)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Value::Bool(true),
            "false" | "0" | "no" | "off" => Value::Bool(false),
            _ => {
                warn!("Could not convert '{raw}' to bool for '{name}'; keeping it as a string");
                keep()
            }
        },
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => match raw.trim().parse::<i64>() {
            Ok(parsed) => Value::from(parsed),
            Err(e) => {
                warn!(
                    "Could not convert '{raw}' to an integer for '{name}': {e}; \
                     keeping it as a string"
                );
                keep()
            }
        },
        Some(Value::Number(_)) => match raw.trim().parse::<f64>() {
            Ok(parsed) => serde_json::Number::from_f64(parsed).map_or_else(keep, Value::Number),
            Err(e) => {
                warn!(
                    "Could not convert '{raw}' to a float for '{name}': {e}; \
                     keeping it as a string"
                );
                keep()
            }
        },
        Some(declared @ (Value::Array(_) | Value::Object(_))) => {
            let kind = if declared.is_array() { "list" } else { "mapping" };
            match serde_json::from_str::<Value>(raw.trim()) {
                Ok(parsed) if parsed.is_array() || parsed.is_object() => parsed,
                _ => {
                    warn!("Value for '{name}' is not a JSON {kind}; keeping it as a string");
                    keep()
                }
            }
        }
    }
}

/// Layer command-line variables over the scenario's declared ones
pub fn apply_cli_vars(variables: &mut Map<String, Value>, cli_vars: &IndexMap<String, String>) {
    for (name, raw) in cli_vars {
        let value = coerce(name, raw, variables.get(name));
        variables.insert(name.clone(), value);
    }
}

/// Apply dotted config overrides; a leading `config.` is optional.
///
/// Values are parsed as YAML scalars so numbers and booleans keep their type.
pub fn apply_config_overrides(config: &mut Value, overrides: &IndexMap<String, String>) {
    for (key, raw) in overrides {
        let path: Vec<String> = key
            .strip_prefix("config.")
            .unwrap_or(key)
            .split('.')
            .map(str::to_string)
            .collect();
        let value =
            serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        set_path(config, &path, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("COUNT=3").unwrap(),
            ("COUNT".to_string(), "3".to_string())
        );
        assert_eq!(parse_assignment("Q=a=b").unwrap().1, "a=b");
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    #[test]
    fn test_coercion_follows_declared_type() {
        assert_eq!(coerce("n", "5", Some(&json!(3))), json!(5));
        assert_eq!(coerce("f", "2.5", Some(&json!(1.0))), json!(2.5));
        assert_eq!(coerce("b", "yes", Some(&json!(false))), json!(true));
        assert_eq!(coerce("l", "[1, 2]", Some(&json!([]))), json!([1, 2]));
        assert_eq!(coerce("m", "{\"a\": 1}", Some(&json!({}))), json!({"a": 1}));
        assert_eq!(coerce("new", "5", None), json!("5"));
    }

    #[test]
    fn test_failed_coercion_keeps_string() {
        assert_eq!(coerce("n", "many", Some(&json!(3))), json!("many"));
        assert_eq!(coerce("b", "maybe", Some(&json!(true))), json!("maybe"));
        assert_eq!(coerce("l", "a,b", Some(&json!([]))), json!("a,b"));
    }

    #[test]
    fn test_apply_cli_vars() {
        let mut variables = Map::new();
        variables.insert("COUNT".into(), json!(1));
        let cli = parse_assignments(["COUNT=3", "EXTRA=x"]).unwrap();
        apply_cli_vars(&mut variables, &cli);
        assert_eq!(variables["COUNT"], json!(3));
        assert_eq!(variables["EXTRA"], json!("x"));
    }

    #[test]
    fn test_config_overrides() {
        let mut config = json!({"settings": {"ssh": {"port": 22}}});
        let overrides = parse_assignments([
            "config.settings.ssh.port=2222",
            "inventory_path=/tmp/inv.yaml",
        ])
        .unwrap();
        apply_config_overrides(&mut config, &overrides);
        assert_eq!(config["settings"]["ssh"]["port"], json!(2222));
        assert_eq!(config["inventory_path"], json!("/tmp/inv.yaml"));
    }
}
