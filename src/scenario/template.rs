//! Templating and expression evaluation for scenarios.
//!
//! Uses minijinja with strict undefined handling: referencing a variable
//! that does not exist is an error, never an empty string.
//!
//! A string that is exactly one `{{ expr }}` evaluates to the expression's
//! typed value, so `"{{ hosts }}"` yields a list and `"{{ count }}"` a
//! number. Any other string containing template syntax renders to text.

use minijinja::{Environment, Error as TemplateError, ErrorKind, UndefinedBehavior};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Captures the expression of a string that is a single `{{ ... }}` block
static SINGLE_EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\{\{-?\s*(.*?)\s*-?\}\}\s*$").expect("Invalid single-expression regex")
});

/// Whether `text` contains template syntax
pub fn is_template(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// Scenario truthiness.
///
/// Strings are read as words: `true`, `yes`, `1` are true and `false`, `no`,
/// `0`, `none` and the empty string are false. Other values follow the
/// usual empty/zero rules.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" | "none" | "" => false,
            _ => true,
        },
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Strip one pair of `{{ }}` from an expression, if present
pub fn bare_expression(text: &str) -> &str {
    SINGLE_EXPRESSION
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or_else(|| text.trim(), |m| m.as_str())
}

/// Template environment shared by a scenario run
#[derive(Debug)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Strict environment with the scenario filters registered
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        Self::add_filters(&mut env);
        Self { env }
    }

    fn add_filters(env: &mut Environment<'static>) {
        env.add_filter("to_yaml", |value: minijinja::Value| -> Result<String, TemplateError> {
            serde_yaml::to_string(&value)
                .map_err(|e| TemplateError::new(ErrorKind::InvalidOperation, e.to_string()))
        });
        env.add_filter("to_json", |value: minijinja::Value| -> Result<String, TemplateError> {
            serde_json::to_string(&value)
                .map_err(|e| TemplateError::new(ErrorKind::InvalidOperation, e.to_string()))
        });
        env.add_filter("from_json", |text: String| -> Result<minijinja::Value, TemplateError> {
            serde_json::from_str::<Value>(&text)
                .map(|v| minijinja::Value::from_serialize(&v))
                .map_err(|e| TemplateError::new(ErrorKind::InvalidOperation, e.to_string()))
        });
        env.add_filter("from_yaml", |text: String| -> Result<minijinja::Value, TemplateError> {
            serde_yaml::from_str::<Value>(&text)
                .map(|v| minijinja::Value::from_serialize(&v))
                .map_err(|e| TemplateError::new(ErrorKind::InvalidOperation, e.to_string()))
        });
        env.add_filter("bool", |value: minijinja::Value| -> bool {
            serde_json::to_value(&value).is_ok_and(|v| truthy(&v))
        });
        env.add_filter("basename", |path: String| -> String {
            std::path::Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
    }

    /// Evaluate a bare expression (no delimiters) to a typed value
    pub fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, TemplateError> {
        let compiled = self.env.compile_expression(expression)?;
        let value = compiled.eval(minijinja::Value::from_serialize(context))?;
        if value.is_undefined() {
            return Err(TemplateError::new(
                ErrorKind::UndefinedError,
                format!("'{expression}' is undefined"),
            ));
        }
        serde_json::to_value(&value)
            .map_err(|e| TemplateError::new(ErrorKind::BadSerialization, e.to_string()))
    }

    /// Render a string; a lone `{{ expr }}` keeps its type
    pub fn render(&self, text: &str, context: &Value) -> Result<Value, TemplateError> {
        if !is_template(text) {
            return Ok(Value::String(text.to_string()));
        }
        if let Some(expression) = single_expression(text) {
            if let Ok(value) = self.evaluate(expression, context) {
                return Ok(value);
            }
        }
        let rendered = self
            .env
            .render_str(text, minijinja::Value::from_serialize(context))?;
        Ok(Value::String(rendered))
    }

    /// Render every string inside `value`
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(text) => self.render(text, context),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.render_map(map, context).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Render every value of an argument map
    pub fn render_map(
        &self,
        map: &Map<String, Value>,
        context: &Value,
    ) -> Result<Map<String, Value>, TemplateError> {
        map.iter()
            .map(|(key, value)| Ok((key.clone(), self.render_value(value, context)?)))
            .collect()
    }

    /// Evaluate a guard. Delimiters are optional.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &Value,
    ) -> Result<bool, TemplateError> {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }
        let wrapped = if trimmed.starts_with("{{") {
            trimmed.to_string()
        } else {
            format!("{{{{ {trimmed} }}}}")
        };
        Ok(truthy(&self.render(&wrapped, context)?))
    }

    /// Parse `text` as a template without rendering it
    pub fn check_syntax(&self, text: &str) -> Result<(), TemplateError> {
        if is_template(text) {
            self.env.template_from_str(text)?;
        }
        Ok(())
    }

    /// Parse a bare expression without evaluating it
    pub fn check_expression(&self, expression: &str) -> Result<(), TemplateError> {
        self.env.compile_expression(expression).map(|_| ())
    }
}

fn single_expression(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.matches("{{").count() != 1 || trimmed.contains("{%") {
        return None;
    }
    SINGLE_EXPRESSION
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
