//! Output sinks for scenario results.
//!
//! Content goes to stdout, stderr, or a file. Files ending in `.json`,
//! `.yaml` or `.yml` are written structured; everything else is text, with
//! non-string content rendered as YAML.

use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Where `output` writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl Destination {
    /// `stdout`, `stderr`, or a file path
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "" | "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

/// How a file destination is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

impl WriteMode {
    /// `overwrite` / `append`
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            other => Err(Error::validation(format!(
                "unknown output mode '{other}' (expected overwrite or append)"
            ))),
        }
    }
}

/// Render `content` as plain text; strings pass through, the rest is YAML
pub fn to_text(content: &Value) -> Result<String> {
    match content {
        Value::String(text) => Ok(text.clone()),
        other => Ok(serde_yaml::to_string(other)?),
    }
}

/// Write `content` to `destination`
pub fn write(destination: &Destination, content: &Value, mode: WriteMode) -> Result<()> {
    match destination {
        Destination::Stdout => write_stream(&mut std::io::stdout().lock(), content),
        Destination::Stderr => write_stream(&mut std::io::stderr().lock(), content),
        Destination::File(path) => write_file(path, content, mode),
    }
}

fn write_stream(stream: &mut impl Write, content: &Value) -> Result<()> {
    let text = with_newline(to_text(content)?);
    stream.write_all(text.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn write_file(path: &Path, content: &Value, mode: WriteMode) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let text = match extension.as_deref() {
        Some("json") => serde_json::to_string_pretty(&structured(content))?,
        Some("yaml" | "yml") => serde_yaml::to_string(&structured(content))?,
        _ => to_text(content)?,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(mode == WriteMode::Append)
        .truncate(mode == WriteMode::Overwrite)
        .open(path)?;
    file.write_all(with_newline(text).as_bytes())?;
    debug!(path = %path.display(), "Wrote output file");
    Ok(())
}

/// A string holding JSON or YAML is parsed so structured files stay structured
fn structured(content: &Value) -> Value {
    match content {
        Value::String(text) => serde_json::from_str(text)
            .ok()
            .or_else(|| {
                serde_yaml::from_str::<Value>(text)
                    .ok()
                    .filter(|v| v.is_object() || v.is_array())
            })
            .unwrap_or_else(|| content.clone()),
        other => other.clone(),
    }
}

fn with_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
