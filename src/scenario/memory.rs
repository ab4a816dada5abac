//! Step memory: what each step produced, addressable by name.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Lifecycle of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Recorded state of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMemory {
    pub name: String,
    pub output: Value,
    pub status: StepStatus,
}

impl StepMemory {
    /// Fresh, pending entry
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Value::Null,
            status: StepStatus::Pending,
        }
    }

    /// Template view: `{name, output, status}`
    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "output": self.output,
            "status": self.status,
        })
    }
}

/// Every step's memory for one run, in first-execution order
#[derive(Debug, Clone, Default)]
pub struct Memory {
    entries: IndexMap<String, StepMemory>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` running, creating its entry on first use
    pub fn begin(&mut self, name: &str) {
        self.entry(name).status = StepStatus::Running;
    }

    pub fn skip(&mut self, name: &str) {
        self.entry(name).status = StepStatus::Skipped;
    }

    pub fn complete(&mut self, name: &str, output: Value) {
        let entry = self.entry(name);
        entry.output = output;
        entry.status = StepStatus::Completed;
    }

    /// Record a failure; the error text becomes the output
    pub fn fail(&mut self, name: &str, error: impl fmt::Display) {
        let entry = self.entry(name);
        entry.output = Value::String(error.to_string());
        entry.status = StepStatus::Failed;
    }

    pub fn get(&self, name: &str) -> Option<&StepMemory> {
        self.entries.get(name)
    }

    pub fn status(&self, name: &str) -> Option<StepStatus> {
        self.entries.get(name).map(|m| m.status)
    }

    pub fn entries(&self) -> impl Iterator<Item = &StepMemory> {
        self.entries.values()
    }

    /// `steps` template variable: name → `{name, output, status}`
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(name, memory)| (name.clone(), memory.to_value()))
                .collect(),
        )
    }

    pub fn into_vec(self) -> Vec<StepMemory> {
        self.entries.into_values().collect()
    }

    fn entry(&mut self, name: &str) -> &mut StepMemory {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| StepMemory::new(name))
    }
}
