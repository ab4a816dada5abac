//! Output formatting module for Broker
//!
//! Colored status lines, host tables and structured (JSON/YAML) rendering.

use colored::Colorize;
use is_terminal::IsTerminal;
use indexmap::IndexMap;
use serde::Serialize;

use broker::inventory::HostRecord;
use broker::scenario::{ScenarioOutcome, StepStatus};

use super::OutputFormat;

/// Output formatter for different output modes
pub struct OutputFormatter {
    /// Use colored output
    use_color: bool,
    /// Human, JSON or YAML
    format: OutputFormat,
    /// Verbosity level
    verbosity: u8,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, format: OutputFormat, verbosity: u8) -> Self {
        // Respect NO_COLOR and piped stdout
        let use_color = use_color
            && std::env::var("NO_COLOR").is_err()
            && std::io::stdout().is_terminal();
        colored::control::set_override(use_color);

        Self {
            use_color,
            format,
            verbosity,
        }
    }

    /// Whether results should be printed as data rather than prose
    pub fn is_structured(&self) -> bool {
        !matches!(self.format, OutputFormat::Human)
    }

    /// Print a section header
    pub fn section(&self, title: &str) {
        if self.is_structured() {
            return;
        }

        if self.use_color {
            println!("\n{}", title.cyan().bold());
            println!("{}", "-".repeat(title.len()).cyan());
        } else {
            println!("\n{title}");
            println!("{}", "-".repeat(title.len()));
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "ERROR:".red().bold(), message);
        } else {
            eprintln!("ERROR: {message}");
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "WARNING:".yellow().bold(), message);
        } else {
            eprintln!("WARNING: {message}");
        }
    }

    /// Print a success line (human mode only)
    pub fn success(&self, message: &str) {
        if self.is_structured() {
            return;
        }
        if self.use_color {
            println!("{}", message.green());
        } else {
            println!("{message}");
        }
    }

    /// Print an info message (respects verbosity)
    pub fn info(&self, message: &str) {
        if self.verbosity < 1 || self.is_structured() {
            return;
        }

        if self.use_color {
            println!("{} {}", "INFO:".blue(), message);
        } else {
            println!("INFO: {message}");
        }
    }

    /// Print any serializable value in the selected format
    pub fn data<T: Serialize>(&self, value: &T) -> broker::Result<()> {
        let text = match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value)?,
            OutputFormat::Human | OutputFormat::Yaml => serde_yaml::to_string(value)?,
        };
        println!("{}", text.trim_end());
        Ok(())
    }

    /// Print hosts as a table with one column per field expression
    pub fn hosts_table(
        &self,
        hosts: &[HostRecord],
        columns: &IndexMap<String, String>,
    ) -> broker::Result<()> {
        if self.is_structured() {
            let values: Vec<_> = hosts.iter().map(HostRecord::to_value).collect();
            return self.data(&values);
        }
        if hosts.is_empty() {
            println!("No hosts in the inventory");
            return Ok(());
        }

        let mut headers = vec!["Id".to_string()];
        headers.extend(columns.keys().cloned());
        let rows: Vec<Vec<String>> = hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                let mut row = vec![index.to_string()];
                row.extend(columns.values().map(|expr| host.display_field(expr)));
                row
            })
            .collect();

        let widths: Vec<usize> = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                rows.iter()
                    .map(|row| row[i].len())
                    .chain(std::iter::once(header.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let render = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ")
        };

        let header_line = render(&headers);
        if self.use_color {
            println!("{}", header_line.bold());
        } else {
            println!("{header_line}");
        }
        for row in &rows {
            println!("{}", render(row));
        }
        Ok(())
    }

    /// Print one short line per host
    pub fn hosts_list(&self, hosts: &[HostRecord], expression: &str) -> broker::Result<()> {
        if self.is_structured() {
            let values: Vec<_> = hosts.iter().map(HostRecord::to_value).collect();
            return self.data(&values);
        }
        for (index, host) in hosts.iter().enumerate() {
            println!("{index}: {}", host.display_field(expression));
        }
        Ok(())
    }

    /// Print each step's status and the final verdict
    pub fn scenario_outcome(&self, outcome: &ScenarioOutcome) -> broker::Result<()> {
        if self.is_structured() {
            return self.data(outcome);
        }

        self.section(&format!("Scenario '{}'", outcome.name));
        for step in &outcome.steps {
            let status = if self.use_color {
                match step.status {
                    StepStatus::Completed => step.status.to_string().green().to_string(),
                    StepStatus::Skipped => step.status.to_string().cyan().to_string(),
                    StepStatus::Failed => step.status.to_string().red().bold().to_string(),
                    StepStatus::Pending | StepStatus::Running => {
                        step.status.to_string().yellow().to_string()
                    }
                }
            } else {
                step.status.to_string()
            };
            println!("  {:<40} {status}", step.name);
        }

        if !outcome.hosts.is_empty() {
            let held: Vec<&str> = outcome.hosts.iter().map(HostRecord::identity).collect();
            self.warning(&format!("hosts still checked out: {}", held.join(", ")));
        }
        match (&outcome.message, outcome.success()) {
            (Some(message), true) => self.success(message),
            (None, true) => self.success("Scenario completed successfully"),
            (message, false) => self.error(&format!(
                "Scenario failed with exit code {}{}",
                outcome.exit_code,
                message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
            )),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_modes() {
        assert!(!OutputFormatter::new(false, OutputFormat::Human, 0).is_structured());
        assert!(OutputFormatter::new(false, OutputFormat::Json, 0).is_structured());
        assert!(OutputFormatter::new(false, OutputFormat::Yaml, 0).is_structured());
    }
}
