//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::backends::ApplyOutcome;
use crate::config::Environment;
use crate::executor::{RunReport, RunState};
use crate::providers::ClusterInfo;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Applied resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// Transition row for table display.
#[derive(Tabled)]
struct TransitionRow {
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "At")]
    at: String,
}

/// Key/value row for table display.
#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the result of `validate`.
    #[must_use]
    pub fn format_validation(&self, env: &Environment, warnings: &[String]) -> String {
        let provider = env.kubernetes.provider().map_or("-", |(id, _)| id);
        let plugins: Vec<&str> = env.kubernetes.plugins.keys().map(String::as_str).collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": true,
                "environment": env.name,
                "provider": provider,
                "plugins": plugins,
                "warnings": warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Environment '{}' is valid\n\n", "✓".green(), env.name);
                let _ = writeln!(output, "   App: {}", env.app);
                let _ = writeln!(output, "   Namespace: {}", env.namespace());
                let _ = writeln!(output, "   Image: {}", env.docker.image);
                let _ = writeln!(output, "   Provider: {provider}");
                let _ = writeln!(output, "   Plugins: {}", if plugins.is_empty() { String::from("-") } else { plugins.join(", ") });

                if !warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an evaluated environment. Secret values are shown by key.
    #[must_use]
    pub fn format_environment(&self, env: &Environment) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(env).unwrap_or_default(),
            OutputFormat::Text => serde_yaml::to_string(env).unwrap_or_default(),
        }
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let mut output = String::new();

        let status = match &report.state {
            RunState::Done => format!("{} Deployed '{}'", "✓".green(), report.environment),
            RunState::Failed { stage, cause } => {
                format!("{} {} failed: {cause}", "✗".red(), stage.to_string().bold())
            }
            other => format!("{} Run stopped in {other}", "⚠".yellow()),
        };
        let _ = writeln!(output, "\n{status}\n");

        let _ = writeln!(output, "   Run: {}", report.run_id);
        if let Some(image) = &report.image {
            let _ = writeln!(output, "   Image: {image}");
        }
        if let Some(digest) = &report.digest {
            let _ = writeln!(output, "   Digest: {digest}");
        }
        if let Some(digest) = &report.manifest_digest {
            let _ = writeln!(output, "   Manifest: {}", Self::truncate(digest, 12));
        }
        if let Some(duration) = report.duration() {
            let _ = writeln!(output, "   Duration: {:.1}s", duration.num_milliseconds() as f64 / 1000.0);
        }

        let transitions: Vec<TransitionRow> = report
            .transitions
            .iter()
            .map(|t| TransitionRow {
                state: match &t.state {
                    RunState::Failed { stage, .. } => format!("Failed({stage})"),
                    other => other.to_string(),
                },
                at: t.at.format("%H:%M:%S%.3f").to_string(),
            })
            .collect();
        let _ = write!(output, "\n{}\n", Table::new(transitions));

        if !report.applied.is_empty() {
            let rows: Vec<ResourceRow> = report
                .applied
                .iter()
                .enumerate()
                .map(|(i, r)| ResourceRow {
                    index: i + 1,
                    resource: r.resource.clone(),
                    outcome: Self::format_outcome(r.outcome),
                })
                .collect();
            let _ = write!(output, "\n{}\n", Table::new(rows));
        }

        let _ = write!(
            output,
            "\nResources: {} applied, {} unchanged\n",
            report.count(ApplyOutcome::Applied).to_string().green(),
            report.count(ApplyOutcome::Unchanged).to_string().dimmed()
        );

        output
    }

    /// Formats a cluster description.
    #[must_use]
    pub fn format_cluster(&self, cluster: &ClusterInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(cluster).unwrap_or_default(),
            OutputFormat::Text => {
                let missing = || String::from("-");
                let rows = vec![
                    FieldRow { field: "ID", value: cluster.id.clone() },
                    FieldRow { field: "Name", value: cluster.name.clone() },
                    FieldRow { field: "Region", value: cluster.region.clone().unwrap_or_else(missing) },
                    FieldRow { field: "Version", value: cluster.version.clone().unwrap_or_else(missing) },
                    FieldRow { field: "Endpoint", value: cluster.endpoint.clone().unwrap_or_else(missing) },
                ];
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats credential store keys.
    #[must_use]
    pub fn format_keys(&self, keys: &[String]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(keys).unwrap_or_default(),
            OutputFormat::Text if keys.is_empty() => String::from("No credentials stored.\n"),
            OutputFormat::Text => keys.iter().fold(String::new(), |mut output, key| {
                let _ = writeln!(output, "{key}");
                output
            }),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow(), message)
    }

    fn message(&self, status: &str, symbol: &colored::ColoredString, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{symbol} {message}"),
        }
    }

    fn format_outcome(outcome: ApplyOutcome) -> String {
        match outcome {
            ApplyOutcome::Applied => "applied".green().to_string(),
            ApplyOutcome::Unchanged => "unchanged".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.len() <= max_len {
            s.to_string()
        } else {
            format!("{}...", &s[..max_len])
        }
    }
}
