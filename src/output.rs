//! # Output Formatting
//!
//! Human-readable rendering of deployment manifests and ledger listings, plus
//! colour and emoji control based on terminal capabilities and user
//! preferences.
//!
//! ## Respecting User Preferences
//!
//! The module respects the following environment variables and flags:
//! - `--color=never|always|auto` - CLI flag for color control
//! - `NO_COLOR` - Disables colors when set (per https://no-color.org/)
//! - `CLICOLOR=0` - Disables colors
//! - `CLICOLOR_FORCE=1` - Forces colors even in non-TTY
//! - `TERM=dumb` - Disables colors for dumb terminals
//!
//! ## Usage
//!
//! ```rust,ignore
//! use envie::output::{render_report, OutputConfig};
//!
//! let config = OutputConfig::from_env_and_flag("auto");
//! print!("{}", render_report(&config, &report));
//! ```

use std::env;
use std::fmt::Write as _;

use crate::ledger::LedgerEntry;
use crate::phases::execution::NodeOutcome;
use crate::phases::orchestrator::{DeploymentReport, Operation};

/// Output configuration for controlling colors and emojis.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Whether colors and emojis should be used in output.
    pub use_color: bool,
}

impl OutputConfig {
    /// Create an output configuration from environment and CLI flag.
    ///
    /// # Arguments
    /// * `color_flag` - The value of the --color CLI flag: "always", "never", or "auto"
    ///
    /// In auto mode, colors are disabled if:
    /// - `NO_COLOR` environment variable is set (any value, including empty)
    /// - `CLICOLOR=0` is set
    /// - `TERM=dumb` is set
    /// - stdout is not a TTY (unless `CLICOLOR_FORCE=1`)
    pub fn from_env_and_flag(color_flag: &str) -> Self {
        let use_color = match color_flag.to_lowercase().as_str() {
            "always" => true,
            "never" => false,
            _ => Self::detect_color_support(),
        };

        Self { use_color }
    }

    fn detect_color_support() -> bool {
        // Presence alone disables colors, even when empty
        if env::var_os("NO_COLOR").is_some() {
            return false;
        }

        if env::var("CLICOLOR").is_ok_and(|v| v == "0") {
            return false;
        }

        if env::var("CLICOLOR_FORCE").is_ok_and(|v| v != "0" && !v.is_empty()) {
            return true;
        }

        if env::var("TERM").is_ok_and(|v| v == "dumb") {
            return false;
        }

        console::Term::stdout().features().colors_supported()
    }

    /// Create a configuration with colors always enabled.
    #[cfg(test)]
    pub fn with_color() -> Self {
        Self { use_color: true }
    }

    /// Create a configuration with colors always disabled.
    #[cfg(test)]
    pub fn without_color() -> Self {
        Self { use_color: false }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::from_env_and_flag("auto")
    }
}

/// Returns the emoji when colors are enabled, the plain text otherwise.
///
/// ```rust,ignore
/// let config = OutputConfig::from_env_and_flag("auto");
/// println!("{} Validating...", emoji(&config, "🔍", "[SCAN]"));
/// ```
pub fn emoji<'a>(config: &OutputConfig, emoji_str: &'a str, plain: &'a str) -> &'a str {
    if config.use_color {
        emoji_str
    } else {
        plain
    }
}

/// Marker printed in front of a node outcome
pub fn outcome_marker(config: &OutputConfig, outcome: &NodeOutcome) -> &'static str {
    match outcome {
        NodeOutcome::Applied => emoji(config, "✅", "[OK]"),
        NodeOutcome::Destroyed => emoji(config, "🗑️", "[DEL]"),
        NodeOutcome::Planned => emoji(config, "📋", "[PLAN]"),
        NodeOutcome::Bound => emoji(config, "🔗", "[BOUND]"),
        NodeOutcome::Failed(_) => emoji(config, "❌", "[ERR]"),
        NodeOutcome::Skipped(_) => emoji(config, "⏭️", "[SKIP]"),
    }
}

/// Render the manifest of one request.
///
/// Nodes are listed in plan order, followed by nodes that were not planned
/// (bindings and unresolved nodes) by name. The last line counts outcomes.
pub fn render_report(config: &OutputConfig, report: &DeploymentReport) -> String {
    let mut out = String::new();

    let (marker, verb) = match report.operation {
        Operation::Deploy => (emoji(config, "🚀", "[DEPLOY]"), "Deploy"),
        Operation::Destroy => (emoji(config, "🧹", "[DESTROY]"), "Destroy"),
    };
    let target = report
        .root
        .as_ref()
        .map(|root| format!(" '{}'", root))
        .unwrap_or_default();
    let _ = writeln!(
        out,
        "{} {}{} in {}{}",
        marker,
        verb,
        target,
        report.scope,
        if report.dry_run { " (dry run)" } else { "" }
    );
    let _ = writeln!(out, "Plan: {}", report.plan);

    let mut names: Vec<&str> = report
        .plan
        .nodes()
        .filter(|node| report.outcomes.contains_key(*node))
        .collect();
    names.extend(
        report
            .outcomes
            .keys()
            .map(String::as_str)
            .filter(|name| !report.plan.contains(name)),
    );

    let width = names.iter().map(|name| name.len()).max().unwrap_or(0);
    for name in names {
        let Some(outcome) = report.outcomes.get(name) else {
            continue;
        };
        let state_key = report
            .environments
            .get(name)
            .map(|env| env.state_key.as_str())
            .unwrap_or("");
        let line = match outcome.detail() {
            Some(detail) => format!(
                "  {} {:<width$}  {}: {}",
                outcome_marker(config, outcome),
                name,
                outcome.label(),
                detail
            ),
            None => format!(
                "  {} {:<width$}  {:<9} {}",
                outcome_marker(config, outcome),
                name,
                outcome.label(),
                state_key
            ),
        };
        let _ = writeln!(out, "{}", line.trim_end());
    }

    let _ = writeln!(out, "{}", summary(report));
    out
}

/// Outcome counts, e.g. `2 applied, 1 bound, 1 failed`
pub fn summary(report: &DeploymentReport) -> String {
    const LABELS: [&str; 6] = ["applied", "destroyed", "planned", "bound", "failed", "skipped"];

    let counts: Vec<String> = LABELS
        .iter()
        .map(|label| (label, report.nodes_with(label).len()))
        .filter(|(_, count)| *count > 0)
        .map(|(label, count)| format!("{} {}", count, label))
        .collect();

    if counts.is_empty() {
        "Summary: nothing to do".to_string()
    } else {
        format!("Summary: {}", counts.join(", "))
    }
}

/// Render ledger entries as an aligned table
pub fn render_entries(config: &OutputConfig, entries: &[LedgerEntry]) -> String {
    if entries.is_empty() {
        return format!("{} No environments recorded\n", emoji(config, "📭", "[INFO]"));
    }

    let header = ["SCOPE", "SERVICE", "KIND", "STATUS", "STATE KEY", "UPDATED"];
    let rows: Vec<[String; 6]> = entries
        .iter()
        .map(|entry| {
            [
                entry.scope.to_string(),
                entry.service_name.clone(),
                entry.kind.to_string(),
                entry.status.to_string(),
                entry.state_key.clone(),
                entry.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[&str]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    };
    push_row(&header);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&cells);
    }
    out
}
