//! Output formatting for CLI commands.
//!
//! Every printer takes an [`OutputMode`]: text for people, JSON for scripts.
//!
//! Submodules:
//! - [`color`]: Color and styling helpers
//! - [`tree`]: Job tree rendering with ASCII/Unicode connectors

pub mod color;
pub mod tree;

use crate::domain::{
    BatchConflictReason, BatchOutcome, JobId, MoveSuccess, ScopeSnapshot, StaleVersion, TaskNode,
};
use crate::integrity::Violation;
use serde::Serialize;
use std::env;
use std::io::{self, Write};

pub use color::{error, success, warning};
pub use tree::render_job_tree;

use color::{colored_status_icon, colorize_id, dimmed};

// ============================================================================
// Output Configuration
// ============================================================================

/// Configuration for text output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Whether to use ASCII-only icons instead of Unicode.
    pub use_ascii: bool,
    /// Whether to use colors in output.
    pub use_colors: bool,
}

impl OutputConfig {
    /// Create a new OutputConfig with explicit values.
    pub fn new(use_ascii: bool, use_colors: bool) -> Self {
        Self {
            use_ascii,
            use_colors,
        }
    }

    /// Create an OutputConfig by reading from environment variables.
    ///
    /// Reads:
    /// - `TRELLIS_ASCII`: "1" or "true" for ASCII-only icons (default: false)
    /// - `NO_COLOR`: Standard env var to disable colors (any value disables colors)
    /// - `TRELLIS_COLOR`: "0" or "false" to disable colors (default: true)
    pub fn from_env() -> Self {
        let use_ascii = match env::var("TRELLIS_ASCII") {
            Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => true,
            Ok(v) if v == "0" || v.eq_ignore_ascii_case("false") || v.is_empty() => false,
            Ok(v) => {
                tracing::warn!(
                    env_var = "TRELLIS_ASCII",
                    value = %v,
                    "Invalid value (expected '1', 'true', '0', or 'false'), using default"
                );
                false
            }
            Err(_) => false,
        };

        // https://no-color.org/
        let use_colors = env::var("NO_COLOR").is_err()
            && env::var("TRELLIS_COLOR")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true);

        Self {
            use_ascii,
            use_colors,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::new(false, true)
    }
}

/// Output format mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable text format
    Text,
    /// JSON format for programmatic use
    Json,
}

// ============================================================================
// Public Dispatch Functions
// ============================================================================

/// Print any serializable value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(handle, "{json}")
}

/// Print one task.
pub fn print_task(task: &TaskNode, mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Json => print_json(task),
        OutputMode::Text => {
            let config = OutputConfig::from_env();
            let mut handle = io::stdout().lock();
            write_task_line(&mut handle, task, &config)
        }
    }
}

/// Print a committed move.
pub fn print_move(moved: &MoveSuccess, mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Json => print_json(moved),
        OutputMode::Text => {
            let config = OutputConfig::from_env();
            let mut handle = io::stdout().lock();
            writeln!(
                handle,
                "{} {} to {} under {} (v{}, job v{})",
                success("Moved", &config),
                colorize_id(moved.task_id.as_str(), &config),
                moved.position,
                moved
                    .parent_id
                    .as_ref()
                    .map_or("the job root", |p| p.as_str()),
                moved.new_version,
                moved.job_version
            )?;
            if !moved.renumbered.is_empty() {
                writeln!(
                    handle,
                    "  {}",
                    dimmed(
                        &format!("renumbered {} sibling(s)", moved.renumbered.len()),
                        &config
                    )
                )?;
            }
            Ok(())
        }
    }
}

/// Print a single-task conflict with the scopes to rebase on.
pub fn print_conflict(stale: &StaleVersion, mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Json => print_json(&serde_json::json!({ "conflict": stale })),
        OutputMode::Text => {
            let config = OutputConfig::from_env();
            let mut handle = io::stderr().lock();
            writeln!(
                handle,
                "{} {} is at version {}, not {} (job v{})",
                warning("Conflict:", &config),
                colorize_id(stale.task_id.as_str(), &config),
                stale.current_version,
                stale.expected_version,
                stale.snapshot.job_version
            )?;
            for scope in &stale.snapshot.scopes {
                write_scope(&mut handle, scope, &config)?;
            }
            Ok(())
        }
    }
}

/// Print the result of a batch.
pub fn print_batch_outcome(outcome: &BatchOutcome, mode: OutputMode) -> io::Result<()> {
    match (outcome, mode) {
        (BatchOutcome::Committed(success), OutputMode::Json) => print_json(success),
        (BatchOutcome::Conflict(conflict), OutputMode::Json) => {
            print_json(&serde_json::json!({ "conflict": conflict }))
        }
        (BatchOutcome::Committed(committed), OutputMode::Text) => {
            let config = OutputConfig::from_env();
            println!(
                "{} batch: {} task(s) touched, job now at v{}",
                success("Committed", &config),
                committed.touched.len(),
                committed.new_job_version
            );
            Ok(())
        }
        (BatchOutcome::Conflict(conflict), OutputMode::Text) => {
            let config = OutputConfig::from_env();
            let reason = match &conflict.reason {
                BatchConflictReason::JobVersion { expected, current } => {
                    format!("job is at v{current}, not v{expected}")
                }
                BatchConflictReason::TaskVersion {
                    task_id,
                    expected,
                    current,
                } => format!("{task_id} is at version {current}, not {expected}"),
            };
            eprintln!("{} {reason}", warning("Batch conflict:", &config));
            let mut handle = io::stderr().lock();
            for task in &conflict.snapshot.tasks {
                writeln!(
                    handle,
                    "  {} @{} v{}",
                    colorize_id(task.id.as_str(), &config),
                    task.position,
                    task.version
                )?;
            }
            Ok(())
        }
    }
}

/// Print the result of an integrity check.
pub fn print_violations(job_id: &JobId, violations: &[Violation], mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Json => {
            let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
            print_json(&serde_json::json!({
                "job_id": job_id,
                "ok": violations.is_empty(),
                "violations": messages,
            }))
        }
        OutputMode::Text => {
            let config = OutputConfig::from_env();
            if violations.is_empty() {
                println!("{} {job_id}: all invariants hold", success("OK", &config));
            } else {
                for violation in violations {
                    println!("{} {violation}", error("VIOLATION", &config));
                }
            }
            Ok(())
        }
    }
}

// ============================================================================
// Text Formatting
// ============================================================================

fn write_task_line<W: Write>(w: &mut W, task: &TaskNode, config: &OutputConfig) -> io::Result<()> {
    writeln!(
        w,
        "{} {} {}  {}",
        colored_status_icon(task.status, config),
        colorize_id(task.id.as_str(), config),
        task.title,
        dimmed(
            &format!("@{} v{} [{}]", task.position, task.version, task.job_id),
            config
        )
    )
}

fn write_scope<W: Write>(w: &mut W, scope: &ScopeSnapshot, config: &OutputConfig) -> io::Result<()> {
    let label = scope
        .parent_id
        .as_ref()
        .map_or_else(|| "job root".to_string(), |p| format!("children of {p}"));
    writeln!(w, "  {}:", dimmed(&label, config))?;
    for sibling in &scope.siblings {
        writeln!(
            w,
            "    {} @{} v{}",
            colorize_id(sibling.id.as_str(), config),
            sibling.position,
            sibling.version
        )?;
    }
    Ok(())
}
