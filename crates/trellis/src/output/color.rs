//! Color and styling helpers for CLI output.
//!
//! Semantic Color Theme:
//!   - Success/Done:  green   (completed status, committed mutations)
//!   - Warning/Active: yellow (in_progress, conflicts)
//!   - Error:         red     (cancelled status, violations)
//!   - Info/Reference: cyan   (task IDs, job header)
//!   - Muted:         dimmed  (positions, versions, connectors)

use crate::domain::TaskStatus;
use colored::Colorize;

use super::OutputConfig;

/// Apply semantic "success" color (green) to text.
pub fn success(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.green().to_string()
}

/// Apply semantic "error" color (red) to text.
pub fn error(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.red().to_string()
}

/// Apply semantic "warning" color (yellow) to text.
pub fn warning(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.yellow().to_string()
}

/// Colorize a task or job ID (cyan).
pub(crate) fn colorize_id(id: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return id.to_string();
    }
    id.cyan().to_string()
}

/// Apply dimmed style to text.
pub(crate) fn dimmed(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.dimmed().to_string()
}

/// Apply bold style to text.
pub(crate) fn bold(text: &str, config: &OutputConfig) -> String {
    if !config.use_colors {
        return text.to_string();
    }
    text.bold().to_string()
}

/// Get a colored status icon, with ASCII fallback support.
pub(crate) fn colored_status_icon(status: TaskStatus, config: &OutputConfig) -> String {
    let icon = if config.use_ascii {
        match status {
            TaskStatus::New => "o",
            TaskStatus::InProgress => ">",
            TaskStatus::Paused => "=",
            TaskStatus::Completed => "+",
            TaskStatus::Cancelled => "x",
        }
    } else {
        match status {
            TaskStatus::New => "○",
            TaskStatus::InProgress => "▶",
            TaskStatus::Paused => "‖",
            TaskStatus::Completed => "✓",
            TaskStatus::Cancelled => "✗",
        }
    };

    if !config.use_colors {
        return icon.to_string();
    }

    match status {
        TaskStatus::New => icon.white().to_string(),
        TaskStatus::InProgress => icon.yellow().to_string(),
        TaskStatus::Paused => icon.dimmed().to_string(),
        TaskStatus::Completed => icon.green().to_string(),
        TaskStatus::Cancelled => icon.red().to_string(),
    }
}
