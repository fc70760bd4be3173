//! CLI value enums and domain type conversions.

use clap::ValueEnum;

use crate::domain::TaskStatus;

/// Task status for CLI arguments
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatusArg {
    /// Not started
    New,
    /// Being worked on
    #[value(name = "in_progress", alias = "in-progress")]
    InProgress,
    /// Temporarily halted
    Paused,
    /// Done
    Completed,
    /// Abandoned
    Cancelled,
}

impl From<TaskStatusArg> for TaskStatus {
    fn from(arg: TaskStatusArg) -> Self {
        match arg {
            TaskStatusArg::New => TaskStatus::New,
            TaskStatusArg::InProgress => TaskStatus::InProgress,
            TaskStatusArg::Paused => TaskStatus::Paused,
            TaskStatusArg::Completed => TaskStatus::Completed,
            TaskStatusArg::Cancelled => TaskStatus::Cancelled,
        }
    }
}
