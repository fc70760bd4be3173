//! CLI argument structs for all commands.

use clap::{Args, Parser};
use std::path::PathBuf;

use super::types::TaskStatusArg;
use super::validators::{validate_id, validate_prefix, validate_title};
use crate::domain::{PositionTarget, TaskId};

/// Arguments for the `init` command
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Task ID prefix (e.g., "proj" for "proj-a3f8")
    ///
    /// Must be 2-20 alphanumeric characters.
    #[arg(short, long, value_parser = validate_prefix)]
    pub prefix: Option<String>,

    /// Suppress output messages
    #[arg(short, long)]
    pub quiet: bool,
}

/// Where to place a task among its siblings (default: last)
#[derive(Args, Debug, Clone, Default)]
#[group(multiple = false)]
pub struct TargetArgs {
    /// Place before every sibling
    #[arg(long)]
    pub first: bool,

    /// Place after every sibling (the default)
    #[arg(long)]
    pub last: bool,

    /// Place immediately before this sibling
    #[arg(long, value_name = "TASK", value_parser = validate_id)]
    pub before: Option<String>,

    /// Place immediately after this sibling
    #[arg(long, value_name = "TASK", value_parser = validate_id)]
    pub after: Option<String>,

    /// Place at this 1-based index (out of range clamps)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub index: Option<u32>,
}

impl TargetArgs {
    /// Whether any target flag was given.
    pub fn is_set(&self) -> bool {
        self.first
            || self.last
            || self.before.is_some()
            || self.after.is_some()
            || self.index.is_some()
    }

    /// The selected target.
    pub fn target(&self) -> PositionTarget {
        if self.first {
            PositionTarget::First
        } else if let Some(before) = &self.before {
            PositionTarget::Before(TaskId::new(before.as_str()))
        } else if let Some(after) = &self.after {
            PositionTarget::After(TaskId::new(after.as_str()))
        } else if let Some(index) = self.index {
            PositionTarget::Index(index as usize)
        } else {
            PositionTarget::Last
        }
    }
}

/// Arguments for the `create` command
#[derive(Parser, Debug, Clone)]
pub struct CreateArgs {
    /// Job the task belongs to (created on first use)
    #[arg(short, long, value_parser = validate_id)]
    pub job: String,

    /// Task title (max 200 characters)
    #[arg(short, long, value_parser = validate_title)]
    pub title: String,

    /// Parent task; omit for a root task
    #[arg(long, value_parser = validate_id)]
    pub parent: Option<String>,

    /// Initial status
    #[arg(short, long, value_enum, default_value = "new")]
    pub status: TaskStatusArg,

    /// Assignee username
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Position among siblings
    #[command(flatten)]
    pub target: TargetArgs,
}

/// Arguments for the `move` command
#[derive(Parser, Debug, Clone)]
pub struct MoveArgs {
    /// Task to move
    #[arg(value_parser = validate_id)]
    pub task_id: String,

    /// Version you last saw; the move is refused if the task changed since
    #[arg(short = 'e', long = "expect")]
    pub expected_version: u64,

    /// New parent task
    #[arg(long, value_parser = validate_id, conflicts_with = "root")]
    pub parent: Option<String>,

    /// Move to the job root
    #[arg(long)]
    pub root: bool,

    /// Position among siblings
    #[command(flatten)]
    pub target: TargetArgs,
}

impl MoveArgs {
    /// The requested parent change: `None` keeps the parent.
    pub fn new_parent(&self) -> Option<Option<TaskId>> {
        if self.root {
            Some(None)
        } else {
            self.parent
                .as_ref()
                .map(|p| Some(TaskId::new(p.as_str())))
        }
    }
}

/// Arguments for the `update` command
#[derive(Parser, Debug, Clone)]
pub struct UpdateArgs {
    /// Task to update
    #[arg(value_parser = validate_id)]
    pub task_id: String,

    /// Version you last saw
    #[arg(short = 'e', long = "expect")]
    pub expected_version: u64,

    /// New title
    #[arg(short, long, value_parser = validate_title)]
    pub title: Option<String>,

    /// New assignee
    #[arg(short, long, conflicts_with = "unassign")]
    pub assignee: Option<String>,

    /// Clear the assignee
    #[arg(long)]
    pub unassign: bool,

    /// New status
    #[arg(short, long, value_enum)]
    pub status: Option<TaskStatusArg>,
}

/// Arguments for the `status` command
#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    /// Task to change
    #[arg(value_parser = validate_id)]
    pub task_id: String,

    /// New status
    #[arg(value_enum)]
    pub status: TaskStatusArg,

    /// Version you last saw
    #[arg(short = 'e', long = "expect")]
    pub expected_version: u64,
}

/// Arguments for the `delete` command
#[derive(Parser, Debug, Clone)]
pub struct DeleteArgs {
    /// Task to delete
    #[arg(value_parser = validate_id)]
    pub task_id: String,

    /// Version you last saw
    #[arg(short = 'e', long = "expect")]
    pub expected_version: u64,
}

/// Arguments for the `batch` command
#[derive(Parser, Debug, Clone)]
pub struct BatchArgs {
    /// JSON file with `job_id`, optional `expected_job_version` and `operations`
    ///
    /// Use `-` to read from stdin.
    pub file: PathBuf,
}

/// Arguments for the `show` command
#[derive(Parser, Debug, Clone)]
pub struct ShowArgs {
    /// Task to show
    #[arg(value_parser = validate_id)]
    pub task_id: String,
}

/// Arguments for commands that take a job
#[derive(Parser, Debug, Clone)]
pub struct JobArgs {
    /// The job
    #[arg(value_parser = validate_id)]
    pub job_id: String,
}
