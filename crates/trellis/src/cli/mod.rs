//! CLI argument parsing and command dispatch.
//!
//! # Commands
//!
//! - `init`: Initialize a new trellis repository
//! - `create`: Create a task
//! - `move`: Move a task among its siblings or under a new parent
//! - `update`: Change a task's title, assignee or status
//! - `status`: Change a task's status
//! - `delete`: Delete a task
//! - `batch`: Apply a JSON batch of moves atomically
//! - `show`: Show one task
//! - `tree`: Show a job's task tree
//! - `verify`: Check a job's tree invariants
//! - `jobs`: List jobs
//!
//! Every mutation takes `--expect <VERSION>`. A stale version prints the
//! current state and exits non-zero without writing anything.
//!
//! # Global Flags
//!
//! - `--json`: Output in JSON format (applies to all commands)
//!
//! # Example
//!
//! ```bash
//! trellis create --job release --title "Write notes"
//! trellis move task-a3f8 --expect 0 --before task-9k2c
//! trellis move task-a3f8 --expect 1 --parent task-x7p1 --first
//! trellis tree release
//! ```

mod args;
mod execute;
mod types;
mod validators;

use anyhow::Result;
use clap::{Parser, Subcommand};

pub use args::{
    BatchArgs, CreateArgs, DeleteArgs, InitArgs, JobArgs, MoveArgs, ShowArgs, StatusArgs,
    TargetArgs, UpdateArgs,
};
pub use types::TaskStatusArg;

/// Trellis - hierarchical task ordering with optimistic concurrency
///
/// Tasks are stored in `.trellis/tasks.jsonl`.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output in JSON format for programmatic use
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Initialize a new trellis repository
    ///
    /// Creates the `.trellis/` directory with configuration and an empty task file.
    Init(InitArgs),

    /// Create a task
    Create(CreateArgs),

    /// Move a task
    Move(MoveArgs),

    /// Update task fields
    Update(UpdateArgs),

    /// Change a task's status
    Status(StatusArgs),

    /// Delete a task
    Delete(DeleteArgs),

    /// Apply a batch of moves atomically
    Batch(BatchArgs),

    /// Show task details
    Show(ShowArgs),

    /// Show a job's task tree
    Tree(JobArgs),

    /// Check a job's tree invariants
    Verify(JobArgs),

    /// List jobs
    Jobs,
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }

    /// Parse CLI arguments from an iterator (for testing)
    pub fn try_parse_from<I, T>(iter: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(iter)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> Result<()> {
        use crate::app::App;
        use crate::output::OutputMode;

        let output_mode = if self.json {
            OutputMode::Json
        } else {
            OutputMode::Text
        };

        let Some(command) = &self.command else {
            println!("Trellis hierarchical task ordering");
            println!("Use --help for more information");
            return Ok(());
        };

        if let Commands::Init(args) = command {
            return execute::execute_init(args).await;
        }

        let app = App::from_directory(&std::env::current_dir()?).await?;
        match command {
            Commands::Init(_) => Ok(()),
            Commands::Create(args) => execute::execute_create(&app, args, output_mode).await,
            Commands::Move(args) => execute::execute_move(&app, args, output_mode).await,
            Commands::Update(args) => execute::execute_update(&app, args, output_mode).await,
            Commands::Status(args) => execute::execute_status(&app, args, output_mode).await,
            Commands::Delete(args) => execute::execute_delete(&app, args, output_mode).await,
            Commands::Batch(args) => execute::execute_batch(&app, args, output_mode).await,
            Commands::Show(args) => execute::execute_show(&app, args, output_mode).await,
            Commands::Tree(args) => execute::execute_tree(&app, args, output_mode).await,
            Commands::Verify(args) => execute::execute_verify(&app, args, output_mode).await,
            Commands::Jobs => execute::execute_jobs(&app, output_mode).await,
        }
    }
}
