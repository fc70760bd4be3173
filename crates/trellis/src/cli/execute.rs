//! Command execution logic.
//!
//! Mutating commands save the task file after a commit. A conflict prints
//! the state to rebase on and fails the command without saving.

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use super::args::{
    BatchArgs, CreateArgs, DeleteArgs, InitArgs, JobArgs, MoveArgs, ShowArgs, StatusArgs,
    UpdateArgs,
};
use crate::app::App;
use crate::batch::BatchRequest;
use crate::domain::{BatchOutcome, JobId, NewTask, Outcome, StaleVersion, TaskId, TaskUpdate};
use crate::error::Error;
use crate::output::{self, OutputConfig, OutputMode};

/// Execute the init command
pub async fn execute_init(args: &InitArgs) -> Result<()> {
    use crate::commands::init;

    let current_dir = std::env::current_dir()?;
    let result = init::init(&current_dir, args.prefix.as_deref()).await?;

    if !args.quiet {
        println!("Initialized trellis in {}", result.trellis_dir.display());
        println!("  Config: {}", result.config_file.display());
        println!("  Tasks:  {}", result.tasks_file.display());
        println!("  Task prefix: {}", result.prefix);
    }

    Ok(())
}

/// Print a conflict and turn it into a failing result.
fn conflict(stale: &StaleVersion, output_mode: OutputMode) -> Result<()> {
    output::print_conflict(stale, output_mode)?;
    anyhow::bail!(
        "version conflict on {}: expected {}, found {}",
        stale.task_id,
        stale.expected_version,
        stale.current_version
    )
}

/// Execute the create command
pub async fn execute_create(app: &App, args: &CreateArgs, output_mode: OutputMode) -> Result<()> {
    let fields = NewTask {
        title: args.title.clone(),
        status: args.status.into(),
        assignee: args.assignee.clone(),
    };
    let parent = args.parent.as_deref().map(TaskId::new);

    let task = app
        .engine()
        .create_task(
            &JobId::new(args.job.as_str()),
            parent.as_ref(),
            &args.target.target(),
            fields,
        )
        .await?;
    app.save().await?;

    match output_mode {
        OutputMode::Json => output::print_json(&task)?,
        OutputMode::Text => println!("Created task: {}", task.id),
    }
    Ok(())
}

/// Execute the move command
pub async fn execute_move(app: &App, args: &MoveArgs, output_mode: OutputMode) -> Result<()> {
    let task_id = TaskId::new(args.task_id.as_str());
    let new_parent = args.new_parent();

    let outcome = app
        .engine()
        .move_task(
            &task_id,
            args.expected_version,
            &args.target.target(),
            new_parent.as_ref().map(Option::as_ref),
        )
        .await?;

    match outcome {
        Outcome::Committed(moved) => {
            app.save().await?;
            output::print_move(&moved, output_mode)?;
            Ok(())
        }
        Outcome::Conflict(stale) => conflict(&stale, output_mode),
    }
}

/// Execute the update command
pub async fn execute_update(app: &App, args: &UpdateArgs, output_mode: OutputMode) -> Result<()> {
    let assignee = if args.unassign {
        Some(None)
    } else {
        args.assignee.clone().map(Some)
    };
    let update = TaskUpdate {
        title: args.title.clone(),
        assignee,
        status: args.status.map(Into::into),
        ..Default::default()
    };

    let outcome = app
        .engine()
        .update_task(
            &TaskId::new(args.task_id.as_str()),
            args.expected_version,
            update,
        )
        .await?;
    finish_task_mutation(app, outcome, output_mode).await
}

/// Execute the status command
pub async fn execute_status(app: &App, args: &StatusArgs, output_mode: OutputMode) -> Result<()> {
    let outcome = app
        .engine()
        .set_status(
            &TaskId::new(args.task_id.as_str()),
            args.expected_version,
            args.status.into(),
        )
        .await?;
    finish_task_mutation(app, outcome, output_mode).await
}

async fn finish_task_mutation(
    app: &App,
    outcome: Outcome<crate::domain::TaskNode>,
    output_mode: OutputMode,
) -> Result<()> {
    match outcome {
        Outcome::Committed(task) => {
            app.save().await?;
            match output_mode {
                OutputMode::Json => output::print_json(&task)?,
                OutputMode::Text => println!("Updated task: {} (v{})", task.id, task.version),
            }
            Ok(())
        }
        Outcome::Conflict(stale) => conflict(&stale, output_mode),
    }
}

/// Execute the delete command
pub async fn execute_delete(app: &App, args: &DeleteArgs, output_mode: OutputMode) -> Result<()> {
    let outcome = app
        .engine()
        .delete_task(&TaskId::new(args.task_id.as_str()), args.expected_version)
        .await?;

    match outcome {
        Outcome::Committed(deleted) => {
            app.save().await?;
            match output_mode {
                OutputMode::Json => output::print_json(&deleted)?,
                OutputMode::Text => {
                    let ids: Vec<&str> = deleted.removed.iter().map(TaskId::as_str).collect();
                    println!("Deleted {} task(s): {}", ids.len(), ids.join(", "));
                }
            }
            Ok(())
        }
        Outcome::Conflict(stale) => conflict(&stale, output_mode),
    }
}

/// Execute the batch command
pub async fn execute_batch(app: &App, args: &BatchArgs, output_mode: OutputMode) -> Result<()> {
    let content = if args.file.as_os_str() == "-" {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(&args.file)
            .await
            .with_context(|| format!("reading {}", args.file.display()))?
    };
    let request: BatchRequest = serde_json::from_str(&content).context("parsing batch request")?;

    let outcome = app.engine().apply_batch(&request).await?;
    output::print_batch_outcome(&outcome, output_mode)?;

    match outcome {
        BatchOutcome::Committed(_) => {
            app.save().await?;
            Ok(())
        }
        BatchOutcome::Conflict(_) => anyhow::bail!("batch on {} rejected as stale", request.job_id),
    }
}

/// Execute the show command
pub async fn execute_show(app: &App, args: &ShowArgs, output_mode: OutputMode) -> Result<()> {
    let task_id = TaskId::new(args.task_id.as_str());
    let task = app
        .engine()
        .get_task(&task_id)
        .await?
        .ok_or(Error::TaskNotFound(task_id))?;
    output::print_task(&task, output_mode)?;
    Ok(())
}

/// Execute the tree command
pub async fn execute_tree(app: &App, args: &JobArgs, output_mode: OutputMode) -> Result<()> {
    let job_id = JobId::new(args.job_id.as_str());
    let job_version = app.engine().job_snapshot(&job_id).await?.job_version;
    let tasks = app.engine().tasks(&job_id).await?;

    match output_mode {
        OutputMode::Json => output::print_json(&serde_json::json!({
            "job_id": job_id,
            "job_version": job_version,
            "tasks": tasks,
        }))?,
        OutputMode::Text => {
            let mut handle = std::io::stdout().lock();
            output::render_job_tree(
                &mut handle,
                &job_id,
                job_version,
                &tasks,
                &OutputConfig::from_env(),
            )?;
        }
    }
    Ok(())
}

/// Execute the verify command
pub async fn execute_verify(app: &App, args: &JobArgs, output_mode: OutputMode) -> Result<()> {
    let job_id = JobId::new(args.job_id.as_str());
    let violations = app.engine().verify_job(&job_id).await?;
    output::print_violations(&job_id, &violations, output_mode)?;

    if !violations.is_empty() {
        anyhow::bail!("{} invariant violation(s) in {job_id}", violations.len());
    }
    Ok(())
}

/// Execute the jobs command
pub async fn execute_jobs(app: &App, output_mode: OutputMode) -> Result<()> {
    let jobs = app.engine().jobs().await?;
    match output_mode {
        OutputMode::Json => output::print_json(&jobs)?,
        OutputMode::Text => {
            for job in &jobs {
                let snapshot = app.engine().job_snapshot(job).await?;
                println!(
                    "{job}  v{}  {} task(s)",
                    snapshot.job_version,
                    snapshot.tasks.len()
                );
            }
        }
    }
    Ok(())
}
