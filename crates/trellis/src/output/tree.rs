//! Job tree rendering for `trellis tree` output.

use std::collections::HashMap;
use std::io::{self, Write};

use super::OutputConfig;
use super::color::{bold, colored_status_icon, colorize_id, dimmed};
use crate::domain::{JobId, TaskId, TaskNode};

/// Render a job's tasks with ASCII/Unicode connectors.
///
/// `tasks` must list parents before children with siblings in position
/// order, as [`TaskEngine::tasks`](crate::engine::TaskEngine::tasks) returns
/// them. Renders a tree like:
///
/// ```text
/// ◆ release (v7)
/// ├── ○ t-1 Plan  @1000 v0
/// │   └── ✓ t-3 Scope  @1000 v2
/// └── ▶ t-2 Build  @2000 v1
/// ```
pub fn render_job_tree<W: Write>(
    w: &mut W,
    job_id: &JobId,
    job_version: u64,
    tasks: &[TaskNode],
    config: &OutputConfig,
) -> io::Result<()> {
    let root_icon = if config.use_ascii { "*" } else { "◆" };
    writeln!(
        w,
        "{} {} {}",
        bold(root_icon, config),
        colorize_id(job_id.as_str(), config),
        dimmed(&format!("(v{job_version})"), config)
    )?;

    let mut children: HashMap<Option<&TaskId>, Vec<&TaskNode>> = HashMap::new();
    for task in tasks {
        children.entry(task.parent_id.as_ref()).or_default().push(task);
    }

    render_children(w, &children, None, &[], config)
}

/// `prefix_segments` tracks which ancestor levels still have siblings below,
/// used to draw the vertical continuation lines (`│`).
fn render_children<W: Write>(
    w: &mut W,
    children: &HashMap<Option<&TaskId>, Vec<&TaskNode>>,
    parent: Option<&TaskId>,
    prefix_segments: &[bool],
    config: &OutputConfig,
) -> io::Result<()> {
    let (branch, corner, pipe, space) = if config.use_ascii {
        ("|-- ", "`-- ", "|   ", "    ")
    } else {
        ("├── ", "└── ", "│   ", "    ")
    };

    let Some(scope) = children.get(&parent) else {
        return Ok(());
    };

    for (i, task) in scope.iter().enumerate() {
        let is_last = i + 1 == scope.len();

        let prefix: String = prefix_segments
            .iter()
            .map(|&has_more| dimmed(if has_more { pipe } else { space }, config))
            .collect();
        let connector = dimmed(if is_last { corner } else { branch }, config);
        let details = dimmed(
            &format!("@{} v{}", task.position, task.version),
            config,
        );

        writeln!(
            w,
            "{}{}{} {} {}  {}",
            prefix,
            connector,
            colored_status_icon(task.status, config),
            colorize_id(task.id.as_str(), config),
            task.title,
            details
        )?;

        let mut next_segments = prefix_segments.to_vec();
        next_segments.push(!is_last);
        render_children(w, children, Some(&task.id), &next_segments, config)?;
    }

    Ok(())
}
