//! JSONL persistence for the in-memory store.
//!
//! One JSON object per line. Each job is written as a header record followed
//! by its task records:
//!
//! ```text
//! {"record":"job","id":"j1","version":6}
//! {"record":"task","id":"task-a3f8","job_id":"j1","parent_id":null,"position":1000,...}
//! ```
//!
//! Loading is resilient: damaged input is repaired or skipped and reported as
//! a [`LoadWarning`] instead of failing the load, so a hand-edited or
//! partially written file still opens. Every repair that changes a task's
//! parent or position bumps that task's version and its job's version, so
//! clients holding pre-repair versions get a conflict rather than computing
//! keys against a list that no longer exists.

use super::in_memory::InMemoryStore;
use super::{JobExport, TaskStore};
use crate::domain::{JobId, TaskId, TaskNode, validate_title};
use crate::error::{Error, Result};
use crate::integrity;
use crate::position::PositionEngine;
use crate::tree::JobTree;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

/// One line of the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Job(JobHeader),
    Task(TaskNode),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobHeader {
    id: JobId,
    version: u64,
}

/// Non-fatal problems found while loading a JSONL file.
///
/// Each variant describes what was found and what the loader did about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadWarning {
    /// A line that is not a valid record. Skipped.
    MalformedRecord {
        /// 1-based line number
        line_number: usize,
        /// Parser message
        error: String,
    },

    /// A task that failed validation (empty or overlong title). Skipped.
    InvalidTask {
        /// The task
        task_id: TaskId,
        /// 1-based line number
        line_number: usize,
        /// Validation message
        error: String,
    },

    /// A second record for an already loaded task. Skipped.
    DuplicateTask {
        /// The task
        task_id: TaskId,
        /// 1-based line number of the ignored record
        line_number: usize,
    },

    /// Tasks name a job that has no header. The job is created at version 0.
    MissingJobHeader {
        /// The job
        job_id: JobId,
    },

    /// A task's parent is not in its job. The task is moved to the job root.
    OrphanedParent {
        /// The task
        task_id: TaskId,
        /// The missing parent
        parent_id: TaskId,
    },

    /// The parent graph had a cycle. The task closing it is moved to the job root.
    CycleBroken {
        /// The task that was detached
        task_id: TaskId,
        /// Its former parent
        parent_id: TaskId,
    },

    /// Siblings shared position keys. The scope is respaced in its stored order.
    DuplicatePositions {
        /// The job
        job_id: JobId,
        /// The scope (`None` for the job root)
        parent_id: Option<TaskId>,
    },

    /// A cached `subtree_count` was wrong. It is recomputed.
    StaleSubtreeCount {
        /// The task
        task_id: TaskId,
        /// Stored value
        cached: u64,
        /// Recomputed value
        actual: u64,
    },
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadWarning::MalformedRecord { line_number, error } => {
                write!(f, "line {line_number}: malformed record skipped ({error})")
            }
            LoadWarning::InvalidTask {
                task_id,
                line_number,
                error,
            } => write!(f, "line {line_number}: invalid task {task_id} skipped ({error})"),
            LoadWarning::DuplicateTask {
                task_id,
                line_number,
            } => write!(f, "line {line_number}: duplicate task {task_id} skipped"),
            LoadWarning::MissingJobHeader { job_id } => {
                write!(f, "job {job_id} has no header, created at version 0")
            }
            LoadWarning::OrphanedParent { task_id, parent_id } => {
                write!(f, "{task_id} names missing parent {parent_id}, moved to root")
            }
            LoadWarning::CycleBroken { task_id, parent_id } => {
                write!(f, "{task_id} closed a parent cycle through {parent_id}, moved to root")
            }
            LoadWarning::DuplicatePositions { job_id, parent_id } => match parent_id {
                Some(parent) => write!(f, "job {job_id}: duplicate positions under {parent}, respaced"),
                None => write!(f, "job {job_id}: duplicate positions at the root, respaced"),
            },
            LoadWarning::StaleSubtreeCount {
                task_id,
                cached,
                actual,
            } => write!(f, "{task_id}: subtree_count {cached} recomputed as {actual}"),
        }
    }
}

/// Tasks of one job plus the ids whose structure was repaired.
struct JobLoad {
    version: u64,
    tasks: BTreeMap<TaskId, TaskNode>,
    repaired: HashSet<TaskId>,
}

impl JobLoad {
    fn new(version: u64) -> Self {
        Self {
            version,
            tasks: BTreeMap::new(),
            repaired: HashSet::new(),
        }
    }

    fn detach(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.parent_id = None;
            self.repaired.insert(id.clone());
        }
    }
}

/// Load a store from a JSONL file.
///
/// Reads every record, then repairs each job in order: orphaned parents,
/// parent cycles, duplicate sibling positions, stale subtree counts. See
/// [`LoadWarning`] for what each repair does. Respaced siblings get keys
/// `position_increment` apart, the same spacing the engine uses.
///
/// # Errors
///
/// - `Error::Io` if the file cannot be read
/// - `Error::InvariantViolation` if a job is still unsound after repair
pub async fn load_from_jsonl(
    path: &Path,
    lock_timeout: Duration,
    position_increment: i64,
) -> Result<(InMemoryStore, Vec<LoadWarning>)> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut warnings = Vec::new();

    let mut headers: HashMap<JobId, u64> = HashMap::new();
    let mut jobs: BTreeMap<JobId, JobLoad> = BTreeMap::new();
    let mut seen: HashSet<TaskId> = HashSet::new();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Record>(&line) {
            Err(e) => warnings.push(LoadWarning::MalformedRecord {
                line_number,
                error: e.to_string(),
            }),
            Ok(Record::Job(header)) => {
                let version = headers.entry(header.id).or_default();
                *version = (*version).max(header.version);
            }
            Ok(Record::Task(task)) => {
                if let Err(error) = validate_title(&task.title) {
                    warnings.push(LoadWarning::InvalidTask {
                        task_id: task.id,
                        line_number,
                        error,
                    });
                    continue;
                }
                if !seen.insert(task.id.clone()) {
                    warnings.push(LoadWarning::DuplicateTask {
                        task_id: task.id,
                        line_number,
                    });
                    continue;
                }
                jobs.entry(task.job_id.clone())
                    .or_insert_with(|| JobLoad::new(0))
                    .tasks
                    .insert(task.id.clone(), task);
            }
        }
    }

    for (job_id, job) in &mut jobs {
        match headers.remove(job_id) {
            Some(version) => job.version = version,
            None => warnings.push(LoadWarning::MissingJobHeader {
                job_id: job_id.clone(),
            }),
        }
    }
    for (job_id, version) in headers {
        jobs.insert(job_id, JobLoad::new(version));
    }

    let positions = PositionEngine::new(position_increment);
    let mut exports = Vec::with_capacity(jobs.len());
    for (job_id, mut job) in jobs {
        repair_orphans(&mut job, &mut warnings);
        repair_cycles(&mut job, &mut warnings);
        repair_positions(&job_id, &mut job, &positions, &mut warnings)?;
        exports.push(finish_job(job_id, job, &mut warnings)?);
    }

    debug!(
        path = %path.display(),
        jobs = exports.len(),
        warnings = warnings.len(),
        "Loaded JSONL store"
    );

    Ok((InMemoryStore::from_exports(exports, lock_timeout), warnings))
}

fn repair_orphans(job: &mut JobLoad, warnings: &mut Vec<LoadWarning>) {
    let orphans: Vec<(TaskId, TaskId)> = job
        .tasks
        .values()
        .filter_map(|task| {
            let parent = task.parent_id.as_ref()?;
            (!job.tasks.contains_key(parent)).then(|| (task.id.clone(), parent.clone()))
        })
        .collect();

    for (task_id, parent_id) in orphans {
        job.detach(&task_id);
        warnings.push(LoadWarning::OrphanedParent { task_id, parent_id });
    }
}

fn repair_cycles(job: &mut JobLoad, warnings: &mut Vec<LoadWarning>) {
    let ids: Vec<TaskId> = job.tasks.keys().cloned().collect();
    let mut settled: HashSet<TaskId> = HashSet::new();

    for start in ids {
        let mut path: Vec<TaskId> = Vec::new();
        let mut on_path: HashSet<TaskId> = HashSet::new();
        let mut current = Some(start);

        while let Some(id) = current {
            if settled.contains(&id) {
                break;
            }
            if !on_path.insert(id.clone()) {
                if let Some(closing) = path.last().cloned() {
                    job.detach(&closing);
                    warnings.push(LoadWarning::CycleBroken {
                        task_id: closing,
                        parent_id: id,
                    });
                }
                break;
            }
            current = job.tasks.get(&id).and_then(|t| t.parent_id.clone());
            path.push(id);
        }

        settled.extend(path);
    }
}

fn repair_positions(
    job_id: &JobId,
    job: &mut JobLoad,
    positions: &PositionEngine,
    warnings: &mut Vec<LoadWarning>,
) -> Result<()> {
    let mut scopes: BTreeMap<Option<TaskId>, Vec<(i64, TaskId)>> = BTreeMap::new();
    for task in job.tasks.values() {
        scopes
            .entry(task.parent_id.clone())
            .or_default()
            .push((task.position.get(), task.id.clone()));
    }

    for (parent_id, mut members) in scopes {
        members.sort();
        if !members.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            continue;
        }

        let keys = positions.spaced(members.len())?;
        for ((_, id), key) in members.into_iter().zip(keys) {
            if let Some(task) = job.tasks.get_mut(&id) {
                if task.position != key {
                    task.position = key;
                    job.repaired.insert(id);
                }
            }
        }
        warnings.push(LoadWarning::DuplicatePositions {
            job_id: job_id.clone(),
            parent_id,
        });
    }

    Ok(())
}

fn finish_job(job_id: JobId, mut job: JobLoad, warnings: &mut Vec<LoadWarning>) -> Result<JobExport> {
    if !job.repaired.is_empty() {
        for id in &job.repaired {
            if let Some(task) = job.tasks.get_mut(id) {
                task.version += 1;
            }
        }
        job.version += 1;
    }

    let tree = JobTree::new(job_id.clone(), job.version, job.tasks.values().cloned())?;
    let actual = integrity::actual_subtree_counts(&tree);
    for task in job.tasks.values_mut() {
        let real = actual.get(&task.id).copied().unwrap_or_default();
        if task.subtree_count != real {
            warnings.push(LoadWarning::StaleSubtreeCount {
                task_id: task.id.clone(),
                cached: task.subtree_count,
                actual: real,
            });
            task.subtree_count = real;
        }
    }

    let tasks: Vec<TaskNode> = job.tasks.into_values().collect();
    let repaired = JobTree::new(job_id.clone(), job.version, tasks.clone())?;
    let violations = integrity::verify(&repaired);
    if let Some(first) = violations.first() {
        return Err(Error::InvariantViolation(format!(
            "job {job_id} unsound after repair: {first}"
        )));
    }

    Ok(JobExport {
        job_id,
        job_version: job.version,
        tasks,
    })
}

/// Save a store to a JSONL file with an atomic write.
///
/// Writes to a `.tmp` sibling first, then renames it over `path`, so a crash
/// leaves either the old file or the new one. Jobs are written in id order
/// and tasks in id order within each job, so unchanged data produces an
/// identical file.
pub async fn save_to_jsonl(store: &dyn TaskStore, path: &Path) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path).await?;
    let mut writer = BufWriter::new(file);

    for export in store.export_all().await? {
        let header = Record::Job(JobHeader {
            id: export.job_id,
            version: export.job_version,
        });
        write_record(&mut writer, &header).await?;
        for task in export.tasks {
            write_record(&mut writer, &Record::Task(task)).await?;
        }
    }

    writer.flush().await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn write_record(writer: &mut BufWriter<File>, record: &Record) -> Result<()> {
    let json = serde_json::to_string(record)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::DEFAULT_INCREMENT;
    use crate::storage::{ChangeSet, TaskStore};
    use crate::tree::tests::node;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn task_line(mut task: TaskNode, subtree_count: u64) -> String {
        task.subtree_count = subtree_count;
        serde_json::to_string(&Record::Task(task)).unwrap()
    }

    async fn write_lines(temp: &TempDir, lines: &[String]) -> std::path::PathBuf {
        let path = temp.path().join("tasks.jsonl");
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        let store = InMemoryStore::new(TIMEOUT);
        store.ensure_job(&JobId::new("j1")).await.unwrap();
        let mut a = node("a", None, 1000);
        a.subtree_count = 1;
        let txn = store.begin(&JobId::new("j1")).await.unwrap();
        txn.commit(ChangeSet {
            job_id: JobId::new("j1"),
            base_job_version: 0,
            new_job_version: 3,
            inserts: vec![a, node("a1", Some("a"), 1000)],
            updates: vec![],
            deletes: vec![],
        })
        .await
        .unwrap();

        save_to_jsonl(&store, &path).await.unwrap();
        let (loaded, warnings) = load_from_jsonl(&path, TIMEOUT, DEFAULT_INCREMENT).await.unwrap();

        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(
            loaded.export_all().await.unwrap(),
            store.export_all().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_malformed_and_invalid_lines_are_skipped() {
        let temp = TempDir::new().unwrap();
        let mut untitled = node("bad", None, 2000);
        untitled.title = String::new();
        let path = write_lines(
            &temp,
            &[
                r#"{"record":"job","id":"j1","version":2}"#.to_string(),
                "{not json".to_string(),
                task_line(node("a", None, 1000), 0),
                task_line(untitled, 0),
                task_line(node("a", None, 5000), 0),
            ],
        )
        .await;

        let (store, warnings) = load_from_jsonl(&path, TIMEOUT, DEFAULT_INCREMENT).await.unwrap();

        assert!(matches!(
            warnings[0],
            LoadWarning::MalformedRecord { line_number: 2, .. }
        ));
        assert!(matches!(warnings[1], LoadWarning::InvalidTask { line_number: 4, .. }));
        assert!(matches!(warnings[2], LoadWarning::DuplicateTask { line_number: 5, .. }));
        let a = store.get(&TaskId::new("a")).await.unwrap().unwrap();
        assert_eq!(a.position.get(), 1000);
        assert_eq!(store.task_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphan_moved_to_root_and_versions_bumped() {
        let temp = TempDir::new().unwrap();
        let path = write_lines(
            &temp,
            &[
                r#"{"record":"job","id":"j1","version":4}"#.to_string(),
                task_line(node("a", None, 1000), 0),
                task_line(node("lost", Some("ghost"), 1000), 0),
            ],
        )
        .await;

        let (store, warnings) = load_from_jsonl(&path, TIMEOUT, DEFAULT_INCREMENT).await.unwrap();

        assert!(warnings.contains(&LoadWarning::OrphanedParent {
            task_id: TaskId::new("lost"),
            parent_id: TaskId::new("ghost"),
        }));
        // Both now share root key 1000
        assert!(warnings.iter().any(|w| matches!(w, LoadWarning::DuplicatePositions { .. })));

        let export = store.export_job(&JobId::new("j1")).await.unwrap();
        assert_eq!(export.job_version, 5);
        let lost = store.get(&TaskId::new("lost")).await.unwrap().unwrap();
        assert_eq!(lost.parent_id, None);
        assert_eq!(lost.version, 1);
    }

    #[tokio::test]
    async fn test_cycle_broken_and_counts_recomputed() {
        let temp = TempDir::new().unwrap();
        let path = write_lines(
            &temp,
            &[
                task_line(node("x", Some("y"), 1000), 7),
                task_line(node("y", Some("x"), 1000), 7),
            ],
        )
        .await;

        let (store, warnings) = load_from_jsonl(&path, TIMEOUT, DEFAULT_INCREMENT).await.unwrap();

        assert!(warnings.contains(&LoadWarning::MissingJobHeader {
            job_id: JobId::new("j1")
        }));
        assert!(warnings.iter().any(|w| matches!(w, LoadWarning::CycleBroken { .. })));
        assert!(warnings.iter().any(|w| matches!(w, LoadWarning::StaleSubtreeCount { .. })));

        let export = store.export_job(&JobId::new("j1")).await.unwrap();
        let tree = JobTree::new(JobId::new("j1"), export.job_version, export.tasks).unwrap();
        assert!(integrity::verify(&tree).is_empty());
        assert!(!tree.has_cycle());
    }

    #[tokio::test]
    async fn test_job_header_without_tasks_is_kept() {
        let temp = TempDir::new().unwrap();
        let path = write_lines(
            &temp,
            &[r#"{"record":"job","id":"empty","version":9}"#.to_string()],
        )
        .await;

        let (store, warnings) = load_from_jsonl(&path, TIMEOUT, DEFAULT_INCREMENT).await.unwrap();

        assert!(warnings.is_empty());
        let export = store.export_job(&JobId::new("empty")).await.unwrap();
        assert_eq!(export.job_version, 9);
        assert!(export.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_positions_respaced_with_configured_increment() {
        let temp = TempDir::new().unwrap();
        let path = write_lines(
            &temp,
            &[
                r#"{"record":"job","id":"j1","version":3}"#.to_string(),
                task_line(node("a", None, 40), 0),
                task_line(node("b", None, 40), 0),
                task_line(node("c", None, 90), 0),
            ],
        )
        .await;

        let (store, warnings) = load_from_jsonl(&path, TIMEOUT, 10).await.unwrap();

        assert!(warnings.contains(&LoadWarning::DuplicatePositions {
            job_id: JobId::new("j1"),
            parent_id: None,
        }));
        let mut keys = Vec::new();
        for id in ["a", "b", "c"] {
            let task = store.get(&TaskId::new(id)).await.unwrap().unwrap();
            keys.push(task.position.get());
        }
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(store.export_job(&JobId::new("j1")).await.unwrap().job_version, 4);
    }
}
