//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Output};
use trellis::clock::ManualClock;
use trellis::config::EngineConfig;
use trellis::domain::{JobId, NewTask, PositionTarget, TaskId, TaskNode};
use trellis::engine::TaskEngine;
use trellis::id_generation::SequentialIdGenerator;
use trellis::storage::InMemoryStore;

/// An in-memory engine with `t-1`, `t-2`, ... IDs and a fixed clock.
pub fn engine() -> TaskEngine {
    engine_with(EngineConfig::default())
}

/// Like [`engine`], with a custom configuration.
pub fn engine_with(config: EngineConfig) -> TaskEngine {
    let store = InMemoryStore::new(config.lock_timeout());
    TaskEngine::new(Box::new(store), config)
        .with_id_generator(SequentialIdGenerator::new("t"))
        .with_clock(ManualClock::default())
}

/// Append a task with the given title.
pub async fn create(engine: &TaskEngine, job: &str, parent: Option<&TaskId>, title: &str) -> TaskNode {
    engine
        .create_task(&JobId::new(job), parent, &PositionTarget::Last, NewTask::titled(title))
        .await
        .expect("create_task failed")
}

/// Titles of the children of `parent` in position order.
pub async fn order(engine: &TaskEngine, job: &str, parent: Option<&TaskId>) -> Vec<String> {
    engine
        .children(&JobId::new(job), parent)
        .await
        .expect("children failed")
        .into_iter()
        .map(|t| t.title)
        .collect()
}

/// Current stored state of a task.
pub async fn fetch(engine: &TaskEngine, id: &TaskId) -> TaskNode {
    engine
        .get_task(id)
        .await
        .expect("get_task failed")
        .expect("task missing")
}

/// Run the trellis binary in `dir`.
pub fn run_trellis_in_dir(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_trellis"))
        .args(args)
        .current_dir(dir)
        .env("NO_COLOR", "1")
        .env("TRELLIS_ASCII", "1")
        .output()
        .expect("Failed to execute trellis binary")
}
