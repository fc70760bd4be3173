//! Integration tests for the trellis CLI.
//!
//! These tests run the binary end to end inside a temporary directory.

use rstest::{fixture, rstest};
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

mod common;
use common::run_trellis_in_dir;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Provides a fresh temporary directory for each test
#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Provides a temporary directory with an initialized trellis repository
#[fixture]
fn initialized_dir() -> TempDir {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let output = run_trellis_in_dir(temp.path(), &["init", "--prefix", "demo", "--quiet"]);
    assert!(
        output.status.success(),
        "Failed to initialize trellis: {:?}",
        String::from_utf8_lossy(&output.stderr)
    );
    temp
}

/// Create a task through the CLI and return its id.
fn create_task(dir: &Path, job: &str, title: &str, extra: &[&str]) -> String {
    let mut args = vec!["--json", "create", "--job", job, "--title", title];
    args.extend_from_slice(extra);
    let output = run_trellis_in_dir(dir, &args);
    assert!(
        output.status.success(),
        "create failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let task: Value = serde_json::from_slice(&output.stdout).expect("create prints JSON");
    task["id"].as_str().expect("id is a string").to_string()
}

fn tree_json(dir: &Path, job: &str) -> Value {
    let output = run_trellis_in_dir(dir, &["--json", "tree", job]);
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).expect("tree prints JSON")
}

fn titles(tree: &Value) -> Vec<String> {
    tree["tasks"]
        .as_array()
        .expect("tasks array")
        .iter()
        .map(|t| t["title"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ============================================================================
// Init
// ============================================================================

#[rstest]
fn test_init_creates_repository(temp_dir: TempDir) {
    let output = run_trellis_in_dir(temp_dir.path(), &["init", "--prefix", "demo"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Initialized trellis"));
    assert!(stdout.contains("demo"));
    assert!(temp_dir.path().join(".trellis/config.yaml").exists());
    assert!(temp_dir.path().join(".trellis/tasks.jsonl").exists());
}

#[rstest]
fn test_init_twice_fails(initialized_dir: TempDir) {
    let output = run_trellis_in_dir(initialized_dir.path(), &["init"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already initialized"));
}

#[rstest]
fn test_command_outside_repository_fails(temp_dir: TempDir) {
    let output = run_trellis_in_dir(temp_dir.path(), &["jobs"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Not a trellis repository"));
}

// ============================================================================
// Create and Move
// ============================================================================

#[rstest]
fn test_create_uses_configured_prefix(initialized_dir: TempDir) {
    let id = create_task(initialized_dir.path(), "release", "Write notes", &[]);

    assert!(id.starts_with("demo-"), "unexpected id {id}");
}

#[rstest]
fn test_move_then_stale_move_conflicts(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    let a = create_task(dir, "release", "A", &[]);
    let b = create_task(dir, "release", "B", &[]);
    create_task(dir, "release", "C", &[]);

    let output = run_trellis_in_dir(dir, &["move", &a, "--expect", "0", "--after", &b]);
    assert!(
        output.status.success(),
        "move failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Moved"));
    assert_eq!(titles(&tree_json(dir, "release")), vec!["B", "A", "C"]);

    let output = run_trellis_in_dir(dir, &["move", &a, "--expect", "0", "--first"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Conflict"), "stderr: {stderr}");
    assert!(stderr.contains("is at version 1"), "stderr: {stderr}");
    assert_eq!(titles(&tree_json(dir, "release")), vec!["B", "A", "C"]);
}

#[rstest]
fn test_conflict_json_carries_snapshot(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    let a = create_task(dir, "release", "A", &[]);
    let output = run_trellis_in_dir(dir, &["status", &a, "completed", "--expect", "0"]);
    assert!(output.status.success());

    let output = run_trellis_in_dir(dir, &["--json", "move", &a, "--expect", "0", "--last"]);

    assert!(!output.status.success());
    let body: Value = serde_json::from_slice(&output.stdout).expect("conflict prints JSON");
    assert_eq!(body["conflict"]["current_version"], 1);
    assert_eq!(body["conflict"]["snapshot"]["scopes"][0]["siblings"][0]["id"], a.as_str());
}

#[rstest]
fn test_reparent_and_tree_rendering(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    let parent = create_task(dir, "release", "Parent", &[]);
    let child = create_task(dir, "release", "Child", &[]);

    let output = run_trellis_in_dir(
        dir,
        &["move", &child, "--expect", "0", "--parent", &parent, "--first"],
    );
    assert!(output.status.success());

    let output = run_trellis_in_dir(dir, &["tree", "release"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("release (v3)"), "stdout: {stdout}");
    let parent_line = stdout.find("Parent").expect("parent rendered");
    let child_line = stdout.find("Child").expect("child rendered");
    assert!(parent_line < child_line);

    let output = run_trellis_in_dir(dir, &["--json", "show", &parent]);
    let shown: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(shown["subtree_count"], 1);
    assert_eq!(shown["version"], 0);
}

#[rstest]
fn test_cycle_is_rejected(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    let parent = create_task(dir, "release", "Parent", &[]);
    let child = create_task(dir, "release", "Child", &["--parent", &parent]);

    let output = run_trellis_in_dir(dir, &["move", &parent, "--expect", "0", "--parent", &child]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cycle"));
}

#[rstest]
fn test_delete_with_children_rejected(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    let parent = create_task(dir, "release", "Parent", &[]);
    let child = create_task(dir, "release", "Child", &["--parent", &parent]);

    let output = run_trellis_in_dir(dir, &["delete", &parent, "--expect", "0"]);
    assert!(!output.status.success());

    let output = run_trellis_in_dir(dir, &["delete", &child, "--expect", "0"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Deleted 1 task(s)"));
}

// ============================================================================
// Batch
// ============================================================================

#[rstest]
fn test_batch_from_file(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    let a = create_task(dir, "release", "A", &[]);
    let b = create_task(dir, "release", "B", &[]);
    let c = create_task(dir, "release", "C", &[]);

    let request = serde_json::json!({
        "job_id": "release",
        "expected_job_version": 3,
        "operations": [
            { "task_id": c, "target": "first", "expected_version": 0 },
            { "task_id": a, "target": { "after": b } },
        ],
    });
    let batch_path = dir.join("batch.json");
    std::fs::write(&batch_path, request.to_string()).unwrap();
    let batch_arg = batch_path.to_string_lossy().to_string();

    let output = run_trellis_in_dir(dir, &["batch", &batch_arg]);
    assert!(
        output.status.success(),
        "batch failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let tree = tree_json(dir, "release");
    assert_eq!(titles(&tree), vec!["C", "B", "A"]);
    assert_eq!(tree["job_version"], 4);

    // Same request again: the job has moved on.
    let output = run_trellis_in_dir(dir, &["batch", &batch_arg]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("job is at v4, not v3"));
}

// ============================================================================
// Verify and Jobs
// ============================================================================

#[rstest]
fn test_verify_and_jobs(initialized_dir: TempDir) {
    let dir = initialized_dir.path();
    create_task(dir, "alpha", "One", &[]);
    create_task(dir, "beta", "Two", &[]);

    let output = run_trellis_in_dir(dir, &["verify", "alpha"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("all invariants hold"));

    let output = run_trellis_in_dir(dir, &["--json", "jobs"]);
    let jobs: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(jobs, serde_json::json!(["alpha", "beta"]));
}
