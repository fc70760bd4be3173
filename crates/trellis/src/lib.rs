//! Trellis - hierarchical task ordering with optimistic concurrency control.
//!
//! Tasks live in per-job trees. Siblings are ordered by sparse integer keys
//! so a move usually rewrites a single row, and every mutation carries the
//! version the caller last saw so concurrent editors never silently
//! overwrite each other.
//!
//! The entry point is [`engine::TaskEngine`]. The crate also ships the
//! `trellis` CLI, which persists tasks to `.trellis/tasks.jsonl`.

#![forbid(unsafe_code)]

// Core engine
pub mod batch;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod id_generation;
pub mod integrity;
pub mod position;
pub mod storage;
pub mod tree;

// CLI support
pub mod app;
pub mod cli;
pub mod commands;
pub mod output;
