//! Identifier generation for new tasks.
//!
//! [`HashIdGenerator`] creates collision-resistant IDs from SHA256 and base36
//! encoding, in the form `{prefix}-{hash}` (e.g. `task-a3f8`). The hash grows
//! with the number of stored tasks (4-6 characters) so short IDs stay short
//! while collisions stay rare. [`SequentialIdGenerator`] produces
//! `{prefix}-1`, `{prefix}-2`, ... for tests and reproducible demos.
//!
//! Generators only guarantee they never hand out the same ID twice. The
//! engine checks every proposal against the store and calls
//! [`IdGenerator::register_id`] before asking again when one is taken.
//!
//! # Example
//!
//! ```
//! use trellis::domain::JobId;
//! use trellis::id_generation::{HashIdGenerator, IdGenerator, IdSeed};
//!
//! let mut generator = HashIdGenerator::new("task");
//! let job = JobId::new("j1");
//! let id = generator
//!     .generate(&IdSeed {
//!         title: "Write report",
//!         job_id: &job,
//!         parent_id: None,
//!         database_size: 100,
//!     })
//!     .unwrap();
//!
//! assert!(id.as_str().starts_with("task-"));
//! ```

use crate::domain::{JobId, TaskId};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

const BASE36_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MAX_NONCE: u32 = 100;
const MAX_HASH_LENGTH: usize = 6;

/// Errors that can occur during ID generation
#[derive(Debug, Error)]
pub enum IdGenerationError {
    /// Unable to generate a unique ID after exhausting all nonces and length increases
    #[error("Unable to generate unique ID after {attempts} attempts")]
    CollisionExhausted {
        /// Nonces tried
        attempts: u32,
    },

    /// Invalid length parameter
    #[error("Length must be greater than 0")]
    InvalidLength,
}

/// What a new task's ID may be derived from.
#[derive(Debug, Clone, Copy)]
pub struct IdSeed<'a> {
    /// Title of the new task
    pub title: &'a str,
    /// Its job
    pub job_id: &'a JobId,
    /// Its parent, if any
    pub parent_id: Option<&'a TaskId>,
    /// Number of tasks already stored (drives adaptive length)
    pub database_size: usize,
}

/// A source of task IDs.
pub trait IdGenerator: Send {
    /// Propose a new ID that this generator has not handed out before.
    ///
    /// # Errors
    ///
    /// `CollisionExhausted` if no unused ID could be produced.
    fn generate(&mut self, seed: &IdSeed<'_>) -> Result<TaskId, IdGenerationError>;

    /// Mark an ID as taken so it is never proposed.
    fn register_id(&mut self, id: &TaskId);
}

/// Hash-based ID generator with collision detection
///
/// Remembers every ID it produced or was told about. For stores up to a few
/// thousand tasks the overhead is negligible (~1KB per 1000 IDs).
#[derive(Debug, Clone)]
pub struct HashIdGenerator {
    prefix: String,
    existing_ids: HashSet<String>,
}

impl HashIdGenerator {
    /// Create a generator for `{prefix}-{hash}` IDs.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            existing_ids: HashSet::new(),
        }
    }

    /// Generate a hash-based ID with the given parameters
    fn hash_id(&self, seed: &IdSeed<'_>, nonce: u32, length: usize) -> Result<String, IdGenerationError> {
        let timestamp = Utc::now().timestamp_micros();
        let content = format!(
            "{}|{}|{}|{}|{}",
            seed.title,
            seed.job_id,
            seed.parent_id.map_or("", TaskId::as_str),
            timestamp,
            nonce
        );

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let hash_bytes = hasher.finalize();

        let hash_str = encode_base36(&hash_bytes[..8], length)?;
        Ok(format!("{}-{}", self.prefix, hash_str))
    }
}

/// Determine ID length based on store size
///
/// - 0-500 tasks: 4 chars
/// - 500-1,500: 5 chars
/// - 1,500+: 6 chars
fn adaptive_length(database_size: usize) -> usize {
    match database_size {
        0..=500 => 4,
        501..=1500 => 5,
        _ => 6,
    }
}

impl IdGenerator for HashIdGenerator {
    fn generate(&mut self, seed: &IdSeed<'_>) -> Result<TaskId, IdGenerationError> {
        let id_length = adaptive_length(seed.database_size);

        for nonce in 0..MAX_NONCE {
            let id = self.hash_id(seed, nonce, id_length)?;
            if !self.existing_ids.contains(&id) {
                if nonce > 0 {
                    debug!(nonce, id_length, "Generated unique ID after collision retries");
                }
                self.existing_ids.insert(id.clone());
                return Ok(TaskId::new(id));
            }
        }

        if id_length < MAX_HASH_LENGTH {
            warn!(
                id_length,
                max_nonce = MAX_NONCE,
                "All nonces exhausted, increasing ID length"
            );
            let longer_id = self.hash_id(seed, 0, id_length + 1)?;
            if self.existing_ids.insert(longer_id.clone()) {
                return Ok(TaskId::new(longer_id));
            }
        }

        Err(IdGenerationError::CollisionExhausted {
            attempts: MAX_NONCE,
        })
    }

    fn register_id(&mut self, id: &TaskId) {
        self.existing_ids.insert(id.as_str().to_string());
    }
}

/// Deterministic `{prefix}-{n}` IDs.
#[derive(Debug, Clone)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: u64,
    existing_ids: HashSet<String>,
}

impl SequentialIdGenerator {
    /// Start counting at 1.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
            existing_ids: HashSet::new(),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&mut self, _seed: &IdSeed<'_>) -> Result<TaskId, IdGenerationError> {
        loop {
            let id = format!("{}-{}", self.prefix, self.next);
            self.next += 1;
            if self.existing_ids.insert(id.clone()) {
                return Ok(TaskId::new(id));
            }
        }
    }

    fn register_id(&mut self, id: &TaskId) {
        self.existing_ids.insert(id.as_str().to_string());
    }
}

/// Encode bytes as base36 string
///
/// Folds at most 8 bytes into a `u64` with wrapping arithmetic, then emits
/// exactly `length` base36 digits.
///
/// # Errors
///
/// Returns an error if length is 0.
fn encode_base36(bytes: &[u8], length: usize) -> Result<String, IdGenerationError> {
    if length == 0 {
        return Err(IdGenerationError::InvalidLength);
    }

    let mut n: u64 = 0;
    for &byte in bytes {
        n = n.wrapping_shl(8).wrapping_add(u64::from(byte));
    }

    let mut result = Vec::with_capacity(length);
    while result.len() < length {
        let remainder = usize::try_from(n % 36).unwrap_or_default();
        result.push(char::from(BASE36_CHARS[remainder]));
        n /= 36;
    }

    Ok(result.into_iter().rev().collect())
}
