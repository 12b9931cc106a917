//! Engine error taxonomy
//!
//! Contract violations get their own variants so callers can match on them;
//! plumbing failures (I/O, subprocess, YAML) stay in `anyhow` at the edges.

use std::path::PathBuf;
use thiserror::Error;

/// Candidate index, dense in `[0, N)`.
pub type Index = usize;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A state-machine transition was attempted from the wrong state.
    /// This indicates a bug in the engine, not bad external data.
    #[error("illegal {op} on candidate {index}: state is (done={done}, available={available}, failed={failed})")]
    IllegalTransition {
        op: &'static str,
        index: Index,
        done: bool,
        available: bool,
        failed: bool,
    },

    /// `next()` was called with the pending queue fully consumed.
    #[error("pending queue exhausted")]
    Exhausted,

    /// The data manager had no parameters for a candidate the scheduler
    /// believed was dispatchable.
    #[error("no parameters for candidate {0}")]
    MissingParameters(Index),

    /// The initial ranker declined to produce a ranking; without one the
    /// scheduler has no queue to consume.
    #[error("initial ranker returned no ranking")]
    NoInitialRanking,

    /// A handle was reported that the executor does not know about, or was
    /// reported twice.
    #[error("unknown or already-reported handle {0}")]
    UnknownHandle(u64),

    /// The worker pool shut down while the coordinator still needed it.
    #[error("worker pool disconnected")]
    PoolDisconnected,

    /// `build()` was called with required slots unset.
    #[error("missing configuration fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    /// Wiring-time schema mismatch between two configured components.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The pool was configured with zero workers.
    #[error("worker pool requires at least one worker")]
    EmptyPool,

    /// A listed candidate file does not exist.
    #[error("candidate file missing: {}", .0.display())]
    MissingCandidateFile(PathBuf),

    /// The candidate list contained a blank line.
    #[error("blank line {0} in candidate list")]
    BlankCandidateLine(usize),
}
