//! Error taxonomy for the council engine.
//!
//! Public operations return `Result<T, CouncilError>`. Internal plumbing that
//! never crosses a public API boundary may use `anyhow::Result`, matching the
//! split the teacher daemon draws between its public `OrchestratorError` and
//! internal `anyhow`-typed helpers.

use thiserror::Error;

use crate::model::Phase;

/// A single field-level problem found while validating a Council config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub path: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors surfaced by the council engine's public API.
#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("config load failed: {0:?}")]
    ConfigLoad(Vec<ConfigIssue>),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("agent {agent} already voted on session {session}")]
    AlreadyVoted { session: uuid::Uuid, agent: String },

    #[error("invalid vote value {value:?} for scheme {scheme}")]
    InvalidVoteValue { value: String, scheme: String },

    #[error("session not in expected phase: expected {expected:?}, actual {actual:?}")]
    NotInPhase { expected: Phase, actual: Phase },

    #[error("agent {agent} is not authorized for session {session}")]
    NotAuthorized { agent: String, session: uuid::Uuid },

    #[error("store error: {0}")]
    StoreError(String),

    /// Never returned from `castVote`/`postMessage` per spec — logged and
    /// swallowed internally. Kept in the taxonomy for completeness.
    #[error("spawn error: {0}")]
    SpawnError(String),
}

pub type Result<T> = std::result::Result<T, CouncilError>;
