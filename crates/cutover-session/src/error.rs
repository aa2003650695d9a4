//! Session error taxonomy.
//!
//! Validation-class errors are rejected synchronously before any side
//! effect. Everything below the cutover boundary is absorbed into a
//! `Failed` terminal state; at or past it, errors either complete a
//! rollback or escalate to manual intervention.

use thiserror::Error;

use cutover_backup::BackupError;
use cutover_state::StateError;

use crate::fleet::FleetError;

/// Errors from session creation and execution.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("agent busy: {0} already has an active upgrade session")]
    Busy(String),

    #[error("unknown version: {0}")]
    UnknownVersion(String),

    #[error("agent {agent_id} is already at version {version}")]
    SameVersion { agent_id: String, version: String },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("cutover error: {0}")]
    Cutover(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("fleet error: {0}")]
    Fleet(#[from] FleetError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
