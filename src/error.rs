// SPDX-License-Identifier: MIT
//! Typed errors for the orchestration core.
//!
//! Handlers and the binary wrap these in `anyhow`; library code propagates
//! them with `?`. Event-log and notification failures are deliberately *not*
//! represented here — observability must never block the control path.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StewardError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("goal not found: {0}")]
    GoalNotFound(Uuid),

    #[error("decision not found: {0}")]
    DecisionNotFound(Uuid),

    #[error("decision already executed")]
    DecisionAlreadyExecuted,

    #[error("decision was rolled back")]
    DecisionRolledBack,

    #[error("can only roll back executed decisions (current status: {0})")]
    DecisionNotExecuted(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StewardError>;
