// SPDX-License-Identifier: MIT
//! Core data model: tasks, goals, decisions, events, run results.
//!
//! Tasks are owned by the [`TaskStore`](crate::store::TaskStore); the
//! orchestrator mutates them through that port only. The `payload` map is
//! free-form JSON carried between runs (retry bookkeeping, run metadata,
//! PRD content for the execution agent).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ─── Priority & status ───────────────────────────────────────────────────────

/// Task priority. Ordering is dispatch order: P0 sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::P0 => write!(f, "P0"),
            Priority::P1 => write!(f, "P1"),
            Priority::P2 => write!(f, "P2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are never dispatched or patrolled again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ─── Task ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Ids of tasks that must be `completed` before this one is dispatchable.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub goal_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    /// Free-form carried state: `retry_count`, `run_triggered_at`,
    /// `current_run_id`, `prd_content`, `prd_path`, `last_run_result`, …
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a fresh queued task with an empty payload.
    pub fn new(title: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            priority,
            status: TaskStatus::Queued,
            depends_on: Vec::new(),
            goal_id: None,
            project_id: None,
            payload: Map::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Number of retries already burned on this task lineage.
    pub fn retry_count(&self) -> u32 {
        self.payload
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// When the current run was triggered, if a run was ever triggered.
    pub fn run_triggered_at(&self) -> Option<DateTime<Utc>> {
        self.payload
            .get("run_triggered_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn current_run_id(&self) -> Option<&str> {
        self.payload.get("current_run_id").and_then(Value::as_str)
    }
}

// ─── Goal ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
    Paused,
}

/// An objective or key result tracked by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub title: String,
    pub status: GoalStatus,
    /// Stored progress in percent, used when the goal has no tasks.
    pub progress: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Parent objective when this goal is a key result.
    pub parent_id: Option<Uuid>,
}

impl Goal {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            status: GoalStatus::Active,
            progress: 0,
            deadline: None,
            created_at: Utc::now(),
            parent_id: None,
        }
    }
}

// ─── Decisions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Executed,
    RolledBack,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionStatus::Pending => write!(f, "pending"),
            DecisionStatus::Executed => write!(f, "executed"),
            DecisionStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A single corrective action proposed by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionAction {
    Reprioritize {
        target_id: Uuid,
        new_priority: Priority,
        reason: String,
    },
    Escalate {
        target_id: Uuid,
        reason: String,
    },
    Retry {
        target_id: Uuid,
        reason: String,
    },
    Skip {
        target_id: Uuid,
        reason: String,
    },
}

impl DecisionAction {
    pub fn is_escalation(&self) -> bool {
        matches!(self, DecisionAction::Escalate { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub trigger: String,
    pub actions: Vec<DecisionAction>,
    /// 0.0–1.0; below the auto-execute threshold the decision waits for an operator.
    pub confidence: f64,
    pub status: DecisionStatus,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Append-only audit record. Never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub source: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

// ─── Run results ─────────────────────────────────────────────────────────────

/// What the execution agent reports back through the completion callback,
/// and what the retry analyzer classifies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result_summary: String,
    #[serde(default)]
    pub elapsed_minutes: i64,
}

// ─── Tick action records ─────────────────────────────────────────────────────

/// One action taken during a tick, reported in the tick summary and counted
/// against the daily action counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTaken {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_minutes: Option<i64>,
}

impl ActionTaken {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            task_id: None,
            title: None,
            reason: None,
            run_id: None,
            elapsed_minutes: None,
        }
    }

    pub fn for_task(action: impl Into<String>, task: &Task) -> Self {
        let mut a = Self::new(action);
        a.task_id = Some(task.id);
        a.title = Some(task.title.clone());
        a
    }
}
