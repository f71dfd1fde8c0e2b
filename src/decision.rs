// SPDX-License-Identifier: MIT
//! Decision engine — compares goal progress against the calendar and proposes
//! corrective actions.
//!
//! Expected progress is linear over the goal's window (explicit deadline, or a
//! default 30-day horizon). Actual progress is the completed-task ratio, or
//! the goal's stored percentage when it has no tasks. The deviation classifies
//! the goal and drives action generation; low-confidence or escalating
//! decisions wait for operator approval instead of auto-executing.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, StewardError};
use crate::events::EventLog;
use crate::model::{
    Decision, DecisionAction, DecisionStatus, Goal, Priority, TaskStatus,
};
use crate::store::{GoalTaskStats, TaskStore};

const DEFAULT_HORIZON_DAYS: i64 = 30;
const RECENT_FAILED_LIMIT: usize = 5;
const REPRIORITIZE_LIMIT: usize = 3;

// Confidence ceilings applied per action class.
const ESCALATION_CONFIDENCE: f64 = 0.85;
const RETRY_CONFIDENCE: f64 = 0.7;

// ─── Progress report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalHealth {
    Behind,
    AtRisk,
    OnTrack,
    Ahead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalProgress {
    pub goal_id: Uuid,
    pub title: String,
    pub expected_progress: i64,
    pub actual_progress: i64,
    pub deviation: i64,
    pub status: GoalHealth,
    /// Tasks in_progress longer than the stale threshold. Independent of the
    /// dispatch-timeout patrol, which works on a much shorter clock.
    pub blocked_tasks: Vec<Uuid>,
    pub recommendations: Vec<String>,
    pub task_stats: GoalTaskStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub goals: Vec<GoalProgress>,
    pub overall_health: OverallHealth,
    pub timestamp: DateTime<Utc>,
}

/// Linear expected progress over the goal window, clamped to 0..=100.
pub fn expected_progress(
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> i64 {
    let pct = match deadline {
        Some(end) => {
            let total = (end - created_at).num_seconds();
            if total <= 0 {
                return 100;
            }
            (now - created_at).num_seconds() as f64 / total as f64 * 100.0
        }
        None => {
            let elapsed_days = (now - created_at).num_seconds() as f64 / 86_400.0;
            elapsed_days / DEFAULT_HORIZON_DAYS as f64 * 100.0
        }
    };
    (pct.round() as i64).clamp(0, 100)
}

fn classify(deviation: i64) -> GoalHealth {
    if deviation < -20 {
        GoalHealth::Behind
    } else if deviation < -10 {
        GoalHealth::AtRisk
    } else if deviation > 10 {
        GoalHealth::Ahead
    } else {
        GoalHealth::OnTrack
    }
}

// ─── Decision outcome ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    /// True when confidence is below the auto-execute threshold or any action
    /// escalates. The tick never auto-executes these.
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action: DecisionAction,
    pub success: bool,
    pub detail: String,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct DecisionEngine {
    store: Arc<dyn TaskStore>,
    events: Arc<EventLog>,
    stale_threshold: Duration,
    auto_execute_confidence: f64,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: Arc<EventLog>,
        stale_threshold_hours: i64,
        auto_execute_confidence: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            stale_threshold: Duration::hours(stale_threshold_hours),
            auto_execute_confidence,
        })
    }

    async fn blocked_tasks(&self, goal: &Goal, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let in_progress = self
            .store
            .tasks_for_goal(goal.id, TaskStatus::InProgress)
            .await?;
        Ok(in_progress
            .iter()
            .filter(|t| {
                t.started_at
                    .map_or(false, |s| now - s > self.stale_threshold)
            })
            .map(|t| t.id)
            .collect())
    }

    /// Compare every active goal (or one specific goal) against where the
    /// calendar says it should be.
    pub async fn compare_goal_progress(&self, goal_id: Option<Uuid>) -> Result<ProgressReport> {
        let now = Utc::now();
        let mut report_goals = Vec::new();
        let mut overall = OverallHealth::Healthy;

        for goal in self.store.active_goals(goal_id).await? {
            let stats = self.store.goal_task_stats(goal.id).await?;
            let blocked = self.blocked_tasks(&goal, now).await?;

            let actual = if stats.total > 0 {
                (stats.completed as f64 / stats.total as f64 * 100.0).round() as i64
            } else {
                goal.progress
            };
            let expected = expected_progress(goal.created_at, goal.deadline, now);
            let deviation = actual - expected;
            let status = classify(deviation);

            match status {
                GoalHealth::Behind => overall = OverallHealth::Critical,
                GoalHealth::AtRisk if overall == OverallHealth::Healthy => {
                    overall = OverallHealth::Warning
                }
                _ => {}
            }

            let mut recommendations = Vec::new();
            match status {
                GoalHealth::Behind => {
                    recommendations
                        .push(format!("Goal \"{}\" is significantly behind schedule", goal.title));
                    recommendations.push("Consider reprioritizing tasks or adding resources".into());
                }
                GoalHealth::AtRisk => {
                    recommendations.push(format!("Goal \"{}\" is falling behind", goal.title));
                }
                _ => {}
            }
            if !blocked.is_empty() {
                recommendations.push(format!("{} task(s) appear to be blocked", blocked.len()));
                recommendations.push("Review blocked tasks for dependencies or issues".into());
            }

            report_goals.push(GoalProgress {
                goal_id: goal.id,
                title: goal.title.clone(),
                expected_progress: expected,
                actual_progress: actual,
                deviation,
                status,
                blocked_tasks: blocked,
                recommendations,
                task_stats: stats,
            });
        }

        Ok(ProgressReport {
            goals: report_goals,
            overall_health: overall,
            timestamp: now,
        })
    }

    /// Generate a pending decision from the current progress report.
    ///
    /// Confidence starts at 0.9 and is capped down by escalation (0.85) and
    /// retry (0.7) actions, per the weakest action in the set.
    pub async fn generate_decision(&self, trigger: &str) -> Result<DecisionOutcome> {
        let comparison = self.compare_goal_progress(None).await?;

        let mut actions: Vec<DecisionAction> = Vec::new();
        let mut confidence: f64 = 0.9;

        for goal in &comparison.goals {
            for task_id in &goal.blocked_tasks {
                actions.push(DecisionAction::Escalate {
                    target_id: *task_id,
                    reason: format!(
                        "Task blocked for more than {} hours",
                        self.stale_threshold.num_hours()
                    ),
                });
                confidence = confidence.min(ESCALATION_CONFIDENCE);
            }

            if matches!(goal.status, GoalHealth::Behind | GoalHealth::AtRisk) {
                let queued = self
                    .store
                    .tasks_for_goal(goal.goal_id, TaskStatus::Queued)
                    .await?;
                for task in queued.iter().take(REPRIORITIZE_LIMIT) {
                    if task.priority == Priority::P0 {
                        continue;
                    }
                    let (new_priority, severity) = match goal.status {
                        GoalHealth::Behind => (Priority::P0, "significantly behind"),
                        _ => (Priority::P1, "at risk"),
                    };
                    actions.push(DecisionAction::Reprioritize {
                        target_id: task.id,
                        new_priority,
                        reason: format!("Goal \"{}\" is {severity}", goal.title),
                    });
                }
            }
        }

        for task in self.store.recent_failed(RECENT_FAILED_LIMIT).await? {
            actions.push(DecisionAction::Retry {
                target_id: task.id,
                reason: "Task failed, retry recommended".into(),
            });
            confidence = confidence.min(RETRY_CONFIDENCE);
        }

        let requires_approval = confidence < self.auto_execute_confidence
            || actions.iter().any(DecisionAction::is_escalation);

        let decision = Decision {
            id: Uuid::new_v4(),
            trigger: trigger.to_string(),
            actions,
            confidence,
            status: DecisionStatus::Pending,
            context: json!({
                "trigger": trigger,
                "overall_health": comparison.overall_health,
                "goals_analyzed": comparison.goals.len(),
            }),
            created_at: Utc::now(),
            executed_at: None,
        };
        let decision = self.store.insert_decision(decision).await?;

        info!(
            decision = %decision.id,
            actions = decision.actions.len(),
            confidence = decision.confidence,
            requires_approval,
            "generated decision"
        );

        Ok(DecisionOutcome {
            decision,
            requires_approval,
        })
    }

    /// Apply a pending decision's actions against the task store.
    ///
    /// Idempotency guard: executing an executed or rolled-back decision is an
    /// error. Individual action failures are collected, not propagated, so one
    /// vanished task does not abort the rest of the decision.
    pub async fn execute_decision(&self, decision_id: Uuid) -> Result<Vec<ActionResult>> {
        let decision = self
            .store
            .decision(decision_id)
            .await?
            .ok_or(StewardError::DecisionNotFound(decision_id))?;

        match decision.status {
            DecisionStatus::Executed => return Err(StewardError::DecisionAlreadyExecuted),
            DecisionStatus::RolledBack => return Err(StewardError::DecisionRolledBack),
            DecisionStatus::Pending => {}
        }

        let mut results = Vec::new();
        for action in &decision.actions {
            let outcome = self.apply_action(action).await;
            results.push(match outcome {
                Ok(detail) => ActionResult {
                    action: action.clone(),
                    success: true,
                    detail,
                },
                Err(e) => ActionResult {
                    action: action.clone(),
                    success: false,
                    detail: e.to_string(),
                },
            });
        }

        self.store
            .update_decision_status(decision_id, DecisionStatus::Executed)
            .await?;
        self.events
            .emit(
                "decision_executed",
                "decision_engine",
                json!({
                    "decision_id": decision_id,
                    "actions": results.len(),
                    "failed": results.iter().filter(|r| !r.success).count(),
                }),
            )
            .await;

        Ok(results)
    }

    async fn apply_action(&self, action: &DecisionAction) -> Result<String> {
        match action {
            DecisionAction::Reprioritize {
                target_id,
                new_priority,
                ..
            } => {
                self.store.update_priority(*target_id, *new_priority).await?;
                Ok(format!("reprioritized to {new_priority}"))
            }
            DecisionAction::Escalate { target_id, .. } => {
                let mut patch = Map::new();
                patch.insert("needs_attention".into(), Value::Bool(true));
                self.store.merge_payload(*target_id, patch).await?;
                Ok("escalated".into())
            }
            DecisionAction::Retry { target_id, .. } => {
                self.store
                    .update_status(*target_id, TaskStatus::Queued)
                    .await?;
                Ok("reset_to_queued".into())
            }
            DecisionAction::Skip { target_id, .. } => {
                self.store
                    .update_status(*target_id, TaskStatus::Cancelled)
                    .await?;
                Ok("cancelled".into())
            }
        }
    }

    /// Flip an executed decision to rolled_back. Prior field values are not
    /// restored; the status flip is the whole rollback.
    pub async fn rollback_decision(&self, decision_id: Uuid) -> Result<()> {
        let decision = self
            .store
            .decision(decision_id)
            .await?
            .ok_or(StewardError::DecisionNotFound(decision_id))?;

        if decision.status != DecisionStatus::Executed {
            return Err(StewardError::DecisionNotExecuted(
                decision.status.to_string(),
            ));
        }

        self.store
            .update_decision_status(decision_id, DecisionStatus::RolledBack)
            .await?;
        self.events
            .emit(
                "decision_rolled_back",
                "decision_engine",
                json!({ "decision_id": decision_id }),
            )
            .await;
        Ok(())
    }

    pub async fn decision_history(&self, limit: usize) -> Result<Vec<Decision>> {
        self.store.decisions(limit).await
    }
}
