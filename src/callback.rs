// SPDX-License-Identifier: MIT
//! Completion-callback handling, shared by the REST surface and tests.
//!
//! The execution agent reports `"AI Done"` or `"AI Failed"`. Done completes
//! the task, credits the breaker, rolls progress up the goal hierarchy, and
//! chains straight into the next tick. Failed strikes the breaker and runs
//! retry analysis. Any other status leaves the task in_progress; the timeout
//! patrol is the backstop.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, StewardError};
use crate::model::{RunResult, TaskStatus};
use crate::tick::TickOutcome;
use crate::SharedState;

/// What the agent POSTs to the callback endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RunReport {
    pub task_id: Uuid,
    pub run_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub result_summary: String,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CompletionOutcome {
    pub task_id: Uuid,
    pub new_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_tick: Option<TickOutcome>,
}

pub async fn handle_run_completion(
    state: &SharedState,
    report: RunReport,
) -> Result<CompletionOutcome> {
    let task = state
        .store
        .task(report.task_id)
        .await?
        .ok_or(StewardError::TaskNotFound(report.task_id))?;

    info!(task = %task.id, status = %report.status, "execution callback received");

    if let Some(run_id) = &report.run_id {
        state.executor.deregister(run_id).await;
    }

    let mut patch = Map::new();
    patch.insert("run_status".into(), json!(report.status));
    patch.insert(
        "last_run_result".into(),
        json!({
            "run_id": report.run_id,
            "status": report.status,
            "result_summary": report.result_summary,
            "duration_ms": report.duration_ms,
            "completed_at": Utc::now().to_rfc3339(),
        }),
    );
    state.store.merge_payload(task.id, patch).await?;

    let breaker_key = &state.config.dispatch.breaker_key;
    let mut retry_task_id = None;
    let mut next_tick = None;

    let new_status = match report.status.as_str() {
        "AI Done" => {
            state
                .store
                .update_status(task.id, TaskStatus::Completed)
                .await?;
            state.breakers.record_success(breaker_key).await;
            state
                .events
                .emit(
                    "task_completed",
                    "executor",
                    json!({
                        "task_id": task.id,
                        "run_id": report.run_id,
                        "duration_ms": report.duration_ms,
                    }),
                )
                .await;
            state
                .notifier
                .notify(
                    "task_completed",
                    &format!("task \"{}\" completed", task.title),
                )
                .await;
            rollup_goal_progress(state, task.goal_id).await;

            // Event-driven: chain straight into the next tick instead of
            // waiting out the interval.
            next_tick = Some(state.tick.run_tick_safe("execution-callback").await);
            "completed"
        }
        "AI Failed" => {
            state
                .store
                .update_status(task.id, TaskStatus::Failed)
                .await?;
            state.breakers.record_failure(breaker_key).await;
            state
                .events
                .emit(
                    "task_failed",
                    "executor",
                    json!({
                        "task_id": task.id,
                        "run_id": report.run_id,
                        "status": report.status,
                    }),
                )
                .await;
            state
                .notifier
                .notify("task_failed", &format!("task \"{}\" failed", task.title))
                .await;
            rollup_goal_progress(state, task.goal_id).await;

            let run = RunResult {
                status: report.status.clone(),
                result_summary: report.result_summary.clone(),
                elapsed_minutes: report.duration_ms.map_or(0, |ms| ms as i64 / 60_000),
            };
            let (_, retry) = state.retry.handle_failed_task(&task, &run).await?;
            retry_task_id = retry.map(|t| t.id);
            "failed"
        }
        other => {
            warn!(task = %task.id, status = other, "unknown callback status, keeping in_progress");
            "in_progress"
        }
    };

    Ok(CompletionOutcome {
        task_id: task.id,
        new_status: new_status.to_string(),
        retry_task_id,
        next_tick,
    })
}

/// Roll task completion up the goal hierarchy: the task's goal gets its
/// completed-task ratio, the parent objective the mean of its children.
/// Best effort, never fails the callback.
async fn rollup_goal_progress(state: &SharedState, goal_id: Option<Uuid>) {
    let Some(goal_id) = goal_id else { return };
    let result: Result<()> = async {
        let stats = state.store.goal_task_stats(goal_id).await?;
        if stats.total > 0 {
            let progress = (stats.completed as f64 / stats.total as f64 * 100.0).round() as i64;
            state.store.set_goal_progress(goal_id, progress).await?;
        }
        if let Some(goal) = state.store.goal(goal_id).await? {
            if let Some(parent_id) = goal.parent_id {
                let children = state.store.child_goals(parent_id).await?;
                if !children.is_empty() {
                    let mean =
                        children.iter().map(|g| g.progress).sum::<i64>() / children.len() as i64;
                    state.store.set_goal_progress(parent_id, mean).await?;
                }
            }
        }
        Ok(())
    }
    .await;
    if let Err(e) = result {
        warn!(goal = %goal_id, err = %e, "goal progress rollup failed");
    }
}
