// SPDX-License-Identifier: MIT
//! Dispatcher — picks the next dispatchable task and launches it, behind a
//! fixed chain of guards.
//!
//! Guard order is part of the contract: concurrency, breaker, cooldown,
//! task selection, executor availability. Every skip names its reason so the
//! tick summary and event log show why nothing moved.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map};
use std::sync::Arc;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreakers;
use crate::config::DispatchConfig;
use crate::error::Result;
use crate::events::EventLog;
use crate::executor::{AgentExecutor, LaunchOutcome};
use crate::model::{Task, TaskStatus};
use crate::store::{FocusScope, TaskStore};

const KV_LAST_DISPATCH: &str = "last_dispatch";

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MaxConcurrentReached,
    CircuitBreakerOpen,
    CooldownActive,
    NoDispatchableTask,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MaxConcurrentReached => write!(f, "max_concurrent_reached"),
            SkipReason::CircuitBreakerOpen => write!(f, "circuit_breaker_open"),
            SkipReason::CooldownActive => write!(f, "cooldown_active"),
            SkipReason::NoDispatchableTask => write!(f, "no_dispatchable_task"),
        }
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The task was selected and moved to in_progress. `run_id` is `None`
    /// when no agent binary is available; the task waits in_progress for the
    /// patrol rather than being returned to the queue.
    Dispatched {
        task: Task,
        run_id: Option<String>,
    },
    Skipped(SkipReason),
    /// The agent could not be spawned. The task stays in_progress and the
    /// timeout patrol reclaims it later; failing it here would race a slow
    /// agent start.
    SpawnFailed { task: Task, reason: String },
}

/// An in_progress task auto-failed by the timeout patrol.
#[derive(Debug)]
pub struct TimedOutRun {
    pub task: Task,
    pub elapsed_minutes: i64,
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    events: Arc<EventLog>,
    breakers: Arc<CircuitBreakers>,
    executor: Arc<AgentExecutor>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: Arc<EventLog>,
        breakers: Arc<CircuitBreakers>,
        executor: Arc<AgentExecutor>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            breakers,
            executor,
            config,
        })
    }

    pub async fn last_dispatch_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .kv_get(KV_LAST_DISPATCH)
            .await?
            .and_then(|v| v.as_str().map(str::to_owned))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn deps_met(&self, task: &Task) -> Result<bool> {
        for dep in &task.depends_on {
            let done = self
                .store
                .task(*dep)
                .await?
                .map_or(false, |d| d.status == TaskStatus::Completed);
            if !done {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// First queued task in scope, priority then age order, whose dependencies
    /// are all completed.
    pub async fn select_next_dispatchable(&self, scope: &FocusScope) -> Result<Option<Task>> {
        let queued = self
            .store
            .tasks_in_scope(&scope.goal_ids, &[TaskStatus::Queued])
            .await?;
        for task in queued {
            if self.deps_met(&task).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Run the guard chain and, when everything clears, launch the agent for
    /// the selected task.
    pub async fn dispatch_next(&self, scope: &FocusScope) -> Result<DispatchOutcome> {
        let in_progress = self
            .store
            .tasks_in_scope(&scope.goal_ids, &[TaskStatus::InProgress])
            .await?;
        if in_progress.len() >= self.config.max_concurrent {
            return Ok(DispatchOutcome::Skipped(SkipReason::MaxConcurrentReached));
        }

        if !self.breakers.is_allowed(&self.config.breaker_key).await {
            return Ok(DispatchOutcome::Skipped(SkipReason::CircuitBreakerOpen));
        }

        if let Some(last) = self.last_dispatch_at().await? {
            let cooldown = Duration::milliseconds(self.config.cooldown_ms as i64);
            if Utc::now() - last < cooldown {
                return Ok(DispatchOutcome::Skipped(SkipReason::CooldownActive));
            }
        }

        let task = match self.select_next_dispatchable(scope).await? {
            Some(t) => t,
            None => return Ok(DispatchOutcome::Skipped(SkipReason::NoDispatchableTask)),
        };

        if !self.executor.available() {
            // Dispatched without an agent: the task parks in_progress and the
            // timeout patrol reclaims it if no agent ever picks it up.
            let task = self
                .store
                .update_status(task.id, TaskStatus::InProgress)
                .await?;
            self.store
                .kv_set(KV_LAST_DISPATCH, json!(Utc::now().to_rfc3339()))
                .await?;
            warn!(task = %task.id, "no execution agent available, task parked in_progress");
            self.events
                .emit(
                    "task_dispatched",
                    "dispatcher",
                    json!({
                        "task_id": task.id,
                        "title": task.title,
                        "priority": task.priority.to_string(),
                        "reason": "no_executor",
                    }),
                )
                .await;
            return Ok(DispatchOutcome::Dispatched { task, run_id: None });
        }

        match self.executor.launch(&task).await? {
            LaunchOutcome::Launched(handle) => {
                self.store
                    .kv_set(KV_LAST_DISPATCH, json!(Utc::now().to_rfc3339()))
                    .await?;
                info!(task = %task.id, run_id = %handle.run_id, "dispatched task");
                self.events
                    .emit(
                        "task_dispatched",
                        "dispatcher",
                        json!({
                            "task_id": task.id,
                            "title": task.title,
                            "priority": task.priority.to_string(),
                            "run_id": handle.run_id,
                        }),
                    )
                    .await;
                Ok(DispatchOutcome::Dispatched {
                    task,
                    run_id: Some(handle.run_id),
                })
            }
            LaunchOutcome::AlreadyRunning { run_id } => {
                // Dedup hit: treat as the dispatch it already is.
                Ok(DispatchOutcome::Dispatched {
                    task,
                    run_id: Some(run_id),
                })
            }
            LaunchOutcome::Failed { reason } => {
                warn!(task = %task.id, %reason, "dispatch spawn failed");
                self.events
                    .emit(
                        "dispatch_failed",
                        "dispatcher",
                        json!({ "task_id": task.id, "reason": reason }),
                    )
                    .await;
                Ok(DispatchOutcome::SpawnFailed { task, reason })
            }
        }
    }

    /// Timeout patrol: auto-fail in_progress tasks whose run started longer
    /// ago than `timeout_minutes`. The reference time is `run_triggered_at`,
    /// falling back to `started_at` for tasks that predate run stamping.
    ///
    /// Each timeout terminates the run (if still registered), counts as a
    /// breaker failure, and is returned for retry analysis.
    pub async fn auto_fail_timed_out(&self, scope: &FocusScope) -> Result<Vec<TimedOutRun>> {
        let now = Utc::now();
        let limit = Duration::minutes(self.config.timeout_minutes);
        let in_progress = self
            .store
            .tasks_in_scope(&scope.goal_ids, &[TaskStatus::InProgress])
            .await?;

        let mut timed_out = Vec::new();
        for task in in_progress {
            let reference = match task.run_triggered_at().or(task.started_at) {
                Some(t) => t,
                None => continue,
            };
            let elapsed = now - reference;
            if elapsed < limit {
                continue;
            }
            let elapsed_minutes = elapsed.num_minutes();

            if let Some(run_id) = task.current_run_id() {
                self.executor.terminate_run(run_id).await;
            }

            let mut patch = Map::new();
            patch.insert("run_status".into(), json!("timeout"));
            patch.insert(
                "last_run_result".into(),
                json!({
                    "status": "timeout",
                    "result_summary": format!("auto-failed after {elapsed_minutes}min without callback"),
                    "elapsed_minutes": elapsed_minutes,
                }),
            );
            self.store.merge_payload(task.id, patch).await?;
            let failed = self.store.update_status(task.id, TaskStatus::Failed).await?;
            self.breakers.record_failure(&self.config.breaker_key).await;

            warn!(task = %failed.id, elapsed_minutes, "auto-failed timed out task");
            self.events
                .emit(
                    "patrol_cleanup",
                    "dispatcher",
                    json!({
                        "task_id": failed.id,
                        "title": failed.title,
                        "elapsed_minutes": elapsed_minutes,
                    }),
                )
                .await;

            timed_out.push(TimedOutRun {
                task: failed,
                elapsed_minutes,
            });
        }
        Ok(timed_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, BreakerConfig};
    use crate::model::{Goal, Priority};
    use crate::notify::NullNotifier;
    use crate::store::MemoryTaskStore;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryTaskStore>,
        events: Arc<EventLog>,
        breakers: Arc<CircuitBreakers>,
        dispatcher: Arc<Dispatcher>,
        scope: FocusScope,
    }

    async fn fixture() -> Fixture {
        fixture_with(DispatchConfig::default(), AgentConfig::default()).await
    }

    async fn fixture_with(config: DispatchConfig, agent: AgentConfig) -> Fixture {
        let store = MemoryTaskStore::new();
        let events = EventLog::new();
        let breakers = CircuitBreakers::new(
            BreakerConfig::default(),
            events.clone(),
            Arc::new(NullNotifier),
        );
        let executor = AgentExecutor::new(agent, store.clone(), events.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            events.clone(),
            breakers.clone(),
            executor,
            config,
        );

        let goal = store.insert_goal(Goal::new("objective")).await;
        store.focus_on_goal(&goal).await;
        let scope = store.current_focus().await.unwrap().unwrap();

        Fixture {
            store,
            events,
            breakers,
            dispatcher,
            scope,
        }
    }

    async fn queue(f: &Fixture, title: &str, priority: Priority) -> Task {
        let mut t = Task::new(title, priority);
        t.goal_id = Some(f.scope.objective_id);
        f.store.insert_task(t).await.unwrap()
    }

    fn assert_skip(outcome: DispatchOutcome, reason: SkipReason) {
        match outcome {
            DispatchOutcome::Skipped(r) => assert_eq!(r, reason),
            other => panic!("expected skip {reason}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_scope_skips_with_no_dispatchable_task() {
        let f = fixture().await;
        let outcome = f.dispatcher.dispatch_next(&f.scope).await.unwrap();
        assert_skip(outcome, SkipReason::NoDispatchableTask);
    }

    #[tokio::test]
    async fn max_concurrent_guard_fires_first() {
        let f = fixture().await;
        for i in 0..3 {
            let t = queue(&f, &format!("t{i}"), Priority::P1).await;
            f.store
                .update_status(t.id, TaskStatus::InProgress)
                .await
                .unwrap();
        }
        // A queued task exists, but concurrency wins.
        queue(&f, "waiting", Priority::P0).await;
        let outcome = f.dispatcher.dispatch_next(&f.scope).await.unwrap();
        assert_skip(outcome, SkipReason::MaxConcurrentReached);
    }

    #[tokio::test]
    async fn open_breaker_blocks_dispatch() {
        let f = fixture().await;
        queue(&f, "ready", Priority::P0).await;
        for _ in 0..3 {
            f.breakers.record_failure("steward-run").await;
        }
        let outcome = f.dispatcher.dispatch_next(&f.scope).await.unwrap();
        assert_skip(outcome, SkipReason::CircuitBreakerOpen);
    }

    #[tokio::test]
    async fn cooldown_blocks_back_to_back_dispatch() {
        let f = fixture().await;
        queue(&f, "ready", Priority::P0).await;
        f.store
            .kv_set(KV_LAST_DISPATCH, json!(Utc::now().to_rfc3339()))
            .await
            .unwrap();
        let outcome = f.dispatcher.dispatch_next(&f.scope).await.unwrap();
        assert_skip(outcome, SkipReason::CooldownActive);
    }

    #[tokio::test]
    async fn missing_executor_still_dispatches_the_task_in_progress() {
        let mut agent = AgentConfig::default();
        agent.binary = PathBuf::from("/nonexistent/steward-run");
        let f = fixture_with(DispatchConfig::default(), agent).await;
        let queued = queue(&f, "ready", Priority::P0).await;

        let outcome = f.dispatcher.dispatch_next(&f.scope).await.unwrap();
        match outcome {
            DispatchOutcome::Dispatched { task, run_id } => {
                assert_eq!(task.id, queued.id);
                assert!(run_id.is_none(), "no agent means no run id");
            }
            other => panic!("expected agentless dispatch, got {other:?}"),
        }

        // The task parks in_progress for the patrol, not back in the queue.
        let task = f.store.task(queued.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(f.dispatcher.last_dispatch_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn selection_is_priority_then_age_and_honors_dependencies() {
        let f = fixture().await;
        let blocker = queue(&f, "blocker", Priority::P2).await;
        let mut blocked = Task::new("blocked", Priority::P0);
        blocked.goal_id = Some(f.scope.objective_id);
        blocked.depends_on = vec![blocker.id];
        f.store.insert_task(blocked).await.unwrap();
        queue(&f, "free", Priority::P1).await;

        // P0 is blocked by an incomplete dependency, so P1 wins.
        let next = f
            .dispatcher
            .select_next_dispatchable(&f.scope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.title, "free");

        f.store
            .update_status(blocker.id, TaskStatus::Completed)
            .await
            .unwrap();
        let next = f
            .dispatcher
            .select_next_dispatchable(&f.scope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.title, "blocked");
    }

    #[tokio::test]
    async fn patrol_auto_fails_stale_runs_only() {
        let f = fixture().await;

        let stale = queue(&f, "stale", Priority::P1).await;
        f.store
            .update_status(stale.id, TaskStatus::InProgress)
            .await
            .unwrap();
        let mut patch = Map::new();
        patch.insert(
            "run_triggered_at".into(),
            json!((Utc::now() - Duration::minutes(65)).to_rfc3339()),
        );
        f.store.merge_payload(stale.id, patch).await.unwrap();

        let fresh = queue(&f, "fresh", Priority::P1).await;
        f.store
            .update_status(fresh.id, TaskStatus::InProgress)
            .await
            .unwrap();

        let timed_out = f.dispatcher.auto_fail_timed_out(&f.scope).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].task.id, stale.id);
        assert!(timed_out[0].elapsed_minutes >= 65);

        let stale = f.store.task(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::Failed);
        assert_eq!(stale.payload["run_status"], "timeout");
        let fresh = f.store.task(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::InProgress);

        // The timeout counted against the breaker and landed in the audit log
        // under the patrol's event type.
        assert_eq!(f.breakers.state("steward-run").await.failures, 1);
        let cleanups = f
            .events
            .query(&crate::events::EventFilter {
                event_type: Some("patrol_cleanup".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].payload["task_id"], json!(stale.id));
    }

    #[tokio::test]
    async fn patrol_falls_back_to_started_at() {
        let f = fixture().await;
        let t = queue(&f, "old-style", Priority::P1).await;
        f.store
            .update_status(t.id, TaskStatus::InProgress)
            .await
            .unwrap();
        // No run_triggered_at in the payload; backdate started_at directly.
        {
            let mut task = f.store.task(t.id).await.unwrap().unwrap();
            task.started_at = Some(Utc::now() - Duration::minutes(90));
            f.store.insert_task(task).await.unwrap();
        }
        let timed_out = f.dispatcher.auto_fail_timed_out(&f.scope).await.unwrap();
        assert_eq!(timed_out.len(), 1);
    }
}
