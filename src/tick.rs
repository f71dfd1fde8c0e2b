// SPDX-License-Identifier: MIT
//! Tick controller — the single-flight periodic driver.
//!
//! One tick body runs at a time, enforced by an in-memory run flag. A crashed
//! or wedged tick cannot jam the loop forever: any caller finding the flag
//! held longer than the tick timeout force-releases it and proceeds. The loop
//! itself is a plain interval timer invoking [`TickController::run_tick_safe`];
//! manual ticks and the execution callback go through the same entry point.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::TickConfig;
use crate::decision::DecisionEngine;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::Result;
use crate::events::EventLog;
use crate::model::{ActionTaken, RunResult, TaskStatus};
use crate::notify::Notifier;
use crate::planner::{PlanOutcome, Planner};
use crate::retry::RetryAnalyzer;
use crate::store::TaskStore;

const KV_TICK_ENABLED: &str = "tick_enabled";
const KV_TICK_LAST: &str = "tick_last";
const KV_ACTIONS_TODAY: &str = "tick_actions_today";

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub source: String,
    pub actions: Vec<ActionTaken>,
    pub queued: usize,
    pub in_progress: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed(TickSummary),
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TickStatus {
    pub enabled: bool,
    pub running: bool,
    pub loop_active: bool,
    pub interval_secs: u64,
    pub last_tick: Option<String>,
    pub actions_today: u64,
}

// ─── Controller ──────────────────────────────────────────────────────────────

pub struct TickController {
    store: Arc<dyn TaskStore>,
    events: Arc<EventLog>,
    decisions: Arc<DecisionEngine>,
    dispatcher: Arc<Dispatcher>,
    retry: Arc<RetryAnalyzer>,
    planner: Arc<dyn Planner>,
    notifier: Arc<dyn Notifier>,
    config: TickConfig,
    /// `Some(started)` while a tick body is running.
    run_flag: Mutex<Option<Instant>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: Arc<EventLog>,
        decisions: Arc<DecisionEngine>,
        dispatcher: Arc<Dispatcher>,
        retry: Arc<RetryAnalyzer>,
        planner: Arc<dyn Planner>,
        notifier: Arc<dyn Notifier>,
        config: TickConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            decisions,
            dispatcher,
            retry,
            planner,
            notifier,
            config,
            run_flag: Mutex::new(None),
            loop_handle: Mutex::new(None),
        })
    }

    // ─── Single-flight entry point ───────────────────────────────────────────

    /// Run one tick unless another is already running. A flag held past the
    /// tick timeout is treated as leaked and force-released.
    pub async fn run_tick_safe(&self, source: &str) -> TickOutcome {
        {
            let mut flag = self.run_flag.lock().await;
            if let Some(started) = *flag {
                if started.elapsed() < self.config.timeout() {
                    return TickOutcome::Skipped {
                        reason: "already_running".into(),
                    };
                }
                warn!(
                    held_ms = started.elapsed().as_millis() as u64,
                    "tick lock held past timeout, force-releasing"
                );
                self.events
                    .emit(
                        "tick_lock_force_released",
                        "tick",
                        json!({ "held_ms": started.elapsed().as_millis() as u64 }),
                    )
                    .await;
            }
            *flag = Some(Instant::now());
        }

        let outcome = match self.execute_tick(source).await {
            Ok(summary) => {
                info!(
                    source,
                    actions = summary.actions.len(),
                    duration_ms = summary.duration_ms,
                    "tick completed"
                );
                TickOutcome::Completed(summary)
            }
            Err(e) => {
                error!(source, err = %e, "tick failed");
                self.events
                    .emit("tick_failed", "tick", json!({ "source": source, "error": e.to_string() }))
                    .await;
                TickOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        // Release on completion and on failure alike.
        *self.run_flag.lock().await = None;
        outcome
    }

    // ─── Tick body ───────────────────────────────────────────────────────────

    async fn execute_tick(&self, source: &str) -> Result<TickSummary> {
        let started = Instant::now();
        let mut actions: Vec<ActionTaken> = Vec::new();

        // 1. Decisions: auto-execute when confident and non-escalating.
        let outcome = self.decisions.generate_decision(source).await?;
        if !outcome.decision.actions.is_empty() && !outcome.requires_approval {
            let results = self.decisions.execute_decision(outcome.decision.id).await?;
            let mut a = ActionTaken::new("decision_auto_executed");
            a.reason = Some(format!(
                "{} action(s), confidence {:.2}",
                results.len(),
                outcome.decision.confidence
            ));
            actions.push(a);
        }

        // 2. Focus scope; nothing to orchestrate without one.
        let scope = match self.store.current_focus().await? {
            Some(s) => s,
            None => {
                self.events
                    .emit("tick_no_focus", "tick", json!({ "source": source }))
                    .await;
                let mut a = ActionTaken::new("skipped");
                a.reason = Some("no_focus".into());
                return Ok(self.finish(source, vec![a], 0, 0, started).await?);
            }
        };

        // 3. In-scope queue state.
        let queued = self
            .store
            .tasks_in_scope(&scope.goal_ids, &[TaskStatus::Queued])
            .await?;
        let in_progress = self
            .store
            .tasks_in_scope(&scope.goal_ids, &[TaskStatus::InProgress])
            .await?;

        // 4. Timeout patrol; timed-out runs go through the retry analyzer.
        let timed_out = self.dispatcher.auto_fail_timed_out(&scope).await?;
        if !timed_out.is_empty() {
            self.notifier
                .notify(
                    "patrol_cleanup",
                    &format!("auto-failed {} timed out task(s)", timed_out.len()),
                )
                .await;
        }
        for t in &timed_out {
            let mut a = ActionTaken::for_task("auto-fail-timeout", &t.task);
            a.elapsed_minutes = Some(t.elapsed_minutes);
            actions.push(a);

            let run = RunResult {
                status: "timeout".into(),
                result_summary: format!(
                    "auto-failed after {}min without callback",
                    t.elapsed_minutes
                ),
                elapsed_minutes: t.elapsed_minutes,
            };
            let (_, retry) = self.retry.handle_failed_task(&t.task, &run).await?;
            if let Some(retry) = retry {
                actions.push(ActionTaken::for_task("retry_created", &retry));
            }
        }

        // 5. Flag long-running tasks the patrol has not reclaimed yet.
        let stale_after = chrono::Duration::hours(self.config.stale_threshold_hours);
        let now = Utc::now();
        for task in &in_progress {
            let old = task
                .started_at
                .map_or(false, |s| now - s > stale_after);
            if old && task.payload.get("needs_attention").is_none() {
                let mut patch = Map::new();
                patch.insert("needs_attention".into(), Value::Bool(true));
                self.store.merge_payload(task.id, patch).await?;
                self.events
                    .emit(
                        "task_stale",
                        "tick",
                        json!({ "task_id": task.id, "title": task.title }),
                    )
                    .await;
                actions.push(ActionTaken::for_task("flag_stale", task));
            }
        }

        // 6. Empty queue: ask the planner before dispatching.
        if queued.is_empty() {
            match self.planner.plan_next_task(&scope).await? {
                PlanOutcome::Planned(mut task) => {
                    if task.goal_id.is_none() {
                        task.goal_id = Some(scope.objective_id);
                    }
                    let task = self.store.insert_task(task).await?;
                    self.events
                        .emit(
                            "task_planned",
                            "tick",
                            json!({ "task_id": task.id, "title": task.title }),
                        )
                        .await;
                    actions.push(ActionTaken::for_task("planned_task", &task));
                }
                PlanOutcome::NeedsPlanning => {
                    self.events
                        .emit(
                            "needs_planning",
                            "tick",
                            json!({ "objective": scope.objective_title }),
                        )
                        .await;
                    let mut a = ActionTaken::new("needs_planning");
                    a.reason = Some(scope.objective_title.clone());
                    actions.push(a);
                }
            }
        }

        // 7. Dispatch.
        match self.dispatcher.dispatch_next(&scope).await? {
            DispatchOutcome::Dispatched { task, run_id } => {
                let mut a = ActionTaken::for_task("dispatch", &task);
                if run_id.is_none() {
                    a.reason = Some("no_executor".into());
                }
                a.run_id = run_id;
                actions.push(a);
            }
            DispatchOutcome::Skipped(reason) => {
                let mut a = ActionTaken::new("dispatch_skipped");
                a.reason = Some(reason.to_string());
                actions.push(a);
            }
            DispatchOutcome::SpawnFailed { task, reason } => {
                let mut a = ActionTaken::for_task("dispatch_spawn_failed", &task);
                a.reason = Some(reason);
                actions.push(a);
            }
        }

        // 8. Bookkeeping.
        self.finish(source, actions, queued.len(), in_progress.len(), started)
            .await
    }

    async fn finish(
        &self,
        source: &str,
        actions: Vec<ActionTaken>,
        queued: usize,
        in_progress: usize,
        started: Instant,
    ) -> Result<TickSummary> {
        self.store
            .kv_set(KV_TICK_LAST, json!(Utc::now().to_rfc3339()))
            .await?;
        self.bump_daily_counter(actions.len() as u64).await?;

        let summary = TickSummary {
            source: source.to_string(),
            actions,
            queued,
            in_progress,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.events
            .emit(
                "tick_completed",
                "tick",
                serde_json::to_value(&summary).unwrap_or(Value::Null),
            )
            .await;
        Ok(summary)
    }

    /// Daily action counter, reset on date change. Rolling to a new date
    /// closes out the outgoing day with a daily-summary notification.
    async fn bump_daily_counter(&self, by: u64) -> Result<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let current = self.store.kv_get(KV_ACTIONS_TODAY).await?;
        let count = match &current {
            Some(v) if v.get("date").and_then(Value::as_str) == Some(today.as_str()) => {
                v.get("count").and_then(Value::as_u64).unwrap_or(0)
            }
            _ => {
                if let Some(previous) = &current {
                    self.send_daily_summary(previous).await;
                }
                0
            }
        };
        self.store
            .kv_set(
                KV_ACTIONS_TODAY,
                json!({ "date": today, "count": count + by }),
            )
            .await
    }

    /// Best-effort health digest for the day that just ended: its action
    /// counter plus dispatch/completion/failure/patrol totals from the event
    /// log.
    async fn send_daily_summary(&self, previous: &Value) {
        let date = previous
            .get("date")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let actions = previous.get("count").and_then(Value::as_u64).unwrap_or(0);
        let counts = self.events.counts_by_type().await;
        let n = |key: &str| counts.get(key).copied().unwrap_or(0);
        let message = format!(
            "{date}: {actions} action(s); {} dispatched, {} completed, {} failed, \
             {} patrol cleanup(s), {} circuit open(s)",
            n("task_dispatched"),
            n("task_completed"),
            n("task_failed"),
            n("patrol_cleanup"),
            n("circuit_open"),
        );
        info!(date, "sending daily summary");
        self.notifier.notify("daily-summary", &message).await;
    }

    pub async fn actions_today(&self) -> Result<u64> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Ok(self
            .store
            .kv_get(KV_ACTIONS_TODAY)
            .await?
            .filter(|v| v.get("date").and_then(Value::as_str) == Some(today.as_str()))
            .and_then(|v| v.get("count").and_then(Value::as_u64))
            .unwrap_or(0))
    }

    // ─── Loop management ─────────────────────────────────────────────────────

    pub async fn is_enabled(&self) -> bool {
        self.store
            .kv_get(KV_TICK_ENABLED)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.store.kv_set(KV_TICK_ENABLED, json!(enabled)).await?;
        info!(enabled, "tick loop toggled");
        self.events
            .emit(
                if enabled { "tick_enabled" } else { "tick_disabled" },
                "tick",
                json!({}),
            )
            .await;
        Ok(())
    }

    /// Start the recurring tick timer. Idempotent; a second start is a no-op.
    pub async fn start_tick_loop(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let controller = Arc::clone(self);
        let period = self.config.interval();
        *handle = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if !controller.is_enabled().await {
                    continue;
                }
                controller.run_tick_safe("interval").await;
            }
        }));
        info!(interval_secs = self.config.interval_secs, "tick loop started");
    }

    pub async fn stop_tick_loop(&self) {
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
            info!("tick loop stopped");
        }
    }

    pub async fn status(&self) -> Result<TickStatus> {
        let last_tick = self
            .store
            .kv_get(KV_TICK_LAST)
            .await?
            .and_then(|v| v.as_str().map(str::to_owned));
        Ok(TickStatus {
            enabled: self.is_enabled().await,
            running: self.run_flag.lock().await.is_some(),
            loop_active: self.loop_handle.lock().await.is_some(),
            interval_secs: self.config.interval_secs,
            last_tick,
            actions_today: self.actions_today().await?,
        })
    }
}
