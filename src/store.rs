// store.rs — Task/Goal Store port and the in-memory reference implementation.
//
// Persistence is an external collaborator: the orchestrator only ever talks to
// the `TaskStore` trait. `MemoryTaskStore` backs the default wiring and every
// test; a durable implementation plugs in behind the same trait.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StewardError};
use crate::model::{
    Decision, DecisionStatus, Goal, GoalStatus, Priority, Task, TaskStatus,
};

// ─── Focus scope ─────────────────────────────────────────────────────────────

/// The currently focused objective and its key results. Tasks linked to any of
/// `goal_ids` are in scope for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusScope {
    pub objective_id: Uuid,
    pub objective_title: String,
    /// The objective id plus every key-result id under it.
    pub goal_ids: Vec<Uuid>,
}

/// Task counts used by the decision engine's progress comparison.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GoalTaskStats {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
}

// ─── Port ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TaskStore: Send + Sync {
    // Tasks
    async fn insert_task(&self, task: Task) -> Result<Task>;
    async fn task(&self, id: Uuid) -> Result<Option<Task>>;
    /// Tasks in scope with one of `statuses`, ordered by priority then
    /// creation time. An empty scope matches nothing.
    async fn tasks_in_scope(&self, scope: &[Uuid], statuses: &[TaskStatus]) -> Result<Vec<Task>>;
    /// Flip a task's status, stamping `started_at`/`completed_at` as needed.
    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<Task>;
    async fn update_priority(&self, id: Uuid, priority: Priority) -> Result<()>;
    /// Shallow-merge `patch` into the task payload (original keys not named in
    /// the patch survive).
    async fn merge_payload(&self, id: Uuid, patch: Map<String, Value>) -> Result<()>;
    /// Most recently failed tasks, newest first.
    async fn recent_failed(&self, limit: usize) -> Result<Vec<Task>>;

    // Goals
    async fn goal(&self, id: Uuid) -> Result<Option<Goal>>;
    async fn active_goals(&self, goal_id: Option<Uuid>) -> Result<Vec<Goal>>;
    async fn goal_task_stats(&self, goal_id: Uuid) -> Result<GoalTaskStats>;
    async fn tasks_for_goal(&self, goal_id: Uuid, status: TaskStatus) -> Result<Vec<Task>>;
    async fn set_goal_progress(&self, id: Uuid, progress: i64) -> Result<()>;
    /// Direct children of an objective (its key results).
    async fn child_goals(&self, parent_id: Uuid) -> Result<Vec<Goal>>;

    // Decisions
    async fn insert_decision(&self, decision: Decision) -> Result<Decision>;
    async fn decision(&self, id: Uuid) -> Result<Option<Decision>>;
    async fn update_decision_status(&self, id: Uuid, status: DecisionStatus) -> Result<()>;
    async fn decisions(&self, limit: usize) -> Result<Vec<Decision>>;

    // Working memory (last tick, last dispatch, daily counters, tick enabled)
    async fn kv_get(&self, key: &str) -> Result<Option<Value>>;
    async fn kv_set(&self, key: &str, value: Value) -> Result<()>;

    /// The active focus scope, or `None` when no objective is focused.
    async fn current_focus(&self) -> Result<Option<FocusScope>>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<Uuid, Task>,
    goals: HashMap<Uuid, Goal>,
    decisions: HashMap<Uuid, Decision>,
    kv: HashMap<String, Value>,
    focus: Option<FocusScope>,
}

/// In-memory store. All state is lost on restart; durable persistence is a
/// separate concern behind the same port.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_goal(&self, goal: Goal) -> Goal {
        let mut inner = self.inner.write().await;
        inner.goals.insert(goal.id, goal.clone());
        goal
    }

    pub async fn set_focus(&self, focus: Option<FocusScope>) {
        self.inner.write().await.focus = focus;
    }

    /// Focus on a single goal — convenience for wiring and tests.
    pub async fn focus_on_goal(&self, goal: &Goal) {
        self.set_focus(Some(FocusScope {
            objective_id: goal.id,
            objective_title: goal.title.clone(),
            goal_ids: vec![goal.id],
        }))
        .await;
    }
}

fn ordered(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    tasks
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_task(&self, task: Task) -> Result<Task> {
        let mut inner = self.inner.write().await;
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn tasks_in_scope(&self, scope: &[Uuid], statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let tasks = inner
            .tasks
            .values()
            .filter(|t| {
                t.goal_id.map_or(false, |g| scope.contains(&g))
                    && statuses.contains(&t.status)
            })
            .cloned()
            .collect();
        Ok(ordered(tasks))
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(StewardError::TaskNotFound(id))?;
        let now = Utc::now();
        task.status = status;
        task.updated_at = now;
        match status {
            TaskStatus::InProgress => {
                if task.started_at.is_none() {
                    task.started_at = Some(now);
                }
            }
            TaskStatus::Completed => task.completed_at = Some(now),
            _ => {}
        }
        Ok(task.clone())
    }

    async fn update_priority(&self, id: Uuid, priority: Priority) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(StewardError::TaskNotFound(id))?;
        task.priority = priority;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_payload(&self, id: Uuid, patch: Map<String, Value>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(StewardError::TaskNotFound(id))?;
        for (k, v) in patch {
            task.payload.insert(k, v);
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn recent_failed(&self, limit: usize) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut failed: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn goal(&self, id: Uuid) -> Result<Option<Goal>> {
        Ok(self.inner.read().await.goals.get(&id).cloned())
    }

    async fn set_goal_progress(&self, id: Uuid, progress: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let goal = inner
            .goals
            .get_mut(&id)
            .ok_or(StewardError::GoalNotFound(id))?;
        goal.progress = progress;
        Ok(())
    }

    async fn child_goals(&self, parent_id: Uuid) -> Result<Vec<Goal>> {
        let inner = self.inner.read().await;
        let mut children: Vec<Goal> = inner
            .goals
            .values()
            .filter(|g| g.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn active_goals(&self, goal_id: Option<Uuid>) -> Result<Vec<Goal>> {
        let inner = self.inner.read().await;
        let mut goals: Vec<Goal> = inner
            .goals
            .values()
            .filter(|g| g.status == GoalStatus::Active)
            .filter(|g| goal_id.map_or(true, |id| g.id == id))
            .cloned()
            .collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(goals)
    }

    async fn goal_task_stats(&self, goal_id: Uuid) -> Result<GoalTaskStats> {
        let inner = self.inner.read().await;
        let mut stats = GoalTaskStats::default();
        for task in inner.tasks.values() {
            if task.goal_id == Some(goal_id) {
                stats.total += 1;
                match task.status {
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::InProgress => stats.in_progress += 1,
                    _ => {}
                }
            }
        }
        Ok(stats)
    }

    async fn tasks_for_goal(&self, goal_id: Uuid, status: TaskStatus) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let tasks = inner
            .tasks
            .values()
            .filter(|t| t.goal_id == Some(goal_id) && t.status == status)
            .cloned()
            .collect();
        Ok(ordered(tasks))
    }

    async fn insert_decision(&self, decision: Decision) -> Result<Decision> {
        let mut inner = self.inner.write().await;
        inner.decisions.insert(decision.id, decision.clone());
        Ok(decision)
    }

    async fn decision(&self, id: Uuid) -> Result<Option<Decision>> {
        Ok(self.inner.read().await.decisions.get(&id).cloned())
    }

    async fn update_decision_status(&self, id: Uuid, status: DecisionStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let decision = inner
            .decisions
            .get_mut(&id)
            .ok_or(StewardError::DecisionNotFound(id))?;
        decision.status = status;
        if status == DecisionStatus::Executed {
            decision.executed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn decisions(&self, limit: usize) -> Result<Vec<Decision>> {
        let inner = self.inner.read().await;
        let mut all: Vec<Decision> = inner.decisions.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().await.kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.write().await.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn current_focus(&self) -> Result<Option<FocusScope>> {
        Ok(self.inner.read().await.focus.clone())
    }
}
