// SPDX-License-Identifier: MIT
//! Retry analyzer: classifies run failures and decides whether a task gets
//! another attempt.
//!
//! Classification walks an *ordered* list of (kind, pattern) pairs over the
//! combined status/summary text; the first match wins and the order is part of
//! the contract (more specific kinds first). `env_error` is never retried,
//! since re-running a task cannot fix a broken environment, and nothing is
//! retried once the lineage has burned its retry budget.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::events::EventLog;
use crate::model::{RunResult, Task};
use crate::store::TaskStore;

pub const MAX_RETRIES: u32 = 2;

/// Runs longer than this are treated as timeouts even without a timeout
/// message in the summary.
const LONG_RUN_MINUTES: i64 = 25;

const RETRY_TITLE_PREFIX: &str = "[Retry] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    CiFailure,
    EnvError,
    CodeError,
    Unknown,
}

impl FailureKind {
    /// Retry policy per kind. The retry budget is checked separately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::EnvError)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::CiFailure => write!(f, "ci_failure"),
            FailureKind::EnvError => write!(f, "env_error"),
            FailureKind::CodeError => write!(f, "code_error"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ordered classification table — first match wins. `Unknown` is the fallback
/// and deliberately absent here.
static CLASSIFIERS: Lazy<Vec<(FailureKind, Regex)>> = Lazy::new(|| {
    vec![
        (FailureKind::Timeout, Regex::new(r"timeout").unwrap()),
        (
            FailureKind::EnvError,
            Regex::new(r"\bnpm\b|permission|enoent").unwrap(),
        ),
        (
            FailureKind::CiFailure,
            Regex::new(r"\bci\b|\bcheck\b").unwrap(),
        ),
        (FailureKind::CodeError, Regex::new(r"error|fail").unwrap()),
    ]
});

/// Classify a run failure. Pure: text + elapsed time in, kind out.
pub fn classify(run: &RunResult) -> FailureKind {
    // A silent over-long run is a timeout even if nothing said so.
    if run.elapsed_minutes > LONG_RUN_MINUTES {
        return FailureKind::Timeout;
    }
    let combined = format!("{} {}", run.status, run.result_summary).to_lowercase();
    for (kind, pattern) in CLASSIFIERS.iter() {
        if pattern.is_match(&combined) {
            return *kind;
        }
    }
    FailureKind::Unknown
}

/// Result of [`RetryAnalyzer::analyze_failure`].
#[derive(Debug, Clone, Serialize)]
pub struct FailureAnalysis {
    pub kind: FailureKind,
    pub retryable: bool,
    pub reason: String,
    /// Payload for the retry task: incremented retry_count, lineage link,
    /// preserved PRD content, and kind-specific hints.
    pub adjusted_payload: Map<String, Value>,
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub struct RetryAnalyzer {
    store: Arc<dyn TaskStore>,
    events: Arc<EventLog>,
    max_retries: u32,
}

impl RetryAnalyzer {
    pub fn new(store: Arc<dyn TaskStore>, events: Arc<EventLog>, max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            max_retries,
        })
    }

    /// Classify a failure and build the adjusted payload for a retry attempt.
    ///
    /// Retryability is the kind's policy gated by the budget: once
    /// `retry_count >= max_retries` nothing is retryable, whatever the kind.
    pub fn analyze_failure(&self, task: &Task, run: &RunResult) -> FailureAnalysis {
        let kind = classify(run);
        let summary = run.result_summary.as_str();
        let mut retryable = kind.is_retryable();
        let mut hints = Map::new();

        let mut reason = match kind {
            FailureKind::Timeout => {
                hints.insert("timeout_extended".into(), Value::Bool(true));
                if run.elapsed_minutes > 0 {
                    format!("Execution timed out ({}min)", run.elapsed_minutes)
                } else {
                    "Execution timed out (timeout detected)".to_string()
                }
            }
            FailureKind::EnvError => {
                hints.insert("env_issue".into(), Value::Bool(true));
                format!("Environment error: {}", truncate(summary, 100))
            }
            FailureKind::CiFailure => {
                hints.insert(
                    "ci_context".into(),
                    Value::String(truncate(summary, 200).to_string()),
                );
                format!("CI/check failure: {}", truncate(summary, 100))
            }
            FailureKind::CodeError => {
                hints.insert(
                    "error_context".into(),
                    Value::String(truncate(summary, 200).to_string()),
                );
                format!("Code error: {}", truncate(summary, 100))
            }
            FailureKind::Unknown => {
                let detail = if !run.status.is_empty() {
                    run.status.as_str()
                } else if !summary.is_empty() {
                    summary
                } else {
                    "no details"
                };
                hints.insert(
                    "previous_failure".into(),
                    Value::String(detail.to_string()),
                );
                format!("Unknown failure: {}", truncate(detail, 100))
            }
        };

        let retry_count = task.retry_count();
        if retry_count >= self.max_retries {
            retryable = false;
            reason.push_str(&format!(" (max retries {} reached)", self.max_retries));
        }

        let mut adjusted_payload = hints;
        adjusted_payload.insert("retry_of".into(), json!(task.id));
        adjusted_payload.insert("retry_count".into(), json!(retry_count + 1));
        adjusted_payload.insert("failure_type".into(), json!(kind.to_string()));
        adjusted_payload.insert("failure_reason".into(), json!(reason.clone()));

        // Carry the PRD the agent worked from into the retry.
        for key in ["prd_content", "prd_path"] {
            if let Some(v) = task.payload.get(key) {
                adjusted_payload.insert(key.into(), v.clone());
            }
        }

        FailureAnalysis {
            kind,
            retryable,
            reason,
            adjusted_payload,
        }
    }

    /// Insert a new queued task cloning the failed one. The `[Retry]` title
    /// prefix is idempotent — retrying a retry never stacks prefixes.
    pub async fn create_retry_task(
        &self,
        original: &Task,
        adjusted_payload: Map<String, Value>,
    ) -> Result<Task> {
        let title = if original.title.starts_with(RETRY_TITLE_PREFIX.trim_end()) {
            original.title.clone()
        } else {
            format!("{RETRY_TITLE_PREFIX}{}", original.title)
        };

        let mut retry = Task::new(title, original.priority);
        retry.description = original.description.clone();
        retry.goal_id = original.goal_id;
        retry.project_id = original.project_id;
        retry.payload = adjusted_payload;
        let retry = self.store.insert_task(retry).await?;

        info!(
            original = %original.id,
            retry = %retry.id,
            retry_count = retry.retry_count(),
            "created retry task"
        );
        self.events
            .emit(
                "task_retried",
                "retry_analyzer",
                json!({
                    "original_task_id": original.id,
                    "retry_task_id": retry.id,
                    "retry_count": retry.payload.get("retry_count"),
                    "failure_type": retry.payload.get("failure_type"),
                    "reason": retry.payload.get("failure_reason"),
                }),
            )
            .await;

        Ok(retry)
    }

    /// Analyze a failed task and, when policy allows, create its retry.
    /// Returns `(analysis, None)` for hard stops (env_error or exhausted
    /// budget) — the task stays `failed` for human triage.
    pub async fn handle_failed_task(
        &self,
        task: &Task,
        run: &RunResult,
    ) -> Result<(FailureAnalysis, Option<Task>)> {
        let analysis = self.analyze_failure(task, run);
        let retry = if analysis.retryable {
            Some(
                self.create_retry_task(task, analysis.adjusted_payload.clone())
                    .await?,
            )
        } else {
            None
        };
        Ok((analysis, retry))
    }

    /// Operator override: clone a retry task ignoring the budget.
    pub async fn force_retry(&self, task_id: uuid::Uuid) -> Result<Task> {
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or(crate::error::StewardError::TaskNotFound(task_id))?;

        let mut payload = Map::new();
        payload.insert("retry_of".into(), json!(task.id));
        payload.insert("retry_count".into(), json!(task.retry_count() + 1));
        payload.insert("forced".into(), Value::Bool(true));
        for key in ["prd_content", "prd_path"] {
            if let Some(v) = task.payload.get(key) {
                payload.insert(key.into(), v.clone());
            }
        }
        self.create_retry_task(&task, payload).await
    }

    /// The effective policy, for the operator status surface.
    pub fn policy(&self) -> Value {
        json!({
            "max_retries": self.max_retries,
            "retryable_types": ["timeout", "ci_failure", "code_error", "unknown"],
            "non_retryable_types": ["env_error"],
        })
    }
}

/// Queued-retry helper used by tests and the decision engine: whether this
/// task is itself a retry clone.
pub fn is_retry_of(task: &Task) -> Option<uuid::Uuid> {
    task.payload
        .get("retry_of")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, TaskStatus};
    use crate::store::MemoryTaskStore;

    fn run(status: &str, summary: &str, elapsed: i64) -> RunResult {
        RunResult {
            status: status.into(),
            result_summary: summary.into(),
            elapsed_minutes: elapsed,
        }
    }

    fn analyzer() -> Arc<RetryAnalyzer> {
        RetryAnalyzer::new(MemoryTaskStore::new(), EventLog::new(), MAX_RETRIES)
    }

    #[test]
    fn classification_order_is_first_match_wins() {
        // "timeout" beats the code_error pattern even though "fail" matches too.
        assert_eq!(
            classify(&run("AI Failed", "timeout waiting for CI", 0)),
            FailureKind::Timeout
        );
        // env beats ci and code.
        assert_eq!(
            classify(&run("", "npm install failed during CI check", 0)),
            FailureKind::EnvError
        );
        assert_eq!(
            classify(&run("", "CI check did not pass", 0)),
            FailureKind::CiFailure
        );
        assert_eq!(
            classify(&run("", "TypeError: x is undefined", 0)),
            FailureKind::CodeError
        );
        assert_eq!(classify(&run("", "??", 0)), FailureKind::Unknown);
    }

    #[test]
    fn long_runs_classify_as_timeout() {
        assert_eq!(classify(&run("", "no message at all", 26)), FailureKind::Timeout);
        assert_eq!(classify(&run("", "no message at all", 25)), FailureKind::Unknown);
    }

    #[test]
    fn env_error_is_never_retryable() {
        let a = analyzer();
        let task = Task::new("t", Priority::P1);
        let analysis = a.analyze_failure(&task, &run("", "ENOENT: missing file", 0));
        assert_eq!(analysis.kind, FailureKind::EnvError);
        assert!(!analysis.retryable);
        assert_eq!(analysis.adjusted_payload["env_issue"], true);
    }

    #[test]
    fn retry_budget_gates_retryable_kinds() {
        let a = analyzer();
        let mut task = Task::new("t", Priority::P1);
        task.payload.insert("retry_count".into(), json!(MAX_RETRIES));
        let analysis = a.analyze_failure(&task, &run("", "timeout", 0));
        assert_eq!(analysis.kind, FailureKind::Timeout);
        assert!(!analysis.retryable, "budget exhausted → not retryable");
        assert!(analysis.reason.contains("max retries"));
    }

    #[test]
    fn adjusted_payload_increments_and_preserves_prd() {
        let a = analyzer();
        let mut task = Task::new("t", Priority::P1);
        task.payload.insert("retry_count".into(), json!(1));
        task.payload.insert("prd_content".into(), json!("# Spec"));
        let analysis = a.analyze_failure(&task, &run("", "build error", 0));
        assert_eq!(analysis.adjusted_payload["retry_count"], 2);
        assert_eq!(analysis.adjusted_payload["prd_content"], "# Spec");
        assert_eq!(analysis.adjusted_payload["failure_type"], "code_error");
    }

    #[tokio::test]
    async fn retry_prefix_is_idempotent() {
        let a = analyzer();
        let original = Task::new("[Retry] Build feature", Priority::P0);
        let retry = a
            .create_retry_task(&original, Map::new())
            .await
            .unwrap();
        assert_eq!(retry.title, "[Retry] Build feature");

        let plain = Task::new("Build feature", Priority::P0);
        let retry = a.create_retry_task(&plain, Map::new()).await.unwrap();
        assert_eq!(retry.title, "[Retry] Build feature");
    }

    #[tokio::test]
    async fn handle_failed_task_stops_hard_on_env_error() {
        let a = analyzer();
        let task = Task::new("t", Priority::P1);
        let (analysis, retry) = a
            .handle_failed_task(&task, &run("", "permission denied", 0))
            .await
            .unwrap();
        assert_eq!(analysis.kind, FailureKind::EnvError);
        assert!(retry.is_none());
    }

    #[tokio::test]
    async fn handle_failed_task_creates_retry_and_emits() {
        let store = MemoryTaskStore::new();
        let events = EventLog::new();
        let a = RetryAnalyzer::new(store.clone(), events.clone(), MAX_RETRIES);

        let task = store
            .insert_task(Task::new("Flaky", Priority::P1))
            .await
            .unwrap();
        let (_, retry) = a
            .handle_failed_task(&task, &run("AI Failed", "timeout", 0))
            .await
            .unwrap();

        let retry = retry.expect("timeout is retryable");
        assert_eq!(retry.status, TaskStatus::Queued);
        assert_eq!(retry.retry_count(), 1);
        assert_eq!(is_retry_of(&retry), Some(task.id));

        let emitted = events.recent(5).await;
        assert_eq!(emitted[0].event_type, "task_retried");
    }

    #[tokio::test]
    async fn force_retry_ignores_budget() {
        let store = MemoryTaskStore::new();
        let a = RetryAnalyzer::new(store.clone(), EventLog::new(), MAX_RETRIES);

        let mut task = Task::new("Stuck", Priority::P1);
        task.payload.insert("retry_count".into(), json!(5));
        let task = store.insert_task(task).await.unwrap();

        let retry = a.force_retry(task.id).await.unwrap();
        assert_eq!(retry.retry_count(), 6);
        assert_eq!(retry.payload["forced"], true);
    }
}
