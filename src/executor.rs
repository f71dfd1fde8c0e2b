// SPDX-License-Identifier: MIT
//! Execution agent launcher and run registry.
//!
//! The agent is an opaque subprocess launched fully detached (own process
//! group, stdio redirected to a log file) so a daemon restart never takes
//! running work down with it. Liveness is probed with signal 0; termination
//! sends SIGTERM to the process group and nothing stronger, the agent is
//! trusted to wind down its own children.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::events::EventLog;
use crate::model::{Task, TaskStatus};
use crate::store::TaskStore;

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub task_id: Uuid,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
}

/// Outcome of a launch attempt. Spawn failures are data, not errors: the
/// dispatcher turns them into a failed task and a breaker strike instead of
/// aborting the tick.
#[derive(Debug)]
pub enum LaunchOutcome {
    Launched(RunHandle),
    /// The task already has a live run; launching again would double-execute.
    AlreadyRunning { run_id: String },
    Failed { reason: String },
}

pub struct AgentExecutor {
    config: AgentConfig,
    store: Arc<dyn TaskStore>,
    events: Arc<EventLog>,
    registry: Arc<RwLock<HashMap<String, RunHandle>>>,
}

impl AgentExecutor {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn TaskStore>,
        events: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            events,
            registry: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Whether the agent binary is resolvable. Checked by the dispatcher's
    /// `no_executor` guard before anything else touches the task.
    pub fn available(&self) -> bool {
        let binary = &self.config.binary;
        if binary.components().count() > 1 {
            return binary.exists();
        }
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
            })
            .unwrap_or(false)
    }

    fn next_run_id(task_id: Uuid) -> String {
        let short = &task_id.simple().to_string()[..8];
        format!("run-{short}-{}", Utc::now().timestamp_millis())
    }

    /// Materialize the prompt the agent works from. Prefers PRD content in
    /// the payload, then a referenced PRD file, then title + description.
    fn write_prompt_file(&self, task: &Task, run_id: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.prompt_dir)?;
        let path = self.config.prompt_dir.join(format!("{run_id}.md"));
        let content = if let Some(prd) = task.payload.get("prd_content").and_then(Value::as_str) {
            prd.to_string()
        } else if let Some(path) = task.payload.get("prd_path").and_then(Value::as_str) {
            std::fs::read_to_string(path)?
        } else {
            format!("# {}\n\n{}\n", task.title, task.description)
        };
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Launch the agent for a task.
    ///
    /// Stamps the payload (`current_run_id`, `run_status`, `run_triggered_at`)
    /// and flips the task to `in_progress` before the spawn, so a crash
    /// between stamp and spawn is caught by the timeout patrol rather than
    /// double-dispatched.
    pub async fn launch(&self, task: &Task) -> Result<LaunchOutcome> {
        if let Some(run_id) = task.current_run_id() {
            if self.is_run_alive(run_id).await {
                return Ok(LaunchOutcome::AlreadyRunning {
                    run_id: run_id.to_string(),
                });
            }
        }

        let run_id = Self::next_run_id(task.id);

        let prompt_file = match self.write_prompt_file(task, &run_id) {
            Ok(p) => p,
            Err(e) => {
                return Ok(LaunchOutcome::Failed {
                    reason: format!("prompt file: {e}"),
                })
            }
        };

        let mut stamp = Map::new();
        stamp.insert("current_run_id".into(), json!(run_id));
        stamp.insert("run_status".into(), json!("triggered"));
        stamp.insert("run_triggered_at".into(), json!(Utc::now().to_rfc3339()));
        self.store.merge_payload(task.id, stamp).await?;
        self.store
            .update_status(task.id, TaskStatus::InProgress)
            .await?;

        match self.spawn_detached(task, &run_id, &prompt_file) {
            Ok((handle, child)) => {
                info!(
                    task = %task.id,
                    run_id = %handle.run_id,
                    pid = handle.pid,
                    "launched execution agent"
                );
                self.events
                    .emit(
                        "run_started",
                        "executor",
                        json!({
                            "task_id": task.id,
                            "run_id": handle.run_id,
                            "pid": handle.pid,
                        }),
                    )
                    .await;
                self.registry
                    .write()
                    .await
                    .insert(handle.run_id.clone(), handle.clone());
                self.spawn_watcher(handle.run_id.clone(), child);
                Ok(LaunchOutcome::Launched(handle))
            }
            Err(e) => {
                let mut patch = Map::new();
                patch.insert("run_status".into(), json!("spawn_failed"));
                self.store.merge_payload(task.id, patch).await?;
                warn!(task = %task.id, err = %e, "agent spawn failed");
                Ok(LaunchOutcome::Failed {
                    reason: format!("spawn: {e}"),
                })
            }
        }
    }

    fn spawn_detached(
        &self,
        task: &Task,
        run_id: &str,
        prompt_file: &PathBuf,
    ) -> std::io::Result<(RunHandle, Child)> {
        std::fs::create_dir_all(&self.config.log_dir)?;
        std::fs::create_dir_all(&self.config.work_dir)?;
        let log_path = self.config.log_dir.join(format!("{run_id}.log"));
        let log = File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg(task.id.to_string())
            .arg(run_id)
            .arg(prompt_file)
            .current_dir(&self.config.work_dir)
            .env("STEWARD_TASK_ID", task.id.to_string())
            .env("STEWARD_RUN_ID", run_id)
            .env("STEWARD_CALLBACK_URL", &self.config.callback_url)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            // Own process group: survives daemon restarts, killable as a unit.
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned agent has no pid")
        })? as i32;
        Ok((
            RunHandle {
                run_id: run_id.to_string(),
                task_id: task.id,
                pid,
                started_at: Utc::now(),
                log_file: log_path,
            },
            child,
        ))
    }

    /// Await the child so the OS can reap it and the registry entry drops the
    /// moment the agent exits, not whenever the next liveness prune runs.
    fn spawn_watcher(&self, run_id: String, mut child: Child) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(run_id = %run_id, code = status.code(), "agent process exited")
                }
                Err(e) => warn!(run_id = %run_id, err = %e, "agent process wait failed"),
            }
            registry.write().await.remove(&run_id);
        });
    }

    // ─── Liveness ────────────────────────────────────────────────────────────

    #[cfg(unix)]
    fn pid_alive(pid: i32) -> bool {
        // Signal 0 probes without delivering anything.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    fn pid_alive(_pid: i32) -> bool {
        false
    }

    pub async fn is_run_alive(&self, run_id: &str) -> bool {
        let registry = self.registry.read().await;
        registry
            .get(run_id)
            .map_or(false, |h| Self::pid_alive(h.pid))
    }

    /// Live runs. The exit watcher normally removes finished runs; the
    /// signal-0 prune here is a backstop for entries whose watcher was lost
    /// (the patrol deals with the task side).
    pub async fn active_count(&self) -> usize {
        let mut registry = self.registry.write().await;
        registry.retain(|run_id, h| {
            let alive = Self::pid_alive(h.pid);
            if !alive {
                info!(run_id, pid = h.pid, "pruned dead run from registry");
            }
            alive
        });
        registry.len()
    }

    pub async fn active_runs(&self) -> Vec<RunHandle> {
        self.registry.read().await.values().cloned().collect()
    }

    /// Drop a run from the registry, normally on completion callback.
    pub async fn deregister(&self, run_id: &str) -> Option<RunHandle> {
        self.registry.write().await.remove(run_id)
    }

    /// SIGTERM the run's whole process group. Returns false when the run is
    /// unknown or already gone. Never escalates to SIGKILL.
    pub async fn terminate_run(&self, run_id: &str) -> bool {
        let handle = match self.registry.write().await.remove(run_id) {
            Some(h) => h,
            None => return false,
        };
        let ok = Self::terminate_group(handle.pid);
        info!(run_id, pid = handle.pid, ok, "terminated run");
        self.events
            .emit(
                "run_terminated",
                "executor",
                json!({ "run_id": run_id, "task_id": handle.task_id, "pid": handle.pid }),
            )
            .await;
        ok
    }

    #[cfg(unix)]
    fn terminate_group(pid: i32) -> bool {
        unsafe { libc::kill(-pid, libc::SIGTERM) == 0 }
    }

    #[cfg(not(unix))]
    fn terminate_group(_pid: i32) -> bool {
        false
    }

    // ─── Orphan cleanup ──────────────────────────────────────────────────────

    /// Scan `/proc` for agent processes left over from a previous daemon
    /// incarnation and SIGTERM their groups. Called once at startup, before
    /// the registry has any entries.
    #[cfg(target_os = "linux")]
    pub fn cleanup_orphans(&self) -> usize {
        let needle = match self.config.binary.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => return 0,
        };
        let my_pid = std::process::id() as i32;
        let mut killed = 0;

        let entries = match std::fs::read_dir("/proc") {
            Ok(e) => e,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let pid: i32 = match entry.file_name().to_string_lossy().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            if pid == my_pid {
                continue;
            }
            let cmdline = match std::fs::read(entry.path().join("cmdline")) {
                Ok(raw) => String::from_utf8_lossy(&raw).replace('\0', " "),
                Err(_) => continue,
            };
            if cmdline.contains(&needle) && cmdline.contains("run-") {
                if Self::terminate_group(pid) {
                    warn!(pid, "terminated orphaned agent process");
                    killed += 1;
                }
            }
        }
        killed
    }

    #[cfg(not(target_os = "linux"))]
    pub fn cleanup_orphans(&self) -> usize {
        0
    }
}
