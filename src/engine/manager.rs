//! The concurrent task manager: owns the task registry and the shared
//! registry handle, launches each task on its own worker, and tracks
//! per-task cancellation handles.

use crate::core::errors::{EngineError, Result};
use crate::engine::context::{ExecContext, GlobalContext};
use crate::engine::task::Task;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns registered tasks, one shared [`GlobalContext`], and the
/// cancellation handle of every task currently running.
///
/// Each `run_task` call spawns an independent worker; there is no pool or
/// upper bound on concurrent tasks. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct TaskManager {
    tasks: Arc<DashMap<String, Arc<Task>>>,
    running: Arc<DashMap<String, CancellationToken>>,
    global: Arc<RwLock<GlobalContext>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task by its ID. A later add with the same ID silently
    /// overwrites the earlier registration.
    pub fn add_task(&self, task: Task) -> Result<()> {
        if task.id().is_empty() {
            return Err(EngineError::invalid_task("task has an empty ID"));
        }
        let id = task.id().to_string();
        if self.tasks.insert(id.clone(), Arc::new(task)).is_some() {
            debug!(task_id = %id, "replaced previously registered task");
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    /// Launch a registered task on its own worker with the manager's shared
    /// context. Fails only when the ID is unknown.
    ///
    /// The worker's outcome is logged, never propagated; callers inspect
    /// the global context afterwards.
    pub fn run_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        let token = CancellationToken::new();
        self.running.insert(task_id.to_string(), token.clone());

        let ctx = ExecContext::with_cancellation(token).with_global(self.get_global_context());
        let running = self.running.clone();
        let id = task_id.to_string();
        info!(task_id = %id, "launching task");
        tokio::spawn(async move {
            let outcome = task.run_with_context(ctx).await;
            running.remove(&id);
            match outcome {
                Ok(()) => info!(task_id = %id, "task finished"),
                Err(e) => warn!(task_id = %id, error = %e, "task ended with error"),
            }
        });
        Ok(())
    }

    /// Cancel a running task. Cancellation is cooperative: the task stops
    /// at its next check. The handle stays in the running map until the
    /// worker finishes publishing, so `wait_for_all_tasks_to_complete`
    /// covers the wind-down.
    pub fn stop_task(&self, task_id: &str) -> Result<()> {
        match self.running.get(task_id) {
            Some(entry) => {
                entry.value().cancel();
                info!(task_id = %task_id, "stop requested");
                Ok(())
            }
            None => Err(EngineError::TaskNotRunning {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Best-effort cancellation of everything currently running, in no
    /// particular order. As with [`stop_task`](Self::stop_task), workers
    /// drop their own handles once they finish.
    pub fn stop_all_tasks(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }

    /// Point-in-time snapshot of the IDs with a live cancellation handle.
    pub fn get_running_tasks(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// Handle to the shared registry every launched task reads and writes.
    pub fn get_global_context(&self) -> GlobalContext {
        self.global
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wholesale replacement of the shared registry.
    ///
    /// Sharp edge, kept deliberately: tasks already in flight hold the old
    /// handle and finish publishing there; nothing drains or notifies them.
    /// Reset while idle, or expect the warning.
    pub fn reset_global_context(&self) {
        let outstanding = self.running.len();
        if outstanding > 0 {
            warn!(
                outstanding,
                "resetting global context while tasks are running; they keep the old one"
            );
        }
        *self.global.write().unwrap_or_else(|e| e.into_inner()) = GlobalContext::new();
    }

    /// Poll until no task holds a cancellation handle, or until `timeout`.
    /// Does not cancel anything on timeout.
    pub async fn wait_for_all_tasks_to_complete(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let outstanding = self.running.len();
            if outstanding == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::WaitTimeout {
                    outstanding,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}
