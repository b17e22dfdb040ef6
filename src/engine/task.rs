//! The sequential task runner: an ordered list of wrapped actions sharing
//! one cancellation token and one registry.

use crate::core::errors::{is_prerequisite_not_met, EngineError, Result};
use crate::engine::action::ActionWrapper;
use crate::engine::context::{ExecContext, GlobalContext, ResultProvider, StoredResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Task-scoped view handed to a custom result builder after every action
/// has succeeded.
pub struct ResultBuilderContext<'a> {
    pub task_id: &'a str,
    pub global: &'a GlobalContext,
}

/// Builds the task's richer result from whatever the actions published.
/// A builder error flips the published success flag but does not fail the
/// run itself.
pub type ResultBuilder =
    Box<dyn Fn(&ResultBuilderContext<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// Summary a task publishes under its own ID at the end of every run,
/// successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunSummary {
    pub task_id: String,
    pub run_id: String,
    pub name: String,
    pub total_time_ms: u64,
    pub completed_count: u64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct TaskState {
    total_duration: Duration,
    completed_count: u64,
    error: Option<String>,
    result: Option<Value>,
    run_id: Option<String>,
}

/// An ordered, sequential list of wrapped actions. Created and populated
/// before registration with a manager; internal counters mutate only during
/// [`run`](Self::run). Not designed for concurrent re-entry on the same
/// value.
pub struct Task {
    id: String,
    name: String,
    actions: Vec<ActionWrapper>,
    state: Mutex<TaskState>,
    result_builder: Option<ResultBuilder>,
}

impl Task {
    pub fn new<I, N>(id: I, name: N) -> Self
    where
        I: Into<String>,
        N: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            actions: Vec::new(),
            state: Mutex::new(TaskState::default()),
            result_builder: None,
        }
    }

    pub fn with_action(mut self, action: ActionWrapper) -> Self {
        self.actions.push(action);
        self
    }

    pub fn add_action(&mut self, action: ActionWrapper) {
        self.actions.push(action);
    }

    pub fn with_result_builder(mut self, builder: ResultBuilder) -> Self {
        self.result_builder = Some(builder);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cumulative duration of successfully completed actions in the most
    /// recent run.
    pub fn total_duration(&self) -> Duration {
        self.lock_state().total_duration
    }

    /// Number of actions that completed successfully in the most recent
    /// run, incremented per success, not per attempt.
    pub fn completed_count(&self) -> u64 {
        self.lock_state().completed_count
    }

    /// The stored execution error of the most recent run, if any. At most
    /// one: the run stops at the first failure.
    pub fn error(&self) -> Option<String> {
        self.lock_state().error.clone()
    }

    /// Run identifier of the most recent run.
    pub fn run_id(&self) -> Option<String> {
        self.lock_state().run_id.clone()
    }

    /// Run with a fresh context (own token, empty registry).
    pub async fn run(&self) -> Result<()> {
        self.run_with_context(ExecContext::new()).await
    }

    /// Run every action in declared order under `ctx`'s token.
    ///
    /// The task's output summary and result provider are published even on
    /// failure or cancellation so post-mortem inspection works. A custom
    /// result builder's error is recorded (flipping the published success
    /// flag) without failing the returned result; builder failure is
    /// result-shaping, not execution failure.
    #[instrument(skip_all, fields(task_id = %self.id))]
    pub async fn run_with_context(&self, ctx: ExecContext) -> Result<()> {
        let run_id = cuid2::create_id();
        let ctx = ctx.ensure_global();
        let global = ctx.global().cloned().unwrap_or_default();
        let prior_result = global.task_result(&self.id);

        {
            let mut state = self.lock_state();
            state.total_duration = Duration::ZERO;
            state.completed_count = 0;
            state.error = None;
            state.result = None;
            state.run_id = Some(run_id.clone());
        }

        // Parameter-validation pass; a no-op unless an action overrides it.
        // A validation failure is recorded and published like any other
        // failure so post-mortem inspection works.
        for action in &self.actions {
            if let Err(err) = action.validate().await {
                warn!(run_id = %run_id, action_id = %action.id(), error = %err, "parameter validation failed");
                self.record_error(&err);
                self.publish(&global, &run_id, prior_result.clone());
                return Err(err);
            }
        }

        for action in &self.actions {
            if ctx.is_cancelled() {
                let err = EngineError::Cancelled {
                    task_id: self.id.clone(),
                    run_id: run_id.clone(),
                };
                warn!(run_id = %run_id, "task cancelled before action start");
                self.record_error(&err);
                self.publish(&global, &run_id, prior_result.clone());
                return Err(err);
            }

            match action.execute(&ctx).await {
                Ok(()) => {
                    {
                        let mut state = self.lock_state();
                        state.total_duration += action.duration();
                        state.completed_count += 1;
                    }
                    let action_id = action.id();
                    if let Some(output) = action.output() {
                        global.set_action_output(&action_id, output);
                    }
                    if let Some(provider) = action.result_provider() {
                        global.set_action_result(&action_id, provider);
                    }
                }
                Err(source) => {
                    let action_id = action.id();
                    let err = if is_prerequisite_not_met(&source) {
                        info!(run_id = %run_id, action_id = %action_id, "prerequisite not met, aborting task");
                        EngineError::TaskAborted {
                            task_id: self.id.clone(),
                            run_id: run_id.clone(),
                            action_id,
                        }
                    } else {
                        warn!(run_id = %run_id, action_id = %action_id, error = %source, "action failed");
                        EngineError::ActionFailed {
                            task_id: self.id.clone(),
                            run_id: run_id.clone(),
                            action_id,
                            source,
                        }
                    };
                    self.record_error(&err);
                    self.publish(&global, &run_id, prior_result.clone());
                    return Err(err);
                }
            }
        }

        if let Some(builder) = &self.result_builder {
            let builder_ctx = ResultBuilderContext {
                task_id: &self.id,
                global: &global,
            };
            match builder(&builder_ctx) {
                Ok(result) => {
                    self.lock_state().result = Some(result);
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "result builder failed");
                    self.lock_state().error = Some(format!("result builder failed: {e:#}"));
                }
            }
        }

        self.publish(&global, &run_id, prior_result);
        info!(run_id = %run_id, completed = self.completed_count(), "task completed");
        Ok(())
    }

    fn record_error(&self, err: &EngineError) {
        self.lock_state().error = Some(err.to_string());
    }

    /// Publish the run summary under the task's ID and the task-level
    /// result provider unless an action claimed that slot during the run.
    fn publish(
        &self,
        global: &GlobalContext,
        run_id: &str,
        prior: Option<Arc<dyn ResultProvider>>,
    ) {
        let (summary, provider) = {
            let state = self.lock_state();
            let summary = TaskRunSummary {
                task_id: self.id.clone(),
                run_id: run_id.to_string(),
                name: self.name.clone(),
                total_time_ms: state.total_duration.as_millis() as u64,
                completed_count: state.completed_count,
                success: state.error.is_none(),
                error: state.error.clone(),
            };
            let provider = StoredResult {
                result: state.result.clone(),
                error: state.error.clone(),
            };
            (summary, provider)
        };
        if let Ok(output) = serde_json::to_value(&summary) {
            global.set_task_output(&self.id, output);
        }
        global.publish_task_result_unless_claimed(&self.id, prior, Arc::new(provider));
    }
}
