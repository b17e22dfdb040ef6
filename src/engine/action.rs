//! The action contract and the wrapper that gives any concrete action a
//! uniform identity, timing, and three-phase lifecycle.

use crate::engine::context::{ExecContext, ResultProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

/// A unit of work. Implementations are heterogeneous leaf operations
/// (filesystem calls, process launches, archive codecs); the engine only
/// sees this contract.
///
/// Each phase may fail independently; any error stops the lifecycle and is
/// returned to the task as-is. Use [`crate::PrerequisiteNotMet`] as the
/// error (or anywhere in its chain) to request a graceful task abort.
#[async_trait]
pub trait Action: Send + Sync {
    /// Pre-hook, run before the body.
    async fn before(&mut self, _ctx: &ExecContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The body.
    async fn execute(&mut self, ctx: &ExecContext) -> anyhow::Result<()>;

    /// Post-hook, run after the body succeeds.
    async fn after(&mut self, _ctx: &ExecContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Output to publish under this action's ID, conventionally a
    /// string-keyed mapping. `None` means nothing to publish.
    fn output(&self) -> Option<Value> {
        None
    }

    /// Optional richer-result capability. Checked once per execution, at
    /// snapshot time.
    fn result_provider(&self) -> Option<Arc<dyn ResultProvider>> {
        None
    }

    /// Extensible parameter-validation hook, run by the task before any
    /// action executes. Default: nothing to validate.
    fn validate(&self) -> crate::Result<()> {
        Ok(())
    }
}

struct WrapperState {
    id: String,
    name: String,
    run_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    output: Option<Value>,
    result: Option<Arc<dyn ResultProvider>>,
}

/// Uniform adapter around a concrete [`Action`]: identity, run IDs, timing,
/// and the three-phase execution drive.
///
/// Accessors read a small lock-guarded state block and are safe to call
/// from other tasks while an execution is in flight.
pub struct ActionWrapper {
    state: RwLock<WrapperState>,
    inner: tokio::sync::Mutex<Box<dyn Action>>,
}

impl ActionWrapper {
    /// Bind a concrete action to an ID and display name. A blank ID is
    /// derived from the name at first execution.
    pub fn new<I, N>(id: I, name: N, action: Box<dyn Action>) -> Self
    where
        I: Into<String>,
        N: Into<String>,
    {
        Self {
            state: RwLock::new(WrapperState {
                id: id.into(),
                name: name.into(),
                run_id: None,
                started_at: None,
                finished_at: None,
                output: None,
                result: None,
            }),
            inner: tokio::sync::Mutex::new(action),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, WrapperState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, WrapperState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run pre-hook, body, post-hook, stopping at the first failure. The
    /// error is returned as-is; classification is the task's job.
    ///
    /// If the incoming context carries no global registry, an empty one is
    /// injected so the action can run standalone. Start time is recorded
    /// just before the body, end time once it returns successfully; output
    /// and the result-provider capability are snapshotted between body and
    /// post-hook, so published output reflects state after the body
    /// regardless of the post-hook's outcome.
    pub async fn execute(&self, ctx: &ExecContext) -> anyhow::Result<()> {
        let ctx = ctx.ensure_global();
        let (action_id, run_id) = {
            let mut state = self.write();
            if state.id.is_empty() && !state.name.is_empty() {
                state.id = derive_id(&state.name);
            }
            let run_id = cuid2::create_id();
            state.run_id = Some(run_id.clone());
            state.started_at = None;
            state.finished_at = None;
            (state.id.clone(), run_id)
        };
        debug!(action_id = %action_id, run_id = %run_id, "executing action");

        let mut inner = self.inner.lock().await;
        inner.before(&ctx).await?;
        self.write().started_at = Some(Utc::now());
        inner.execute(&ctx).await?;
        {
            let mut state = self.write();
            state.finished_at = Some(Utc::now());
            state.output = inner.output();
            state.result = inner.result_provider();
        }
        inner.after(&ctx).await?;
        debug!(action_id = %action_id, run_id = %run_id, "action completed");
        Ok(())
    }

    /// Delegate the validation pass to the wrapped action.
    pub async fn validate(&self) -> crate::Result<()> {
        self.inner.lock().await.validate()
    }

    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    pub fn set_id<S: Into<String>>(&self, id: S) {
        self.write().id = id.into();
    }

    /// Display name, falling back to the ID when blank.
    pub fn name(&self) -> String {
        let state = self.read();
        if state.name.is_empty() {
            state.id.clone()
        } else {
            state.name.clone()
        }
    }

    /// Run identifier assigned by the most recent [`execute`](Self::execute).
    pub fn run_id(&self) -> Option<String> {
        self.read().run_id.clone()
    }

    /// Wall-clock duration of the most recent successful body, zero before
    /// the first completion.
    pub fn duration(&self) -> Duration {
        let state = self.read();
        match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.read().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.read().finished_at
    }

    /// Output snapshotted after the most recent body, `None` when the
    /// action had nothing to publish (or has not run yet).
    pub fn output(&self) -> Option<Value> {
        self.read().output.clone()
    }

    /// Result-provider capability snapshotted after the most recent body.
    pub fn result_provider(&self) -> Option<Arc<dyn ResultProvider>> {
        self.read().result.clone()
    }
}

/// Derive a lookup ID from a display name: lowercase, spaces and
/// underscores become hyphens.
fn derive_id(name: &str) -> String {
    name.to_lowercase().replace([' ', '_'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        phases: Vec<&'static str>,
        fail_on: Option<&'static str>,
        saw_global: bool,
    }

    #[async_trait]
    impl Action for Recorder {
        async fn before(&mut self, _ctx: &ExecContext) -> anyhow::Result<()> {
            self.phases.push("before");
            if self.fail_on == Some("before") {
                anyhow::bail!("before failed");
            }
            Ok(())
        }

        async fn execute(&mut self, ctx: &ExecContext) -> anyhow::Result<()> {
            self.phases.push("execute");
            self.saw_global = ctx.global().is_some();
            if self.fail_on == Some("execute") {
                anyhow::bail!("execute failed");
            }
            Ok(())
        }

        async fn after(&mut self, _ctx: &ExecContext) -> anyhow::Result<()> {
            self.phases.push("after");
            if self.fail_on == Some("after") {
                anyhow::bail!("after failed");
            }
            Ok(())
        }

        fn output(&self) -> Option<Value> {
            Some(json!({"phases": self.phases.len(), "saw_global": self.saw_global}))
        }
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let wrapper = ActionWrapper::new("rec", "Recorder", Box::new(Recorder::default()));
        wrapper.execute(&ExecContext::new()).await.unwrap();
        assert_eq!(
            wrapper.output(),
            Some(json!({"phases": 2, "saw_global": true}))
        );
        assert!(wrapper.run_id().is_some());
    }

    #[tokio::test]
    async fn first_failure_stops_the_lifecycle() {
        let wrapper = ActionWrapper::new(
            "rec",
            "",
            Box::new(Recorder {
                fail_on: Some("before"),
                ..Default::default()
            }),
        );
        let err = wrapper.execute(&ExecContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("before failed"));
        // Body never ran, so nothing was snapshotted.
        assert_eq!(wrapper.output(), None);
        assert_eq!(wrapper.duration(), Duration::ZERO);
    }

    #[tokio::test]
    async fn output_reflects_state_after_body_despite_post_hook_failure() {
        let wrapper = ActionWrapper::new(
            "rec",
            "",
            Box::new(Recorder {
                fail_on: Some("after"),
                ..Default::default()
            }),
        );
        let err = wrapper.execute(&ExecContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("after failed"));
        assert_eq!(
            wrapper.output(),
            Some(json!({"phases": 2, "saw_global": true}))
        );
        assert!(wrapper.finished_at().is_some());
    }

    #[tokio::test]
    async fn standalone_execution_gets_a_registry_injected() {
        let wrapper = ActionWrapper::new("rec", "", Box::new(Recorder::default()));
        wrapper.execute(&ExecContext::new()).await.unwrap();
        // The body observed a registry even though none was passed in.
        assert_eq!(wrapper.output().unwrap()["saw_global"], json!(true));
    }

    #[tokio::test]
    async fn blank_id_is_derived_from_the_name() {
        let wrapper = ActionWrapper::new("", "Copy System_Files", Box::new(Recorder::default()));
        assert_eq!(wrapper.id(), "");
        wrapper.execute(&ExecContext::new()).await.unwrap();
        assert_eq!(wrapper.id(), "copy-system-files");
    }

    #[tokio::test]
    async fn run_ids_are_fresh_per_execution() {
        let wrapper = ActionWrapper::new("rec", "", Box::new(Recorder::default()));
        wrapper.execute(&ExecContext::new()).await.unwrap();
        let first = wrapper.run_id().unwrap();
        wrapper.execute(&ExecContext::new()).await.unwrap();
        assert_ne!(first, wrapper.run_id().unwrap());
    }

    #[test]
    fn name_falls_back_to_id() {
        let wrapper = ActionWrapper::new("only-id", "", Box::new(Recorder::default()));
        assert_eq!(wrapper.name(), "only-id");
        let named = ActionWrapper::new("id", "Pretty Name", Box::new(Recorder::default()));
        assert_eq!(named.name(), "Pretty Name");
    }
}
