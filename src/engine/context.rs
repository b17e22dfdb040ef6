//! Shared execution context: the cancellation token threaded through every
//! call and the lock-guarded registry of action/task outputs.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// Optional richer-result capability an action or task may expose alongside
/// its plain output mapping: a typed result plus a separately-stored error.
pub trait ResultProvider: Send + Sync {
    /// The result value, serialized. `None` when nothing was produced.
    fn result(&self) -> Option<Value>;

    /// The stored error, if the producer recorded one.
    fn error(&self) -> Option<String>;
}

/// Plain value-backed [`ResultProvider`], enough for most actions.
#[derive(Debug, Clone, Default)]
pub struct StoredResult {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ResultProvider for StoredResult {
    fn result(&self) -> Option<Value> {
        self.result.clone()
    }

    fn error(&self) -> Option<String> {
        self.error.clone()
    }
}

#[derive(Default)]
struct Registry {
    action_outputs: HashMap<String, Value>,
    action_results: HashMap<String, Arc<dyn ResultProvider>>,
    task_outputs: HashMap<String, Value>,
    task_results: HashMap<String, Arc<dyn ResultProvider>>,
}

/// Shared registry of action/task outputs and result providers.
///
/// Four independent mappings behind one reader/writer lock. The lock is held
/// only for the single map read or write, never across a resolution chain or
/// an action call. Cloning produces another handle to the same registry.
/// Writes for an existing key overwrite.
#[derive(Clone, Default)]
pub struct GlobalContext {
    inner: Arc<RwLock<Registry>>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    // Lock poisoning carries no meaning for a plain map registry; take the
    // guard either way.
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_action_output(&self, action_id: &str, output: Value) {
        self.write()
            .action_outputs
            .insert(action_id.to_string(), output);
    }

    pub fn action_output(&self, action_id: &str) -> Option<Value> {
        self.read().action_outputs.get(action_id).cloned()
    }

    pub fn set_action_result(&self, action_id: &str, provider: Arc<dyn ResultProvider>) {
        self.write()
            .action_results
            .insert(action_id.to_string(), provider);
    }

    pub fn action_result(&self, action_id: &str) -> Option<Arc<dyn ResultProvider>> {
        self.read().action_results.get(action_id).cloned()
    }

    pub fn set_task_output(&self, task_id: &str, output: Value) {
        self.write().task_outputs.insert(task_id.to_string(), output);
    }

    pub fn task_output(&self, task_id: &str) -> Option<Value> {
        self.read().task_outputs.get(task_id).cloned()
    }

    pub fn set_task_result(&self, task_id: &str, provider: Arc<dyn ResultProvider>) {
        self.write()
            .task_results
            .insert(task_id.to_string(), provider);
    }

    pub fn task_result(&self, task_id: &str) -> Option<Arc<dyn ResultProvider>> {
        self.read().task_results.get(task_id).cloned()
    }

    /// Store `provider` under `task_id` unless the slot changed since
    /// `prior` was observed, i.e. unless an action claimed it during the
    /// run. Returns whether the write happened.
    pub fn publish_task_result_unless_claimed(
        &self,
        task_id: &str,
        prior: Option<Arc<dyn ResultProvider>>,
        provider: Arc<dyn ResultProvider>,
    ) -> bool {
        let mut registry = self.write();
        let unchanged = match (registry.task_results.get(task_id), &prior) {
            (None, None) => true,
            (Some(current), Some(prior)) => Arc::ptr_eq(current, prior),
            _ => false,
        };
        if unchanged {
            registry.task_results.insert(task_id.to_string(), provider);
        }
        unchanged
    }

    /// Serialize the registry for post-mortem inspection. Result providers
    /// appear as `{"result": .., "error": ..}` objects.
    pub fn snapshot_json(&self) -> Value {
        let registry = self.read();
        let providers = |map: &HashMap<String, Arc<dyn ResultProvider>>| -> Value {
            let entries: Map<String, Value> = map
                .iter()
                .map(|(id, p)| {
                    (
                        id.clone(),
                        json!({"result": p.result(), "error": p.error()}),
                    )
                })
                .collect();
            Value::Object(entries)
        };
        json!({
            "action_outputs": registry.action_outputs,
            "action_results": providers(&registry.action_results),
            "task_outputs": registry.task_outputs,
            "task_results": providers(&registry.task_results),
        })
    }

    pub fn snapshot_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot_json()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl std::fmt::Debug for GlobalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.read();
        f.debug_struct("GlobalContext")
            .field("action_outputs", &registry.action_outputs.len())
            .field("action_results", &registry.action_results.len())
            .field("task_outputs", &registry.task_outputs.len())
            .field("task_results", &registry.task_results.len())
            .finish()
    }
}

/// Per-call execution context: a cancellation token plus an optional handle
/// to the shared registry. Cheap to clone; both halves are handles.
#[derive(Clone, Debug, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
    global: Option<GlobalContext>,
}

impl ExecContext {
    /// Fresh token, no registry attached yet.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            global: None,
        }
    }

    pub fn with_global(mut self, global: GlobalContext) -> Self {
        self.global = Some(global);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn global(&self) -> Option<&GlobalContext> {
        self.global.as_ref()
    }

    /// A context guaranteed to carry a registry, injecting an empty one if
    /// the incoming call had none. The token is shared with `self`.
    pub fn ensure_global(&self) -> ExecContext {
        match &self.global {
            Some(_) => self.clone(),
            None => ExecContext {
                cancel: self.cancel.clone(),
                global: Some(GlobalContext::new()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn writes_overwrite_per_key() {
        let ctx = GlobalContext::new();
        ctx.set_action_output("a", json!({"v": 1}));
        ctx.set_action_output("a", json!({"v": 2}));
        assert_eq!(ctx.action_output("a"), Some(json!({"v": 2})));
    }

    #[test]
    fn four_maps_are_independent() {
        let ctx = GlobalContext::new();
        ctx.set_action_output("x", json!(1));
        ctx.set_task_output("x", json!(2));
        assert_eq!(ctx.action_output("x"), Some(json!(1)));
        assert_eq!(ctx.task_output("x"), Some(json!(2)));
        assert!(ctx.action_result("x").is_none());
        assert!(ctx.task_result("x").is_none());
    }

    #[test]
    fn task_result_publication_skipped_when_claimed() {
        let ctx = GlobalContext::new();
        let prior = ctx.task_result("t");
        assert!(prior.is_none());

        // An action claims the task's slot mid-run.
        let claimed: Arc<dyn ResultProvider> = Arc::new(StoredResult {
            result: Some(json!("claimed")),
            error: None,
        });
        ctx.set_task_result("t", claimed);

        let own: Arc<dyn ResultProvider> = Arc::new(StoredResult {
            result: Some(json!("task")),
            error: None,
        });
        assert!(!ctx.publish_task_result_unless_claimed("t", prior, own));
        assert_eq!(
            ctx.task_result("t").and_then(|p| p.result()),
            Some(json!("claimed"))
        );
    }

    #[test]
    fn task_result_publication_overwrites_stale_entry() {
        let ctx = GlobalContext::new();
        let stale: Arc<dyn ResultProvider> = Arc::new(StoredResult::default());
        ctx.set_task_result("t", stale);

        // A later run observed the stale entry at start; nothing claimed the
        // slot since, so the run's own provider wins.
        let prior = ctx.task_result("t");
        let own: Arc<dyn ResultProvider> = Arc::new(StoredResult {
            result: Some(json!("fresh")),
            error: None,
        });
        assert!(ctx.publish_task_result_unless_claimed("t", prior, own));
        assert_eq!(
            ctx.task_result("t").and_then(|p| p.result()),
            Some(json!("fresh"))
        );
    }

    #[test]
    fn snapshot_includes_all_four_maps() {
        let ctx = GlobalContext::new();
        ctx.set_action_output("a", json!({"x": 10}));
        ctx.set_task_result(
            "t",
            Arc::new(StoredResult {
                result: Some(json!(7)),
                error: Some("late".to_string()),
            }),
        );
        let snap = ctx.snapshot_json();
        assert_eq!(snap["action_outputs"]["a"], json!({"x": 10}));
        assert_eq!(snap["task_results"]["t"], json!({"result": 7, "error": "late"}));
    }

    #[test]
    fn ensure_global_injects_once_and_shares_token() {
        let bare = ExecContext::new();
        assert!(bare.global().is_none());
        let filled = bare.ensure_global();
        assert!(filled.global().is_some());

        bare.cancellation().cancel();
        assert!(filled.is_cancelled(), "token must be shared");
    }
}
