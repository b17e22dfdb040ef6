//! Taskflow - a sequential task-execution engine with cross-action data flow.
//!
//! Tasks are ordered lists of heterogeneous actions. Every action runs under
//! a shared cancellation token and publishes its output into a shared,
//! dynamically-typed registry, so later actions (or later task runs under
//! the same manager) can consume it through [`Parameter`] references.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// The orchestration engine: actions, parameters, tasks, manager
pub mod engine;

// Re-exports for convenience
pub use crate::core::errors::{is_prerequisite_not_met, EngineError, PrerequisiteNotMet, Result};
pub use engine::*;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Formats a greeting from a parameter that references an earlier
    /// action's output.
    struct Greet {
        who: Parameter,
        greeting: Option<Value>,
    }

    #[async_trait]
    impl Action for Greet {
        async fn execute(&mut self, ctx: &ExecContext) -> anyhow::Result<()> {
            let who = param::resolve_string(Some(&self.who), ctx)?;
            self.greeting = Some(json!({ "text": format!("hello, {who}") }));
            Ok(())
        }

        fn output(&self) -> Option<Value> {
            self.greeting.clone()
        }
    }

    struct Announce;

    #[async_trait]
    impl Action for Announce {
        async fn execute(&mut self, _ctx: &ExecContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn output(&self) -> Option<Value> {
            Some(json!({ "name": "world" }))
        }
    }

    #[tokio::test]
    async fn manager_wires_actions_through_the_shared_registry() {
        let manager = TaskManager::new();

        let task = Task::new("greeting", "Greeting pipeline")
            .with_action(ActionWrapper::new("announce", "", Box::new(Announce)))
            .with_action(ActionWrapper::new(
                "greet",
                "",
                Box::new(Greet {
                    who: Parameter::action_output("announce", Some("name")),
                    greeting: None,
                }),
            ));
        manager.add_task(task).unwrap();
        manager.run_task("greeting").unwrap();
        manager
            .wait_for_all_tasks_to_complete(Duration::from_secs(5))
            .await
            .unwrap();

        let global = manager.get_global_context();
        assert_eq!(
            global.action_output("greet"),
            Some(json!({"text": "hello, world"}))
        );
        let summary = global.task_output("greeting").unwrap();
        assert_eq!(summary["success"], json!(true));
        assert_eq!(summary["completed_count"], json!(2));

        // A later task under the same manager can reference the first one.
        let follow_up = Parameter::task_output("greeting", Some("success"));
        let ctx = ExecContext::new().with_global(global);
        assert_eq!(follow_up.resolve(&ctx).unwrap(), json!(true));
    }
}
