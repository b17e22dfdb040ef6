use thiserror::Error;

/// Unified error type for the taskflow engine.
///
/// Every engine-originated failure names the task ID, run ID, and offending
/// action ID where they exist, so errors are traceable without a debugger.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Parameter lookup failed: missing entity, missing field, wrong shape,
    /// or wrong type. Never a panic, always descriptive.
    #[error("parameter resolution failed: {message}")]
    Resolution { message: String },

    /// An action's hook or body returned an error the engine does not
    /// recognize as a graceful abort. Stops the task, no retry.
    #[error("task '{task_id}' (run {run_id}) failed at action '{action_id}'")]
    ActionFailed {
        task_id: String,
        run_id: String,
        action_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// An action signaled [`PrerequisiteNotMet`]: the task stopped
    /// gracefully instead of failing.
    #[error("task '{task_id}' (run {run_id}) aborted at action '{action_id}': prerequisite not met")]
    TaskAborted {
        task_id: String,
        run_id: String,
        action_id: String,
    },

    /// The cancellation token fired before or during the run.
    #[error("task '{task_id}' (run {run_id}) was cancelled")]
    Cancelled { task_id: String, run_id: String },

    /// Manager lookup for an unregistered task ID.
    #[error("task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    /// Stop requested for a task with no live cancellation handle.
    #[error("task '{task_id}' is not running")]
    TaskNotRunning { task_id: String },

    /// A task that cannot be registered (for example, an empty ID).
    #[error("invalid task: {message}")]
    InvalidTask { message: String },

    /// `wait_for_all_tasks_to_complete` gave up. Does not cancel anything.
    #[error("timed out after {waited_ms}ms waiting for tasks to complete: {outstanding} still running")]
    WaitTimeout { outstanding: usize, waited_ms: u64 },
}

impl EngineError {
    pub fn resolution<S: Into<String>>(message: S) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    pub fn invalid_task<S: Into<String>>(message: S) -> Self {
        Self::InvalidTask {
            message: message.into(),
        }
    }
}

/// Sentinel error an action returns to stop its task gracefully.
///
/// Classification is by identity (downcast), never by message text, so
/// wrapping it in `anyhow::Context` does not break detection as long as the
/// sentinel stays in the chain.
#[derive(Debug, Error)]
#[error("prerequisite not met")]
pub struct PrerequisiteNotMet;

/// True when `err` carries the [`PrerequisiteNotMet`] sentinel anywhere in
/// its chain.
pub fn is_prerequisite_not_met(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<PrerequisiteNotMet>().is_some())
}

/// Result type alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn sentinel_detected_by_identity() {
        let err = anyhow::Error::new(PrerequisiteNotMet);
        assert!(is_prerequisite_not_met(&err));

        let plain = anyhow::anyhow!("prerequisite not met");
        assert!(
            !is_prerequisite_not_met(&plain),
            "message text alone must not classify as the sentinel"
        );
    }

    #[test]
    fn sentinel_survives_context_wrapping() {
        let err = anyhow::Error::new(PrerequisiteNotMet).context("checking mount point");
        assert!(is_prerequisite_not_met(&err));
    }

    #[test]
    fn errors_name_the_offenders() {
        let err = EngineError::ActionFailed {
            task_id: "deploy".into(),
            run_id: "r1".into(),
            action_id: "copy-files".into(),
            source: anyhow::anyhow!("disk full"),
        };
        let text = err.to_string();
        assert!(text.contains("deploy"));
        assert!(text.contains("r1"));
        assert!(text.contains("copy-files"));
    }
}
