// Per-task observability handle recording lifecycle transitions

use crate::context::Context;
use serde_json::Value;
use tracing::{info, warn};

/// Observes one task from scheduling to its terminal transition.
///
/// Every transition is traced, and a failure is also recorded as an error
/// log on the task's context so the whole ancestor chain reports `Failed`.
pub struct Process {
    task_id: String,
    title: String,
    context: Context,
}

impl Process {
    /// Create a process attached to the given context
    pub fn new(task_id: impl Into<String>, title: impl Into<String>, context: Context) -> Self {
        Process {
            task_id: task_id.into(),
            title: title.into(),
            context,
        }
    }

    /// Id of the observed task
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Title of the observed task
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The task has been accepted into the queue
    pub fn schedule(&self) {
        info!(task_id = %self.task_id, title = %self.title, "schedule task");
    }

    /// The worker reported `Start`
    pub fn start(&self) {
        info!(task_id = %self.task_id, title = %self.title, "start task");
    }

    /// The task completed successfully
    pub fn succeed(&self) {
        info!(task_id = %self.task_id, title = %self.title, "task succeeded");
    }

    /// The task failed with the given error payload
    pub fn fail(&self, error: &Value) {
        warn!(task_id = %self.task_id, title = %self.title, %error, "task failed");
        self.context.error(
            format!("task '{}' failed", self.title),
            Some(error.clone()),
        );
    }

    /// A log line was produced by the running task
    pub fn log(&self, text: &str) {
        info!(task_id = %self.task_id, title = %self.title, text, "task log");
    }
}
