// Registry of named entry points, shared functions, and script hooks
//
// Behavior never crosses the worker boundary as source text: both sides of
// the protocol hold the same registry and reference hooks by name. Execute
// and install messages therefore carry registry ids, and a worker resolves
// them against its own copy at dispatch time.

use crate::context::LogLevel;
use crate::messages::{ScriptSource, TaskId, WorkerId, WorkerMessage};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// Errors
// ============================================================================

/// Failure of an entry computation, carried as the `Exit` error payload
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EntryPointError {
    pub message: String,
    pub detail: Option<Value>,
}

impl EntryPointError {
    /// Create an error with a message only
    pub fn new(message: impl Into<String>) -> Self {
        EntryPointError {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a structured detail payload
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// The JSON payload placed in `Exit.result` for a failed task
    pub fn to_payload(&self) -> Value {
        match &self.detail {
            Some(detail) => json!({ "message": self.message, "detail": detail }),
            None => Value::String(self.message.clone()),
        }
    }
}

/// Failure of a script installation hook
#[derive(Debug, Error)]
pub enum InstallError {
    /// A message referenced a hook name the registry does not know
    #[error("unknown {kind} hook: {name}")]
    UnknownHook { kind: &'static str, name: String },

    /// The hook itself failed
    #[error("script {id} failed to install: {reason}")]
    ScriptFailed { id: String, reason: String },
}

// ============================================================================
// Task outcomes
// ============================================================================

/// Result of an entry computation: either an immediate value, or a pending
/// one the worker dispatcher awaits before emitting `Exit`.
pub enum TaskOutcome {
    Value(Value),
    Pending(BoxFuture<'static, Result<Value, EntryPointError>>),
}

impl TaskOutcome {
    /// Wrap a future as a pending outcome
    pub fn pending<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<Value, EntryPointError>> + Send + 'static,
    {
        TaskOutcome::Pending(Box::pin(future))
    }
}

// ============================================================================
// Worker scope
// ============================================================================

/// The explicit per-worker environment: everything the manifest installed.
///
/// Entry points receive a handle to this scope instead of reaching into
/// ambient global state.
#[derive(Default)]
pub struct WorkerScope {
    /// Installed named values
    pub variables: HashMap<String, Value>,
    /// Installed named functions, resolved from the registry
    pub functions: HashMap<String, Arc<dyn SharedFunction>>,
    /// Installed script sources, keyed by dependency id
    pub scripts: HashMap<String, String>,
}

impl WorkerScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an installed variable
    pub fn variable(&self, id: &str) -> Option<&Value> {
        self.variables.get(id)
    }

    /// Look up an installed function
    pub fn function(&self, id: &str) -> Option<Arc<dyn SharedFunction>> {
        self.functions.get(id).cloned()
    }

    /// Call an installed function, or fail if it was never installed
    pub fn call_function(&self, id: &str, args: &Value) -> Result<Value, EntryPointError> {
        match self.functions.get(id) {
            Some(function) => Ok(function.call(args)),
            None => Err(EntryPointError::new(format!(
                "function '{}' is not installed in this worker",
                id
            ))),
        }
    }

    /// Look up an installed script source
    pub fn script(&self, id: &str) -> Option<&str> {
        self.scripts.get(id).map(String::as_str)
    }
}

/// Shared handle to a worker's scope
pub type ScopeHandle = Arc<Mutex<WorkerScope>>;

/// Lock a scope handle, recovering from poisoning
pub(crate) fn lock_scope(scope: &ScopeHandle) -> std::sync::MutexGuard<'_, WorkerScope> {
    scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// In-worker context
// ============================================================================

/// Handle given to an entry computation to emit `Log` and `Data` messages
/// attributed to the current task.
#[derive(Clone)]
pub struct WorkerContext {
    task_id: TaskId,
    worker_id: WorkerId,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerContext {
    pub(crate) fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        outbound: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        WorkerContext {
            task_id,
            worker_id,
            outbound,
        }
    }

    /// The task this context reports for
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Emit a `Log` message for the current task
    pub fn info(&self, text: impl Into<String>, json: Option<Value>) {
        let _ = self.outbound.send(WorkerMessage::log(
            self.task_id.clone(),
            self.worker_id.clone(),
            LogLevel::Info,
            text,
            json,
        ));
    }

    /// Emit a freeform `Data` message for the current task
    pub fn send_data(&self, payload: Map<String, Value>) {
        let _ = self.outbound.send(WorkerMessage::data(
            self.task_id.clone(),
            self.worker_id.clone(),
            payload,
        ));
    }
}

/// Everything an entry computation receives
pub struct EntryPointArguments {
    /// Argument payload from the `Execute` message
    pub args: Value,
    /// Id of the task being executed
    pub task_id: TaskId,
    /// Handle for emitting `Log`/`Data` messages
    pub context: WorkerContext,
    /// The worker's installed environment
    pub scope: ScopeHandle,
}

// ============================================================================
// Hook traits
// ============================================================================

/// A named entry computation both sides reference by id
pub trait EntryPoint: Send + Sync {
    fn run(&self, input: EntryPointArguments) -> Result<TaskOutcome, EntryPointError>;
}

impl<F> EntryPoint for F
where
    F: Fn(EntryPointArguments) -> Result<TaskOutcome, EntryPointError> + Send + Sync,
{
    fn run(&self, input: EntryPointArguments) -> Result<TaskOutcome, EntryPointError> {
        self(input)
    }
}

/// A named function installable into worker scopes
pub trait SharedFunction: Send + Sync {
    fn call(&self, args: &Value) -> Value;
}

impl<F> SharedFunction for F
where
    F: Fn(&Value) -> Value + Send + Sync,
{
    fn call(&self, args: &Value) -> Value {
        self(args)
    }
}

/// Custom import hook for an installable script
pub trait ScriptImport: Send + Sync {
    fn install(&self, scope: &mut WorkerScope, script: &ScriptSource) -> Result<(), InstallError>;
}

impl<F> ScriptImport for F
where
    F: Fn(&mut WorkerScope, &ScriptSource) -> Result<(), InstallError> + Send + Sync,
{
    fn install(&self, scope: &mut WorkerScope, script: &ScriptSource) -> Result<(), InstallError> {
        self(scope, script)
    }
}

/// Asynchronous side-effect run after a script's import completes.
///
/// The worker confirms the dependency only once the returned future resolves.
pub trait ScriptSideEffect: Send + Sync {
    fn run(&self, scope: ScopeHandle) -> BoxFuture<'static, Result<(), InstallError>>;
}

impl<F> ScriptSideEffect for F
where
    F: Fn(ScopeHandle) -> BoxFuture<'static, Result<(), InstallError>> + Send + Sync,
{
    fn run(&self, scope: ScopeHandle) -> BoxFuture<'static, Result<(), InstallError>> {
        self(scope)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of all hooks a pool and its workers may reference by name
#[derive(Default)]
pub struct EntryPointRegistry {
    entry_points: HashMap<String, Arc<dyn EntryPoint>>,
    functions: HashMap<String, Arc<dyn SharedFunction>>,
    imports: HashMap<String, Arc<dyn ScriptImport>>,
    side_effects: HashMap<String, Arc<dyn ScriptSideEffect>>,
}

impl EntryPointRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry computation under a name
    pub fn register_entry_point(
        &mut self,
        name: impl Into<String>,
        entry_point: impl EntryPoint + 'static,
    ) {
        self.entry_points.insert(name.into(), Arc::new(entry_point));
    }

    /// Register a shared function under a name
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        function: impl SharedFunction + 'static,
    ) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Register a script import hook under a name
    pub fn register_import(&mut self, name: impl Into<String>, hook: impl ScriptImport + 'static) {
        self.imports.insert(name.into(), Arc::new(hook));
    }

    /// Register a script side-effect hook under a name
    pub fn register_side_effect(
        &mut self,
        name: impl Into<String>,
        hook: impl ScriptSideEffect + 'static,
    ) {
        self.side_effects.insert(name.into(), Arc::new(hook));
    }

    /// Look up an entry computation
    pub fn entry_point(&self, name: &str) -> Option<Arc<dyn EntryPoint>> {
        self.entry_points.get(name).cloned()
    }

    /// Look up a shared function
    pub fn function(&self, name: &str) -> Option<Arc<dyn SharedFunction>> {
        self.functions.get(name).cloned()
    }

    /// Look up a script import hook
    pub fn import_hook(&self, name: &str) -> Option<Arc<dyn ScriptImport>> {
        self.imports.get(name).cloned()
    }

    /// Look up a script side-effect hook
    pub fn side_effect(&self, name: &str) -> Option<Arc<dyn ScriptSideEffect>> {
        self.side_effects.get(name).cloned()
    }
}
