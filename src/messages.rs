// Message protocol: tagged envelopes exchanged between the pool and its workers

use crate::context::LogLevel;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Id of a worker (e.g. `w123456`)
pub type WorkerId = String;

/// Id of a task (e.g. `t654321`)
pub type TaskId = String;

/// Id of an installable dependency
pub type DependencyId = String;

/// Generate a fresh worker id. Uniqueness against live workers is enforced
/// by the pool, which re-draws on collision.
pub fn generate_worker_id() -> WorkerId {
    format!("w{}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Generate a fresh task id
pub fn generate_task_id() -> TaskId {
    format!("t{}", rand::thread_rng().gen_range(0..1_000_000))
}

// ============================================================================
// Manifest payloads
// ============================================================================

/// A named value installed into every worker's scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerVariable {
    pub id: String,
    pub value: Value,
}

/// A named shared function, referenced by its registry name.
///
/// `target` names an entry in the pool's registry; both sides resolve it to
/// the same statically compiled callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFunctionRef {
    pub id: String,
    pub target: String,
}

/// An installable script with optional custom import / side-effect hooks.
///
/// `import` and `side_effects` name registry hooks; when `import` is absent
/// the worker records the source in its scope as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSource {
    pub id: DependencyId,
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,
}

/// The shared state every worker must hold before accepting tasks.
///
/// Manifests accumulate over a pool's lifetime; the full accumulated manifest
/// is replayed into every newly created worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub variables: Vec<WorkerVariable>,
    pub functions: Vec<WorkerFunctionRef>,
    pub scripts: Vec<ScriptSource>,
}

impl Manifest {
    /// Manifest with no entries at all
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.functions.is_empty() && self.scripts.is_empty()
    }

    /// Number of installable scripts, i.e. expected install confirmations
    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    /// Append another manifest's entries, preserving registration order
    pub fn extend(&mut self, other: Manifest) {
        self.variables.extend(other.variables);
        self.functions.extend(other.functions);
        self.scripts.extend(other.scripts);
    }
}

// ============================================================================
// Message types (pool -> worker)
// ============================================================================

/// Messages sent from the pool coordinator to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PoolMessage {
    /// Run a registered entry point against an argument payload
    #[serde(rename_all = "camelCase")]
    Execute {
        task_id: TaskId,
        worker_id: WorkerId,
        args: Value,
        entry_point: String,
    },

    /// Assign named values into the worker scope (no acknowledgement)
    #[serde(rename = "installVariables")]
    InstallVariables(Vec<WorkerVariable>),

    /// Resolve named functions into the worker scope (no acknowledgement)
    #[serde(rename = "installFunctions")]
    InstallFunctions(Vec<WorkerFunctionRef>),

    /// Install one script; confirmed by `DependencyInstalled` once its
    /// side-effect completes
    #[serde(rename = "installScript")]
    InstallScript(ScriptSource),
}

impl PoolMessage {
    /// Create a new Execute message
    pub fn execute(
        task_id: impl Into<TaskId>,
        worker_id: impl Into<WorkerId>,
        args: Value,
        entry_point: impl Into<String>,
    ) -> Self {
        PoolMessage::Execute {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            args,
            entry_point: entry_point.into(),
        }
    }
}

// ============================================================================
// Message types (worker -> pool)
// ============================================================================

/// Messages sent from a worker back to the pool coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkerMessage {
    /// The worker started executing a task
    #[serde(rename_all = "camelCase")]
    Start { task_id: TaskId, worker_id: WorkerId },

    /// A log line emitted during execution or installation.
    ///
    /// Install-time logs are not caused by a task and carry no task id.
    #[serde(rename_all = "camelCase")]
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<WorkerId>,
        log_level: LogLevel,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json: Option<Value>,
    },

    /// A freeform intermediate data record emitted by the entry point
    #[serde(rename_all = "camelCase")]
    Data {
        task_id: TaskId,
        worker_id: WorkerId,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// Terminal message of a task: its result, or its error payload
    #[serde(rename_all = "camelCase")]
    Exit {
        task_id: TaskId,
        worker_id: WorkerId,
        error: bool,
        result: Value,
    },

    /// One installable script finished installing
    DependencyInstalled { id: DependencyId },
}

impl WorkerMessage {
    /// Create a new Start message
    pub fn start(task_id: impl Into<TaskId>, worker_id: impl Into<WorkerId>) -> Self {
        WorkerMessage::Start {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Create a new task-scoped Log message
    pub fn log(
        task_id: impl Into<TaskId>,
        worker_id: impl Into<WorkerId>,
        log_level: LogLevel,
        text: impl Into<String>,
        json: Option<Value>,
    ) -> Self {
        WorkerMessage::Log {
            task_id: Some(task_id.into()),
            worker_id: Some(worker_id.into()),
            log_level,
            text: text.into(),
            json,
        }
    }

    /// Create an install-time Log message (no task attribution)
    pub fn install_log(log_level: LogLevel, text: impl Into<String>) -> Self {
        WorkerMessage::Log {
            task_id: None,
            worker_id: None,
            log_level,
            text: text.into(),
            json: None,
        }
    }

    /// Create a new Data message
    pub fn data(
        task_id: impl Into<TaskId>,
        worker_id: impl Into<WorkerId>,
        payload: Map<String, Value>,
    ) -> Self {
        WorkerMessage::Data {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            payload,
        }
    }

    /// Create a successful Exit message
    pub fn exit_ok(
        task_id: impl Into<TaskId>,
        worker_id: impl Into<WorkerId>,
        result: Value,
    ) -> Self {
        WorkerMessage::Exit {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            error: false,
            result,
        }
    }

    /// Create a failed Exit message carrying the error payload
    pub fn exit_error(
        task_id: impl Into<TaskId>,
        worker_id: impl Into<WorkerId>,
        result: Value,
    ) -> Self {
        WorkerMessage::Exit {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            error: true,
            result,
        }
    }

    /// Create a new DependencyInstalled message
    pub fn dependency_installed(id: impl Into<DependencyId>) -> Self {
        WorkerMessage::DependencyInstalled { id: id.into() }
    }

    /// The task id this message belongs to, if it is task-scoped
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::Start { task_id, .. } => Some(task_id),
            WorkerMessage::Log { task_id, .. } => task_id.as_deref(),
            WorkerMessage::Data { task_id, .. } => Some(task_id),
            WorkerMessage::Exit { task_id, .. } => Some(task_id),
            WorkerMessage::DependencyInstalled { .. } => None,
        }
    }

    /// The worker id that produced this message, when present
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::Start { worker_id, .. } => Some(worker_id),
            WorkerMessage::Log { worker_id, .. } => worker_id.as_deref(),
            WorkerMessage::Data { worker_id, .. } => Some(worker_id),
            WorkerMessage::Exit { worker_id, .. } => Some(worker_id),
            WorkerMessage::DependencyInstalled { .. } => None,
        }
    }

    /// Whether this is the terminal message of a task channel
    pub fn is_exit(&self) -> bool {
        matches!(self, WorkerMessage::Exit { .. })
    }
}
