// Worker handle: owns one isolated execution unit and its message dispatcher

use crate::context::LogLevel;
use crate::messages::{PoolMessage, ScriptSource, WorkerId, WorkerMessage};
use crate::protocol::{validate_pool_message, ProtocolError, ProtocolResult};
use crate::registry::{
    lock_scope, EntryPointArguments, EntryPointRegistry, ScopeHandle, TaskOutcome, WorkerContext,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to one spawned worker.
///
/// The handle owns the worker's lifetime: `post` feeds its inbound channel,
/// `terminate` aborts it irreversibly. The pool removes terminated handles
/// from its worker table; a terminated handle must not be posted to again.
pub struct WorkerHandle {
    id: WorkerId,
    inbound: mpsc::UnboundedSender<PoolMessage>,
    dispatcher: JoinHandle<()>,
    router: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a fresh worker running the dispatcher loop.
    ///
    /// Returns the handle plus the raw stream of messages the worker emits;
    /// the caller is expected to route that stream.
    pub fn spawn(
        id: impl Into<WorkerId>,
        registry: Arc<EntryPointRegistry>,
    ) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerMessage>) {
        let id = id.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_worker(id.clone(), registry, inbound_rx, outbound_tx));
        (
            WorkerHandle {
                id,
                inbound: inbound_tx,
                dispatcher,
                router: None,
            },
            outbound_rx,
        )
    }

    /// Id of the worker behind this handle
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Post a message to the worker
    pub fn post(&self, message: PoolMessage) -> ProtocolResult<()> {
        validate_pool_message(&message)?;
        self.inbound
            .send(message)
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Attach the routing task draining this worker's outbound stream, so
    /// `terminate` tears it down together with the dispatcher
    pub(crate) fn set_router(&mut self, router: JoinHandle<()>) {
        self.router = Some(router);
    }

    /// Tear the worker down. Irreversible: any in-flight task is abandoned
    /// and its channel never receives `Exit`.
    pub fn terminate(&self) {
        self.dispatcher.abort();
        if let Some(router) = &self.router {
            router.abort();
        }
    }
}

// ============================================================================
// In-worker dispatcher
// ============================================================================

/// Top-level message loop of one worker.
///
/// Messages are handled strictly in order, which serializes task execution
/// on a worker; only script side-effects are spawned off so that install
/// confirmations may complete in any order.
async fn run_worker(
    worker_id: WorkerId,
    registry: Arc<EntryPointRegistry>,
    mut inbound: mpsc::UnboundedReceiver<PoolMessage>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
) {
    let scope = ScopeHandle::default();
    while let Some(message) = inbound.recv().await {
        match message {
            PoolMessage::Execute {
                task_id,
                args,
                entry_point,
                ..
            } => {
                execute(&worker_id, &registry, &scope, &outbound, task_id, args, entry_point)
                    .await;
            }
            PoolMessage::InstallVariables(variables) => {
                let mut scope = lock_scope(&scope);
                for variable in variables {
                    scope.variables.insert(variable.id, variable.value);
                }
            }
            PoolMessage::InstallFunctions(functions) => {
                for function in functions {
                    match registry.function(&function.target) {
                        Some(callable) => {
                            lock_scope(&scope).functions.insert(function.id, callable);
                        }
                        None => {
                            let _ = outbound.send(WorkerMessage::install_log(
                                LogLevel::Error,
                                format!(
                                    "unknown function target '{}' for '{}'",
                                    function.target, function.id
                                ),
                            ));
                        }
                    }
                }
            }
            PoolMessage::InstallScript(script) => {
                install_script(&registry, &scope, &outbound, script);
            }
        }
    }
    debug!(worker_id = %worker_id, "worker dispatcher stopped");
}

/// Run one entry computation: `Start`, then the computation (awaiting a
/// pending outcome), then exactly one `Exit`.
async fn execute(
    worker_id: &str,
    registry: &EntryPointRegistry,
    scope: &ScopeHandle,
    outbound: &mpsc::UnboundedSender<WorkerMessage>,
    task_id: String,
    args: Value,
    entry_point: String,
) {
    let _ = outbound.send(WorkerMessage::start(task_id.clone(), worker_id));

    let entry = match registry.entry_point(&entry_point) {
        Some(entry) => entry,
        None => {
            let _ = outbound.send(WorkerMessage::exit_error(
                task_id,
                worker_id,
                Value::String(format!("unknown entry point '{}'", entry_point)),
            ));
            return;
        }
    };

    let input = EntryPointArguments {
        args,
        task_id: task_id.clone(),
        context: WorkerContext::new(task_id.clone(), worker_id.to_string(), outbound.clone()),
        scope: scope.clone(),
    };

    let exit = match entry.run(input) {
        Ok(TaskOutcome::Value(result)) => WorkerMessage::exit_ok(task_id, worker_id, result),
        Ok(TaskOutcome::Pending(future)) => match future.await {
            Ok(result) => WorkerMessage::exit_ok(task_id, worker_id, result),
            Err(error) => WorkerMessage::exit_error(task_id, worker_id, error.to_payload()),
        },
        Err(error) => WorkerMessage::exit_error(task_id, worker_id, error.to_payload()),
    };
    let _ = outbound.send(exit);
}

/// Install one script into the scope and arrange for its confirmation.
///
/// A failed or unknown hook logs an error and never confirms: the worker
/// stays unready by contract, there is no retry and no timeout.
fn install_script(
    registry: &EntryPointRegistry,
    scope: &ScopeHandle,
    outbound: &mpsc::UnboundedSender<WorkerMessage>,
    script: ScriptSource,
) {
    match &script.import {
        None => {
            let _ = outbound.send(WorkerMessage::install_log(
                LogLevel::Info,
                format!("Installing {} using default import", script.id),
            ));
            lock_scope(scope)
                .scripts
                .insert(script.id.clone(), script.src.clone());
        }
        Some(name) => match registry.import_hook(name) {
            Some(hook) => {
                let _ = outbound.send(WorkerMessage::install_log(
                    LogLevel::Info,
                    format!("Installing {} using import hook '{}'", script.id, name),
                ));
                let result = hook.install(&mut lock_scope(scope), &script);
                if let Err(error) = result {
                    let _ = outbound
                        .send(WorkerMessage::install_log(LogLevel::Error, error.to_string()));
                    return;
                }
            }
            None => {
                let _ = outbound.send(WorkerMessage::install_log(
                    LogLevel::Error,
                    format!("unknown import hook '{}' for script '{}'", name, script.id),
                ));
                return;
            }
        },
    }

    match &script.side_effects {
        None => {
            let _ = outbound.send(WorkerMessage::dependency_installed(script.id));
        }
        Some(name) => match registry.side_effect(name) {
            Some(hook) => {
                let future = hook.run(scope.clone());
                let outbound = outbound.clone();
                let id = script.id.clone();
                tokio::spawn(async move {
                    match future.await {
                        Ok(()) => {
                            let _ = outbound.send(WorkerMessage::dependency_installed(id));
                        }
                        Err(error) => {
                            let _ = outbound
                                .send(WorkerMessage::install_log(LogLevel::Error, error.to_string()));
                        }
                    }
                });
            }
            None => {
                let _ = outbound.send(WorkerMessage::install_log(
                    LogLevel::Error,
                    format!(
                        "unknown side-effect hook '{}' for script '{}'",
                        name, script.id
                    ),
                ));
            }
        },
    }
}
