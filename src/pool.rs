// Worker pool: FIFO task queue, worker lifecycle, and message routing

use crate::config::PoolConfig;
use crate::context::Context;
use crate::installer::{install_manifest, InstallTracker};
use crate::messages::{
    generate_task_id, generate_worker_id, DependencyId, Manifest, PoolMessage, TaskId, WorkerId,
    WorkerMessage,
};
use crate::process::Process;
use crate::protocol::validate_worker_message;
use crate::registry::EntryPointRegistry;
use crate::worker::WorkerHandle;
use futures::Stream;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Errors
// ============================================================================

/// Errors reported synchronously by [`WorkerPool::schedule`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The request pinned a worker id the pool has never created or has
    /// already terminated
    #[error("unknown worker id: {0}")]
    UnknownWorker(WorkerId),
}

/// Terminal failure of one scheduled task
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The worker reported an error `Exit`; `result` carries its payload
    #[error("task {task_id} failed: {result}")]
    Failed { task_id: TaskId, result: Value },

    /// The task's channel closed before any `Exit` arrived, typically
    /// because the pool was terminated
    #[error("task {task_id} abandoned before completion")]
    Abandoned { task_id: TaskId },
}

pub type TaskResult = Result<Value, TaskError>;

// ============================================================================
// Scheduling surface
// ============================================================================

/// One task submission
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Human-readable title, used for tracing only
    pub title: String,
    /// Name of the registered entry point to run
    pub entry_point: String,
    /// Opaque argument payload forwarded to the entry point
    pub args: Value,
    /// When set, the task runs only on this worker
    pub target_worker: Option<WorkerId>,
}

impl TaskRequest {
    pub fn new(
        title: impl Into<String>,
        entry_point: impl Into<String>,
        args: Value,
    ) -> TaskRequest {
        TaskRequest {
            title: title.into(),
            entry_point: entry_point.into(),
            args,
            target_worker: None,
        }
    }

    /// Pin the task to one specific worker
    pub fn on_worker(mut self, worker_id: impl Into<WorkerId>) -> TaskRequest {
        self.target_worker = Some(worker_id.into());
        self
    }
}

/// Per-task message stream handed back by [`WorkerPool::schedule`].
///
/// Yields the task's messages in order: `Start`, any `Log`/`Data`, then one
/// terminal item, either the `Exit` message or a [`TaskError`].
pub struct TaskStream {
    task_id: TaskId,
    receiver: mpsc::UnboundedReceiver<Result<WorkerMessage, TaskError>>,
}

impl TaskStream {
    /// Id assigned to the scheduled task
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next message of the task, `None` once the stream is finished
    pub async fn recv(&mut self) -> Option<Result<WorkerMessage, TaskError>> {
        self.receiver.recv().await
    }

    /// Drain the stream and return the task's final result value
    pub async fn wait(mut self) -> TaskResult {
        while let Some(item) = self.recv().await {
            if let WorkerMessage::Exit { result, .. } = item? {
                return Ok(result);
            }
        }
        Err(TaskError::Abandoned {
            task_id: self.task_id,
        })
    }
}

impl Stream for TaskStream {
    type Item = Result<WorkerMessage, TaskError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct QueuedTask {
    task_id: TaskId,
    target_worker: Option<WorkerId>,
    entry_point: String,
    args: Value,
    sink: mpsc::UnboundedSender<WorkerMessage>,
}

struct RunningTask {
    worker_id: WorkerId,
    task_id: TaskId,
    sink: mpsc::UnboundedSender<WorkerMessage>,
}

struct WorkerReleased {
    worker_id: WorkerId,
    task_id: TaskId,
}

#[derive(Default)]
struct PoolState {
    /// Ready workers only; bootstrapping workers are counted in
    /// `pending_workers` until their dependencies are confirmed
    workers: HashMap<WorkerId, WorkerHandle>,
    pending_workers: usize,
    busy_workers: HashSet<WorkerId>,
    running_tasks: Vec<RunningTask>,
    tasks_queue: VecDeque<QueuedTask>,
    /// Everything imported so far, replayed into every new worker
    manifest: Manifest,
    installed: HashMap<WorkerId, HashSet<DependencyId>>,
    installs: HashMap<WorkerId, InstallTracker>,
    /// Ids of queued and running tasks, kept for uniqueness of fresh ids
    live_task_ids: HashSet<TaskId>,
    terminated: bool,
}

struct PoolInner {
    config: PoolConfig,
    registry: Arc<EntryPointRegistry>,
    state: Mutex<PoolState>,
    released: mpsc::UnboundedSender<WorkerReleased>,
    /// Context receiving worker output not attributable to any task
    background: Context,
}

/// Pool of isolated workers executing registered entry points.
///
/// Tasks are queued FIFO; an idle worker is reused before a new one is
/// created, and the worker count never exceeds the configured pool size.
/// Each worker runs its tasks strictly one at a time.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    coordinator: JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, registry: Arc<EntryPointRegistry>) -> WorkerPool {
        let (released_tx, mut released_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            registry,
            state: Mutex::new(PoolState::default()),
            released: released_tx,
            background: Context::new("background management"),
        });

        // Release coordination: whenever a worker finishes a task, offer it
        // the next eligible queued task
        let coordinator = tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(event) = released_rx.recv().await {
                    debug!(
                        worker_id = %event.worker_id,
                        task_id = %event.task_id,
                        "worker released"
                    );
                    {
                        let mut state = lock(&inner.state);
                        state.busy_workers.remove(&event.worker_id);
                        state.running_tasks.retain(|task| task.task_id != event.task_id);
                        state.live_task_ids.remove(&event.task_id);
                    }
                    inner.pick_task(&event.worker_id, &inner.background);
                }
            }
        });

        WorkerPool { inner, coordinator }
    }

    /// Pool with the default configuration
    pub fn with_registry(registry: Arc<EntryPointRegistry>) -> WorkerPool {
        WorkerPool::new(PoolConfig::default(), registry)
    }

    /// Configured upper bound on live workers
    pub fn pool_size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Submit a task.
    ///
    /// Returns the task's message stream immediately; actual execution may
    /// be deferred behind queued tasks. Scheduling against an unknown
    /// worker id fails synchronously.
    pub fn schedule(&self, request: TaskRequest, context: &Context) -> Result<TaskStream, PoolError> {
        let inner = self.inner.clone();
        let outer = context.clone();
        context.with_child("schedule task", move |ctx| {
            inner.schedule_in(request, ctx, &outer)
        })
    }

    /// Merge a manifest into the pool.
    ///
    /// New workers replay the merged manifest during bootstrap; workers
    /// already live receive the delta right away, without blocking the
    /// caller on their confirmations.
    pub fn import(&self, manifest: Manifest) {
        let mut state = lock(&self.inner.state);
        for handle in state.workers.values() {
            if let Err(error) = install_manifest(handle, &manifest) {
                warn!(worker_id = %handle.id(), %error, "manifest push failed");
            }
        }
        info!(
            scripts = manifest.script_count(),
            live_workers = state.workers.len(),
            "manifest imported"
        );
        state.manifest.extend(manifest);
    }

    /// Tear down every live worker.
    ///
    /// Irreversible for the current workers: running tasks are abandoned
    /// mid-flight and queued tasks are dropped without ever starting.
    pub fn terminate(&self) {
        let mut state = lock(&self.inner.state);
        info!(
            workers = state.workers.len(),
            queued = state.tasks_queue.len(),
            "terminating pool"
        );
        state.terminated = true;
        for (_, handle) in state.workers.drain() {
            handle.terminate();
        }
        state.busy_workers.clear();
        state.running_tasks.clear();
        state.tasks_queue.clear();
        state.installs.clear();
        state.installed.clear();
        state.live_task_ids.clear();
    }

    // ===== Diagnostics =====

    /// Ids of all ready workers
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let state = lock(&self.inner.state);
        let mut ids: Vec<WorkerId> = state.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of workers currently executing a task
    pub fn busy_workers(&self) -> Vec<WorkerId> {
        let state = lock(&self.inner.state);
        let mut ids: Vec<WorkerId> = state.busy_workers.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// `(worker_id, task_id)` pairs of the tasks in flight
    pub fn running_tasks(&self) -> Vec<(WorkerId, TaskId)> {
        let state = lock(&self.inner.state);
        state
            .running_tasks
            .iter()
            .map(|task| (task.worker_id.clone(), task.task_id.clone()))
            .collect()
    }

    /// Number of tasks waiting in the queue
    pub fn queued_tasks(&self) -> usize {
        lock(&self.inner.state).tasks_queue.len()
    }

    /// Dependency ids a worker has confirmed so far
    pub fn installed_dependencies(&self, worker_id: &str) -> Vec<DependencyId> {
        let state = lock(&self.inner.state);
        let mut ids: Vec<DependencyId> = state
            .installed
            .get(worker_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.coordinator.abort();
    }
}

// ============================================================================
// Scheduling internals
// ============================================================================

impl PoolInner {
    fn schedule_in(
        self: Arc<PoolInner>,
        request: TaskRequest,
        ctx: &Context,
        outer: &Context,
    ) -> Result<TaskStream, PoolError> {
        let task_id = self.fresh_task_id();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let process = Process::new(task_id.clone(), request.title.clone(), ctx.clone());
        process.schedule();
        let stream = instrument_channel(task_id.clone(), raw_rx, process, outer.clone());

        let mut state = lock(&self.state);

        if let Some(target) = request.target_worker.clone() {
            if !state.workers.contains_key(&target) {
                state.live_task_ids.remove(&task_id);
                return Err(PoolError::UnknownWorker(target));
            }
            ctx.info(
                format!("task pinned to worker {}", target),
                None,
            );
            state.tasks_queue.push_back(QueuedTask {
                task_id,
                target_worker: Some(target.clone()),
                entry_point: request.entry_point,
                args: request.args,
                sink: raw_tx,
            });
            let idle = !state.busy_workers.contains(&target);
            drop(state);
            if idle {
                self.pick_task(&target, ctx);
            }
            return Ok(stream);
        }

        let queued = QueuedTask {
            task_id,
            target_worker: None,
            entry_point: request.entry_point,
            args: request.args,
            sink: raw_tx,
        };

        let idle_worker = state
            .workers
            .keys()
            .find(|id| !state.busy_workers.contains(*id))
            .cloned();
        if let Some(worker_id) = idle_worker {
            ctx.info(format!("return idle worker {}", worker_id), None);
            state.tasks_queue.push_back(queued);
            drop(state);
            self.pick_task(&worker_id, ctx);
            return Ok(stream);
        }

        if state.workers.len() + state.pending_workers < self.config.pool_size {
            state.pending_workers += 1;
            state.tasks_queue.push_back(queued);
            drop(state);
            let this = self.clone();
            let create_ctx = ctx.start_child("create worker");
            tokio::spawn(async move { this.create_worker(create_ctx).await });
            return Ok(stream);
        }

        ctx.info("pool saturated, task queued", None);
        state.tasks_queue.push_back(queued);
        Ok(stream)
    }

    /// Offer the first eligible queued task to the given worker.
    ///
    /// A task is eligible when it carries no affinity or is pinned to this
    /// worker; the queue keeps FIFO order among eligible tasks. No-op when
    /// the worker is busy, gone, or the queue holds nothing for it.
    fn pick_task(&self, worker_id: &str, context: &Context) {
        let _: Result<(), Infallible> = context.with_child("pick task", |ctx| {
            let mut state = lock(&self.state);
            if state.busy_workers.contains(worker_id) || !state.workers.contains_key(worker_id) {
                return Ok(());
            }
            let position = state.tasks_queue.iter().position(|task| {
                task.target_worker
                    .as_deref()
                    .map_or(true, |target| target == worker_id)
            });
            let Some(position) = position else {
                debug!(worker_id, "no eligible queued task");
                return Ok(());
            };
            // VecDeque::remove keeps the order of the remaining entries
            let Some(task) = state.tasks_queue.remove(position) else {
                return Ok(());
            };
            ctx.info(
                format!("picked task {} for worker {}", task.task_id, worker_id),
                None,
            );
            state.busy_workers.insert(worker_id.to_string());
            state.running_tasks.push(RunningTask {
                worker_id: worker_id.to_string(),
                task_id: task.task_id.clone(),
                sink: task.sink,
            });
            let message =
                PoolMessage::execute(task.task_id, worker_id, task.args, task.entry_point);
            if let Some(handle) = state.workers.get(worker_id) {
                if let Err(error) = handle.post(message) {
                    warn!(worker_id, %error, "failed to dispatch task");
                }
            }
            Ok(())
        });
    }

    /// Bootstrap one worker: spawn it, replay the manifest, wait until every
    /// script confirmed, then publish it to the worker table and offer it a
    /// queued task.
    async fn create_worker(self: Arc<PoolInner>, ctx: Context) {
        let (worker_id, manifest, handle, ready) = {
            let mut state = lock(&self.state);
            let worker_id = self.fresh_worker_id(&state);
            ctx.info(
                format!("create worker {}", worker_id),
                Some(json!({
                    "requiredDependencies": state
                        .manifest
                        .scripts
                        .iter()
                        .map(|script| script.id.clone())
                        .collect::<Vec<_>>(),
                })),
            );
            let (mut handle, outbound) = WorkerHandle::spawn(worker_id.clone(), self.registry.clone());
            handle.set_router(tokio::spawn(route_worker(
                self.clone(),
                worker_id.clone(),
                outbound,
            )));
            let (tracker, ready) = InstallTracker::new(state.manifest.script_count());
            state.installs.insert(worker_id.clone(), tracker);
            state.installed.entry(worker_id.clone()).or_default();
            (worker_id, state.manifest.clone(), handle, ready)
        };

        if let Err(error) = install_manifest(&handle, &manifest) {
            warn!(worker_id = %worker_id, %error, "failed to post manifest");
        }
        if manifest.script_count() == 0 {
            ctx.info("no dependencies to load: worker ready", None);
        }
        // Resolves immediately for an empty manifest; otherwise once the
        // router has counted every distinct confirmation
        let _ = ready.await;

        {
            let mut state = lock(&self.state);
            state.installs.remove(&worker_id);
            state.pending_workers = state.pending_workers.saturating_sub(1);
            if state.terminated {
                handle.terminate();
                ctx.end();
                return;
            }
            state.workers.insert(worker_id.clone(), handle);
        }
        ctx.info(format!("worker {} ready", worker_id), None);
        ctx.end();
        self.pick_task(&worker_id, &ctx);
    }

    fn fresh_task_id(&self) -> TaskId {
        let mut state = lock(&self.state);
        loop {
            let id = generate_task_id();
            if state.live_task_ids.insert(id.clone()) {
                return id;
            }
        }
    }

    fn fresh_worker_id(&self, state: &PoolState) -> WorkerId {
        loop {
            let id = generate_worker_id();
            if !state.workers.contains_key(&id) && !state.installs.contains_key(&id) {
                return id;
            }
        }
    }
}

// ============================================================================
// Routing and instrumentation
// ============================================================================

/// Demultiplex one worker's outbound stream.
///
/// Install confirmations feed the worker's tracker; task messages are
/// forwarded to the owning task's channel, with `Exit` additionally
/// releasing the worker; logs without a task id go to the background
/// context.
async fn route_worker(
    inner: Arc<PoolInner>,
    worker_id: WorkerId,
    mut outbound: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(error) = validate_worker_message(&message) {
            warn!(worker_id = %worker_id, %error, "dropping invalid worker message");
            continue;
        }
        match &message {
            WorkerMessage::DependencyInstalled { id } => {
                let mut state = lock(&inner.state);
                state
                    .installed
                    .entry(worker_id.clone())
                    .or_default()
                    .insert(id.clone());
                if let Some(tracker) = state.installs.get_mut(&worker_id) {
                    if tracker.confirm(id) {
                        debug!(worker_id = %worker_id, "all dependencies installed");
                    }
                }
            }
            _ => match message.task_id() {
                Some(task_id) => {
                    let task_id = task_id.to_string();
                    let is_exit = message.is_exit();
                    let sink = {
                        let state = lock(&inner.state);
                        state
                            .running_tasks
                            .iter()
                            .find(|task| {
                                task.worker_id == worker_id && task.task_id == task_id
                            })
                            .map(|task| task.sink.clone())
                    };
                    match sink {
                        Some(sink) => {
                            let _ = sink.send(message);
                            if is_exit {
                                let _ = inner.released.send(WorkerReleased {
                                    worker_id: worker_id.clone(),
                                    task_id,
                                });
                            }
                        }
                        None => {
                            debug!(worker_id = %worker_id, task_id = %task_id, "message for unknown task")
                        }
                    }
                }
                None => {
                    if let WorkerMessage::Log { text, json, .. } = &message {
                        inner.background.info(text.clone(), json.clone());
                    }
                }
            },
        }
    }
    debug!(worker_id = %worker_id, "worker router stopped");
}

/// Turn a task's raw message channel into its public stream, recording
/// lifecycle transitions on the process and logs on the caller's context
/// along the way.
fn instrument_channel(
    task_id: TaskId,
    mut raw: mpsc::UnboundedReceiver<WorkerMessage>,
    process: Process,
    context: Context,
) -> TaskStream {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let stream_task_id = task_id.clone();
    tokio::spawn(async move {
        while let Some(message) = raw.recv().await {
            match &message {
                WorkerMessage::Start { .. } => {
                    context.info("worker started", None);
                    process.start();
                    let _ = out_tx.send(Ok(message));
                }
                WorkerMessage::Log { text, json, .. } => {
                    process.log(text);
                    context.info(text.clone(), json.clone());
                    let _ = out_tx.send(Ok(message));
                }
                WorkerMessage::Data { .. } => {
                    let _ = out_tx.send(Ok(message));
                }
                WorkerMessage::Exit { error, result, .. } => {
                    if *error {
                        process.fail(result);
                        let _ = out_tx.send(Err(TaskError::Failed {
                            task_id: task_id.clone(),
                            result: result.clone(),
                        }));
                    } else {
                        context.info("worker exited normally", Some(result.clone()));
                        process.succeed();
                        let _ = out_tx.send(Ok(message));
                    }
                    break;
                }
                WorkerMessage::DependencyInstalled { .. } => {}
            }
        }
    });
    TaskStream {
        task_id: stream_task_id,
        receiver: out_rx,
    }
}

/// Lock helper recovering from poisoning; pool state stays usable even if
/// a holder panicked
fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntryPointArguments, TaskOutcome};

    fn small_pool() -> WorkerPool {
        let mut registry = EntryPointRegistry::new();
        registry.register_entry_point("literal", |input: EntryPointArguments| {
            Ok(TaskOutcome::Value(input.args))
        });
        WorkerPool::new(PoolConfig::with_pool_size(2), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_unknown_worker_rejected_synchronously() {
        let pool = small_pool();
        let context = Context::new("test");
        let request = TaskRequest::new("pinned", "literal", json!(1)).on_worker("w999999");
        match pool.schedule(request, &context) {
            Err(PoolError::UnknownWorker(id)) => assert_eq!(id, "w999999"),
            Ok(_) => panic!("expected UnknownWorker"),
        }
        // Nothing was queued and no worker was created
        assert_eq!(pool.queued_tasks(), 0);
        assert!(pool.worker_ids().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_pool_is_empty() {
        let pool = small_pool();
        assert!(pool.worker_ids().is_empty());
        assert!(pool.busy_workers().is_empty());
        assert!(pool.running_tasks().is_empty());
        assert_eq!(pool.queued_tasks(), 0);
        assert_eq!(pool.pool_size(), 2);
    }

    #[tokio::test]
    async fn test_schedule_runs_task_to_completion() {
        let pool = small_pool();
        let context = Context::new("test");
        let stream = pool
            .schedule(TaskRequest::new("compute", "literal", json!(7)), &context)
            .unwrap();
        assert_eq!(stream.wait().await.unwrap(), json!(7));
        pool.terminate();
    }
}
