// Hierarchical execution contexts: span tracking and log broadcasting

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lock a mutex, recovering the inner value if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Logs
// ============================================================================

/// Severity of a [`LogEntry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// A single log element attached to a [`Context`]
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Unique id of the entry
    pub id: Uuid,
    /// Severity
    pub level: LogLevel,
    /// Description of the log
    pub text: String,
    /// Optional structured payload
    pub data: Option<Value>,
    /// Creation instant
    pub timestamp: Instant,
}

impl LogEntry {
    fn new(level: LogLevel, text: impl Into<String>, data: Option<Value>) -> Self {
        LogEntry {
            id: Uuid::new_v4(),
            level,
            text: text.into(),
            data,
            timestamp: Instant::now(),
        }
    }

    /// Elapsed time between `from` and this entry's creation
    pub fn elapsed_since(&self, from: Instant) -> Duration {
        self.timestamp.saturating_duration_since(from)
    }
}

/// Broadcasts selected logs to a set of consumers.
///
/// Each channel carries a filter deciding which logs it accepts and an
/// optional map applied before emission.
pub struct LogChannel {
    filter: Box<dyn Fn(&LogEntry) -> bool + Send + Sync>,
    map: Option<Box<dyn Fn(&LogEntry) -> LogEntry + Send + Sync>>,
    pipes: Vec<mpsc::UnboundedSender<LogEntry>>,
}

impl LogChannel {
    /// Create a channel forwarding logs accepted by `filter` to `pipes`
    pub fn new(
        filter: impl Fn(&LogEntry) -> bool + Send + Sync + 'static,
        pipes: Vec<mpsc::UnboundedSender<LogEntry>>,
    ) -> Self {
        LogChannel {
            filter: Box::new(filter),
            map: None,
            pipes,
        }
    }

    /// Apply `map` to accepted logs before emission
    pub fn with_map(mut self, map: impl Fn(&LogEntry) -> LogEntry + Send + Sync + 'static) -> Self {
        self.map = Some(Box::new(map));
        self
    }

    /// Dispatch `log` to every pipe if the filter accepts it
    pub fn dispatch(&self, log: &LogEntry) {
        if !(self.filter)(log) {
            return;
        }
        for pipe in &self.pipes {
            let entry = match &self.map {
                Some(map) => map(log),
                None => log.clone(),
            };
            // A closed consumer is not an error for the producer
            let _ = pipe.send(entry);
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Status of a [`Context`], derived from its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// Not ended yet and no error recorded anywhere below
    Running,
    /// Ended without any error below
    Success,
    /// An error log exists somewhere in the subtree
    Failed,
}

enum ContextChild {
    Context(Context),
    Log(LogEntry),
}

struct ContextInner {
    title: String,
    id: Uuid,
    start: Instant,
    end: Mutex<Option<Instant>>,
    user_context: HashMap<String, Value>,
    children: Mutex<Vec<ContextChild>>,
    channels: Arc<Vec<LogChannel>>,
    parent: Option<Weak<ContextInner>>,
}

/// A node in the execution-tracking tree.
///
/// A context records nested operations (child contexts) and log entries, and
/// conveys a user-defined key/value bag inherited copy-on-branch from its
/// parent. Cloning a `Context` yields another handle to the same node.
///
/// Synchronous spans should use [`Context::with_child`], which ends the child
/// automatically; asynchronous spans use [`Context::start_child`] and call
/// [`Context::end`] explicitly.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a root context with an empty user context and no channels
    pub fn new(title: impl Into<String>) -> Self {
        Context::root(title, HashMap::new(), Vec::new())
    }

    /// Create a root context with an initial user context and broadcast channels
    pub fn root(
        title: impl Into<String>,
        user_context: HashMap<String, Value>,
        channels: Vec<LogChannel>,
    ) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                title: title.into(),
                id: Uuid::new_v4(),
                start: Instant::now(),
                end: Mutex::new(None),
                user_context,
                children: Mutex::new(Vec::new()),
                channels: Arc::new(channels),
                parent: None,
            }),
        }
    }

    /// Title of this context
    pub fn title(&self) -> &str {
        &self.inner.title
    }

    /// Unique id of this context
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Look up an entry of the user context
    pub fn user_value(&self, key: &str) -> Option<Value> {
        self.inner.user_context.get(key).cloned()
    }

    /// Whether [`Context::end`] has been called
    pub fn has_ended(&self) -> bool {
        lock(&self.inner.end).is_some()
    }

    /// Start a child context, for asynchronous scenarios.
    ///
    /// The caller is responsible for calling [`Context::end`] on the child.
    pub fn start_child(&self, title: impl Into<String>) -> Context {
        self.start_child_with(title, HashMap::new())
    }

    /// Start a child context with extra user-context entries.
    ///
    /// The child's user context is this context's user context shallow-merged
    /// with `extra`.
    pub fn start_child_with(
        &self,
        title: impl Into<String>,
        extra: HashMap<String, Value>,
    ) -> Context {
        let mut user_context = self.inner.user_context.clone();
        user_context.extend(extra);
        let child = Context {
            inner: Arc::new(ContextInner {
                title: title.into(),
                id: Uuid::new_v4(),
                start: Instant::now(),
                end: Mutex::new(None),
                user_context,
                children: Mutex::new(Vec::new()),
                channels: self.inner.channels.clone(),
                parent: Some(Arc::downgrade(&self.inner)),
            }),
        };
        lock(&self.inner.children).push(ContextChild::Context(child.clone()));
        child
    }

    /// Run `f` inside a child context, for synchronous scenarios.
    ///
    /// On `Ok` the child is ended and the value returned. On `Err` an error
    /// log is recorded on the child, the child is ended, and the error
    /// propagates to the caller.
    pub fn with_child<T, E>(
        &self,
        title: impl Into<String>,
        f: impl FnOnce(&Context) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: fmt::Display,
    {
        self.with_child_with(title, HashMap::new(), f)
    }

    /// [`Context::with_child`] with extra user-context entries
    pub fn with_child_with<T, E>(
        &self,
        title: impl Into<String>,
        extra: HashMap<String, Value>,
        f: impl FnOnce(&Context) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: fmt::Display,
    {
        let child = self.start_child_with(title, extra);
        match f(&child) {
            Ok(value) => {
                child.end();
                Ok(value)
            }
            Err(error) => {
                child.error(error.to_string(), None);
                child.end();
                Err(error)
            }
        }
    }

    /// Record an info log
    pub fn info(&self, text: impl Into<String>, data: Option<Value>) {
        self.add_log(LogLevel::Info, text, data);
    }

    /// Record a warning log
    pub fn warning(&self, text: impl Into<String>, data: Option<Value>) {
        self.add_log(LogLevel::Warning, text, data);
    }

    /// Record an error log
    pub fn error(&self, text: impl Into<String>, data: Option<Value>) {
        self.add_log(LogLevel::Error, text, data);
    }

    /// Root of the context tree
    pub fn root_context(&self) -> Context {
        let mut current = self.inner.clone();
        while let Some(parent) = current
            .parent
            .as_ref()
            .and_then(|parent| parent.upgrade())
        {
            current = parent;
        }
        Context { inner: current }
    }

    /// End this context, when created with [`Context::start_child`]
    pub fn end(&self) {
        *lock(&self.inner.end) = Some(Instant::now());
    }

    /// End this context and every ancestor up to the root
    pub fn terminate(&self) {
        self.end();
        if let Some(parent) = self
            .inner
            .parent
            .as_ref()
            .and_then(|parent| parent.upgrade())
        {
            Context { inner: parent }.terminate();
        }
    }

    /// Elapsed time of this context.
    ///
    /// If the context has ended, this is its true duration. Otherwise it is
    /// the maximum recursive elapsed time among its children: an estimate for
    /// a still-running context, `None` when no child has progressed yet.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed_since(self.inner.start)
    }

    /// [`Context::elapsed`] measured from an arbitrary reference instant
    pub fn elapsed_since(&self, from: Instant) -> Option<Duration> {
        if let Some(end) = *lock(&self.inner.end) {
            return Some(end.saturating_duration_since(from));
        }
        lock(&self.inner.children)
            .iter()
            .filter_map(|child| match child {
                ContextChild::Context(ctx) => ctx.elapsed_since(from),
                ContextChild::Log(log) => Some(log.elapsed_since(from)),
            })
            .max()
    }

    /// Status derived from the subtree: [`ContextStatus::Failed`] as soon as
    /// any descendant error log exists, otherwise success/running depending
    /// on whether this context has ended.
    pub fn status(&self) -> ContextStatus {
        if self.has_error() {
            return ContextStatus::Failed;
        }
        if self.has_ended() {
            return ContextStatus::Success;
        }
        ContextStatus::Running
    }

    fn has_error(&self) -> bool {
        lock(&self.inner.children).iter().any(|child| match child {
            ContextChild::Log(log) => log.level == LogLevel::Error,
            ContextChild::Context(ctx) => ctx.has_error(),
        })
    }

    fn add_log(&self, level: LogLevel, text: impl Into<String>, data: Option<Value>) {
        let entry = LogEntry::new(level, text, data);
        for channel in self.inner.channels.iter() {
            channel.dispatch(&entry);
        }
        lock(&self.inner.children).push(ContextChild::Log(entry));
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("title", &self.inner.title)
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_context_is_merged_copy_on_branch() {
        let mut root_values = HashMap::new();
        root_values.insert("project".to_string(), json!("demo"));
        let root = Context::root("root", root_values, Vec::new());

        let mut extra = HashMap::new();
        extra.insert("step".to_string(), json!(1));
        let child = root.start_child_with("child", extra);

        assert_eq!(child.user_value("project"), Some(json!("demo")));
        assert_eq!(child.user_value("step"), Some(json!(1)));
        // The parent's bag is untouched
        assert_eq!(root.user_value("step"), None);
    }

    #[test]
    fn test_with_child_ends_child_and_returns_value() {
        let root = Context::new("root");
        let result: Result<u32, std::io::Error> = root.with_child("sync step", |ctx| {
            ctx.info("working", None);
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(root.status(), ContextStatus::Running);
    }

    #[test]
    fn test_with_child_records_error_and_propagates() {
        let root = Context::new("root");
        let result: Result<(), String> =
            root.with_child("failing step", |_ctx| Err("boom".to_string()));
        assert_eq!(result.unwrap_err(), "boom");
        // The error recorded on the child marks the whole ancestor chain
        assert_eq!(root.status(), ContextStatus::Failed);
    }

    #[test]
    fn test_status_success_after_end() {
        let root = Context::new("root");
        let child = root.start_child("async step");
        assert_eq!(child.status(), ContextStatus::Running);
        child.end();
        assert_eq!(child.status(), ContextStatus::Success);
    }

    #[test]
    fn test_elapsed_of_running_context_is_estimated_from_children() {
        let root = Context::new("root");
        assert_eq!(root.elapsed(), None);

        let child = root.start_child("step");
        child.end();
        // The root is still running: its elapsed is the child's progress
        let estimate = root.elapsed().unwrap();

        root.end();
        // The true duration can only grow past the estimate
        assert!(root.elapsed().unwrap() >= estimate);
    }

    #[test]
    fn test_elapsed_uses_log_timestamps() {
        let root = Context::new("root");
        root.info("progress", None);
        assert!(root.elapsed().is_some());
    }

    #[test]
    fn test_terminate_ends_ancestors() {
        let root = Context::new("root");
        let child = root.start_child("child");
        let grandchild = child.start_child("grandchild");
        grandchild.terminate();
        assert!(root.has_ended());
        assert!(child.has_ended());
        assert!(grandchild.has_ended());
    }

    #[test]
    fn test_root_returns_tree_root() {
        let root = Context::new("root");
        let grandchild = root.start_child("child").start_child("grandchild");
        assert_eq!(grandchild.root_context().id(), root.id());
    }

    #[tokio::test]
    async fn test_channels_receive_filtered_logs() {
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        let channels = vec![
            LogChannel::new(|log| log.level == LogLevel::Error, vec![errors_tx]),
            LogChannel::new(|_| true, vec![all_tx]),
        ];
        let root = Context::root("root", HashMap::new(), channels);
        let child = root.start_child("child");

        child.info("hello", Some(json!({"k": 1})));
        child.error("broken", None);

        let first = errors_rx.recv().await.unwrap();
        assert_eq!(first.level, LogLevel::Error);
        assert_eq!(first.text, "broken");
        assert!(errors_rx.try_recv().is_err());

        assert_eq!(all_rx.recv().await.unwrap().text, "hello");
        assert_eq!(all_rx.recv().await.unwrap().text, "broken");
    }
}
