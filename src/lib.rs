// Core library modules for scriptpool

pub mod config;
pub mod context;
pub mod installer;
pub mod messages;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod worker;

pub use config::PoolConfig;
pub use context::{Context, ContextStatus, LogLevel};
pub use messages::{Manifest, PoolMessage, ScriptSource, WorkerMessage};
pub use pool::{PoolError, TaskError, TaskRequest, TaskStream, WorkerPool};
pub use registry::{EntryPointArguments, EntryPointRegistry, TaskOutcome, WorkerScope};
