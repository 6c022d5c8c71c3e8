// Wire serialization and validation for the pool <-> worker protocol

use crate::messages::{PoolMessage, WorkerMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum serialized message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Message exceeds maximum allowed size
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Message validation failed
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The worker behind a handle has been terminated
    #[error("Worker channel closed")]
    ChannelClosed,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Serialize a message to JSON bytes, enforcing the size ceiling
pub fn serialize_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(json)
}

/// Deserialize a message from JSON bytes
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> ProtocolResult<T> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Validate a pool message before posting it to a worker
pub fn validate_pool_message(message: &PoolMessage) -> ProtocolResult<()> {
    match message {
        PoolMessage::Execute {
            task_id,
            worker_id,
            entry_point,
            ..
        } => {
            if task_id.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "taskId cannot be empty in Execute message".to_string(),
                ));
            }
            if worker_id.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "workerId cannot be empty in Execute message".to_string(),
                ));
            }
            if entry_point.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "entryPoint cannot be empty in Execute message".to_string(),
                ));
            }
        }
        PoolMessage::InstallScript(script) => {
            if script.id.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "id cannot be empty in installScript message".to_string(),
                ));
            }
        }
        PoolMessage::InstallVariables(variables) => {
            if variables.iter().any(|variable| variable.id.is_empty()) {
                return Err(ProtocolError::ValidationError(
                    "variable ids cannot be empty in installVariables message".to_string(),
                ));
            }
        }
        PoolMessage::InstallFunctions(functions) => {
            if functions
                .iter()
                .any(|function| function.id.is_empty() || function.target.is_empty())
            {
                return Err(ProtocolError::ValidationError(
                    "function ids and targets cannot be empty in installFunctions message"
                        .to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Validate a worker message before routing it
pub fn validate_worker_message(message: &WorkerMessage) -> ProtocolResult<()> {
    match message {
        WorkerMessage::DependencyInstalled { id } => {
            if id.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "id cannot be empty in DependencyInstalled message".to_string(),
                ));
            }
        }
        WorkerMessage::Log { .. } => {
            // Install-time logs legitimately carry no task attribution
        }
        _ => {
            if message.task_id().map(str::is_empty).unwrap_or(true) {
                return Err(ProtocolError::ValidationError(format!(
                    "taskId cannot be empty in {:?} message",
                    message
                )));
            }
            if message.worker_id().map(str::is_empty).unwrap_or(true) {
                return Err(ProtocolError::ValidationError(format!(
                    "workerId cannot be empty in {:?} message",
                    message
                )));
            }
        }
    }
    Ok(())
}
