//! Error types for the protocol engine

use crate::transport::TransportError;
use thiserror::Error;
use zb_routing::RoutingError;
use zb_storage::StorageError;
use zb_wire::WireError;

/// Errors surfaced by stack operations.
///
/// Expected protocol conditions (denied joins, duplicates, replays, missing
/// routes) are not errors; they are logged and reported through status
/// values instead.
#[derive(Error, Debug)]
pub enum StackError {
    /// Frame could not be decoded or secured
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// Radio transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// Routing lookup failure
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    /// No device with this IEEE address
    #[error("Unknown device {0:016x}")]
    UnknownDevice(u64),
    /// Invalid caller-supplied parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Payload cannot be sent in one frame and cannot be fragmented
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    /// The stack task is gone
    #[error("Stack is not running")]
    NotRunning,
}

impl StackError {
    /// Whether the engine must stop: the radio link or the store is broken
    pub fn is_fatal(&self) -> bool {
        match self {
            StackError::Transport(e) => !e.is_delivery_failure(),
            StackError::Storage(_) | StackError::NotRunning => true,
            _ => false,
        }
    }
}

/// Result alias for stack operations
pub type StackResult<T> = Result<T, StackError>;
