//! Coordinator state persistence: versioned TLV records with pluggable backends.
//!
//! The whole Trust Center state (network parameters, device table with
//! nested source routes, application link keys) is serialized into a single
//! self-describing tag-length-value record. Backends only move the encoded
//! bytes around, so every backend exercises the same codec.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod tlv;

use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// A mandatory field is absent
    #[error("Missing mandatory field: {0}")]
    MissingField(&'static str),
    /// Invalid operation or value
    #[error("Invalid operation: {0}")]
    Invalid(String),
}

/// Singleton network parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParameters {
    /// Coordinator IEEE address
    pub eui64: u64,
    /// PAN identifier
    pub pan_id: u16,
    /// Extended PAN identifier
    pub extended_pan_id: u64,
    /// Radio channel
    pub channel: u8,
    /// NWK update identifier
    pub update_id: u8,
    /// Transmit power in dBm
    pub tx_power: i8,
    /// Active network key
    pub network_key: [u8; 16],
    /// Outgoing frame counter for the network key
    pub network_key_frame_counter: u32,
    /// Active network key sequence number
    pub network_key_sequence: u8,
    /// Trust Center link key
    pub tc_key: [u8; 16],
    /// Outgoing APS frame counter for the Trust Center link key
    pub tc_key_frame_counter: u32,
}

/// Persisted source route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRoute {
    /// Path cost
    pub path_cost: u8,
    /// Relays in route-record order
    pub relays: Vec<u16>,
    /// Last refresh, in stack milliseconds
    pub last_updated_ms: u64,
}

/// Persisted device table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDevice {
    /// IEEE address
    pub address64: u64,
    /// Short address
    pub address16: u16,
    /// MAC capability byte
    pub capabilities: u8,
    /// Completed key verification
    pub authorized: bool,
    /// Directly reachable
    pub neighbor: bool,
    /// Parent router of a device that joined through one
    pub parent16: Option<u16>,
    /// Last network key sequence delivered
    pub last_key_sequence: Option<u8>,
    /// Last accepted incoming NWK frame counter
    pub incoming_frame_counter: Option<u32>,
    /// Source routes to this device
    pub routes: Vec<PersistedRoute>,
}

/// Persisted application link key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedLinkKey {
    /// Smaller IEEE address of the pair
    pub device_a: u64,
    /// Larger IEEE address of the pair
    pub device_b: u64,
    /// Key material
    pub key: [u8; 16],
}

/// Complete persisted coordinator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState {
    /// Network parameters
    pub network: NetworkParameters,
    /// Device table
    pub devices: Vec<PersistedDevice>,
    /// Application link keys
    pub app_link_keys: Vec<PersistedLinkKey>,
}

/// Backend holding the coordinator state record
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state, or `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<PersistedState>, StorageError>;

    /// Replace the saved state
    async fn save(&self, state: &PersistedState) -> Result<(), StorageError>;
}

// Re-export backend implementations
pub use backend::file::FileStateStore;
pub use backend::mem::MemoryStateStore;
pub use tlv::{decode_state, encode_state, STATE_VERSION};
