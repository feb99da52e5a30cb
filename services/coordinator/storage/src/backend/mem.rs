//! In-memory state store for development and testing

use crate::tlv::{decode_state, encode_state};
use crate::{PersistedState, StateStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Keeps the encoded record in memory so loads go through the real codec
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    record: Mutex<Option<Bytes>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Raw encoded record, if any
    pub fn raw(&self) -> Option<Bytes> {
        self.record.lock().ok().and_then(|record| record.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        let record = self
            .record
            .lock()
            .map_err(|_| StorageError::Invalid("state lock poisoned".to_string()))?
            .clone();
        record.map(decode_state).transpose()
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        let encoded = encode_state(state)?;
        debug!("Memory state save ({} bytes)", encoded.len());
        *self
            .record
            .lock()
            .map_err(|_| StorageError::Invalid("state lock poisoned".to_string()))? = Some(encoded);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
