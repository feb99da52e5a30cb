//! File-backed state store with atomic replacement

use crate::tlv::{decode_state, encode_state};
use crate::{PersistedState, StateStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Stores the state record in a single file.
///
/// Saves write a sibling temporary file, fsync it and rename it over the
/// previous record, so a crash mid-save leaves the old record intact.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a store at `path`, creating parent directories
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    /// Location of the record
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No saved state at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} bytes of state from {}", data.len(), self.path.display());
        decode_state(Bytes::from(data)).map(Some)
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        let encoded = encode_state(state)?;
        let temp_path = self.temp_path();

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!("Saved {} bytes of state to {}", encoded.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::tests::sample_state;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state").join("coordinator.tlv")).unwrap();
        assert!(store.load().await.unwrap().is_none());

        let mut state = sample_state();
        store.save(&state).await.unwrap();
        state.network.network_key_frame_counter += 1024;
        store.save(&state).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(state));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordinator.tlv");
        std::fs::write(&path, [0x01, 0x01, 0x01, 0xff]).unwrap();

        let store = FileStateStore::new(&path).unwrap();
        assert!(matches!(
            store.load().await,
            Err(StorageError::MissingField("eui64"))
        ));
    }
}
