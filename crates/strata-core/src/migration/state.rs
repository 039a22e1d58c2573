//! Per-record progress markers for crash recovery.
//!
//! A marker exists only while a record is between Pending and Applied: it is
//! written when the record enters Applying and removed in the transaction that
//! appends the record to the applied log. A marker left behind by a crash, or
//! written on failure, tells the next run where the record stopped.

use super::current_timestamp;
use crate::error::MigrationError;
use crate::record::MigrationId;
use rkyv::{Archive, Deserialize, Serialize};

/// Persisted status of an unfinished record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum MarkerStatus {
    /// Interpretation started and has not finished.
    Applying,
    /// An operation failed.
    Failed,
}

impl std::fmt::Display for MarkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerStatus::Applying => write!(f, "applying"),
            MarkerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress marker for one record.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct RecordState {
    /// Application label.
    pub app_label: String,
    /// Migration name.
    pub name: String,
    /// Current status.
    pub status: MarkerStatus,
    /// Index of the next operation to run; for Failed, the operation that failed.
    pub operation_index: usize,
    /// When interpretation started (microseconds since epoch).
    pub started_at: u64,
    /// Last update (microseconds since epoch).
    pub updated_at: u64,
    /// Error message if the record failed.
    pub error: Option<String>,
}

impl RecordState {
    /// A marker for a record entering Applying at `operation_index`.
    pub fn applying(id: &MigrationId, operation_index: usize) -> Self {
        let now = current_timestamp();
        Self {
            app_label: id.app_label.clone(),
            name: id.name.clone(),
            status: MarkerStatus::Applying,
            operation_index,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// The record's identity.
    pub fn id(&self) -> MigrationId {
        MigrationId::new(self.app_label.clone(), self.name.clone())
    }

    /// Record that the operation at `operation_index` committed.
    pub fn advance(&mut self) {
        self.operation_index += 1;
        self.updated_at = current_timestamp();
    }

    /// Mark the record as failed at `operation_index`.
    pub fn fail(&mut self, operation_index: usize, error: impl Into<String>) {
        self.status = MarkerStatus::Failed;
        self.operation_index = operation_index;
        self.updated_at = current_timestamp();
        self.error = Some(error.into());
    }

    /// Check if the record failed.
    pub fn is_failed(&self) -> bool {
        self.status == MarkerStatus::Failed
    }

    /// Serialize the state to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize state from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Store for record progress markers.
#[derive(Debug, Clone)]
pub struct RecordStateStore {
    tree: sled::Tree,
}

impl RecordStateStore {
    /// Tree name for record markers.
    pub const TREE_NAME: &'static str = "migration:state";

    /// Open or create the store.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Save a marker.
    pub fn save(&self, state: &RecordState) -> Result<(), MigrationError> {
        self.tree.insert(state.id().to_key(), state.to_bytes()?)?;
        Ok(())
    }

    /// Load a marker.
    pub fn load(&self, id: &MigrationId) -> Result<Option<RecordState>, MigrationError> {
        match self.tree.get(id.to_key())? {
            Some(bytes) => Ok(Some(RecordState::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a marker.
    pub fn delete(&self, id: &MigrationId) -> Result<(), MigrationError> {
        self.tree.remove(id.to_key())?;
        Ok(())
    }

    /// List all markers.
    pub fn list(&self) -> Result<Vec<RecordState>, MigrationError> {
        let mut states = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result?;
            states.push(RecordState::from_bytes(&value)?);
        }
        Ok(states)
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.tree.flush()?;
        Ok(())
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_lifecycle() {
        let id = MigrationId::new("gateway", "0002_auto");
        let mut state = RecordState::applying(&id, 0);
        assert_eq!(state.status, MarkerStatus::Applying);
        assert!(!state.is_failed());

        state.advance();
        state.advance();
        assert_eq!(state.operation_index, 2);

        state.fail(2, "field host does not exist");
        assert!(state.is_failed());
        assert_eq!(state.operation_index, 2);
        assert_eq!(state.error.as_deref(), Some("field host does not exist"));
        assert_eq!(state.id(), id);
    }

    #[test]
    fn test_store_roundtrip() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = RecordStateStore::open(&db).unwrap();
        let id = MigrationId::new("core", "0001_initial");

        assert!(store.load(&id).unwrap().is_none());

        let mut state = RecordState::applying(&id, 0);
        state.fail(1, "boom");
        store.save(&state).unwrap();

        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.list().unwrap().len(), 1);

        store.delete(&id).unwrap();
        assert!(store.load(&id).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }
}
