//! The applied-migration log.
//!
//! An append-only set of applied records keyed by identity. The engine only
//! ever inserts into it, inside the same transaction that persists the schema
//! snapshot, so an entry exists exactly when its record's effects do.

use super::current_timestamp;
use crate::error::MigrationError;
use crate::record::MigrationId;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// One applied record.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct AppliedEntry {
    /// Application label.
    pub app_label: String,
    /// Migration name.
    pub name: String,
    /// When the record was applied (microseconds since epoch).
    pub applied_at: u64,
    /// Checksum of the record at application time.
    pub checksum: String,
    /// Recorded without running its operations.
    pub faked: bool,
}

impl AppliedEntry {
    /// Create an entry stamped with the current time.
    pub fn new(id: &MigrationId, checksum: impl Into<String>, faked: bool) -> Self {
        Self {
            app_label: id.app_label.clone(),
            name: id.name.clone(),
            applied_at: current_timestamp(),
            checksum: checksum.into(),
            faked,
        }
    }

    /// The applied record's identity.
    pub fn id(&self) -> MigrationId {
        MigrationId::new(self.app_label.clone(), self.name.clone())
    }

    /// Serialize the entry to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize an entry from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Persistent log of applied migrations.
#[derive(Debug, Clone)]
pub struct AppliedMigrationLog {
    tree: sled::Tree,
}

impl AppliedMigrationLog {
    /// Tree name for the log.
    pub const TREE_NAME: &'static str = "migration:applied";

    /// Open or create the log.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Look up an entry.
    pub fn get(&self, id: &MigrationId) -> Result<Option<AppliedEntry>, MigrationError> {
        match self.tree.get(id.to_key())? {
            Some(bytes) => Ok(Some(AppliedEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check whether a record is applied.
    pub fn contains(&self, id: &MigrationId) -> Result<bool, MigrationError> {
        Ok(self.tree.contains_key(id.to_key())?)
    }

    /// All entries keyed by identity.
    pub fn entries(&self) -> Result<BTreeMap<MigrationId, AppliedEntry>, MigrationError> {
        let mut entries = BTreeMap::new();
        for result in self.tree.iter() {
            let (key, value) = result?;
            let id = MigrationId::from_key(&key).ok_or_else(|| MigrationError::StateCorrupted {
                message: format!("malformed applied-log key {}", hex::encode(&key)),
            })?;
            entries.insert(id, AppliedEntry::from_bytes(&value)?);
        }
        Ok(entries)
    }

    /// Number of applied records.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Check if nothing has been applied.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Record an entry outside of the engine's commit path.
    ///
    /// Re-recording an applied identity keeps the original entry.
    pub fn record(&self, entry: &AppliedEntry) -> Result<bool, MigrationError> {
        let result = self.tree.compare_and_swap(
            entry.id().to_key(),
            None::<&[u8]>,
            Some(entry.to_bytes()?),
        )?;
        Ok(result.is_ok())
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }
}
