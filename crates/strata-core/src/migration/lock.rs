//! Exclusive migration lock, implemented as a lease.
//!
//! The lease lives in its own tree and is only ever changed with
//! compare-and-swap, so two engines sharing a database cannot both hold it.
//! A lease whose expiry has passed is treated as abandoned (its holder
//! crashed) and may be taken over. The guard releases the lease when dropped.

use super::current_timestamp;
use crate::error::MigrationError;
use rkyv::{Archive, Deserialize, Serialize};
use std::time::Duration;

const LEASE_KEY: &[u8] = b"lease";

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct LockLease {
    /// Owner label.
    pub owner: String,
    /// Unique token of the holding engine instance.
    pub token: u64,
    /// When the lease was taken (microseconds since epoch).
    pub acquired_at: u64,
    /// When the lease lapses unless renewed (microseconds since epoch).
    pub expires_at: u64,
}

impl LockLease {
    fn new(owner: &str, token: u64, ttl: Duration) -> Self {
        let now = current_timestamp();
        Self {
            owner: owner.to_string(),
            token,
            acquired_at: now,
            expires_at: now.saturating_add(ttl.as_micros() as u64),
        }
    }

    /// Check if the lease has lapsed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Serialize the lease to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a lease from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// The lock tree.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    tree: sled::Tree,
}

impl MigrationLock {
    /// Tree name for the lease.
    pub const TREE_NAME: &'static str = "migration:lock";

    /// Open or create the lock tree.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// The current lease, live or expired.
    pub fn current(&self) -> Result<Option<LockLease>, MigrationError> {
        match self.tree.get(LEASE_KEY)? {
            Some(bytes) => Ok(Some(LockLease::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Take the lease without waiting.
    ///
    /// # Errors
    ///
    /// [`MigrationError::LockContention`] if a live lease is held by anyone,
    /// including another guard of the same engine.
    pub fn try_acquire(
        &self,
        owner: &str,
        token: u64,
        ttl: Duration,
    ) -> Result<LockGuard, MigrationError> {
        loop {
            let current = self.tree.get(LEASE_KEY)?;
            if let Some(bytes) = &current {
                let held = LockLease::from_bytes(bytes)?;
                if !held.is_expired(current_timestamp()) {
                    return Err(MigrationError::LockContention {
                        holder: held.owner,
                        expires_at: held.expires_at,
                    });
                }
                tracing::warn!(
                    holder = %held.owner,
                    expired_at = held.expires_at,
                    "taking over expired migration lock"
                );
            }

            let lease = LockLease::new(owner, token, ttl);
            let bytes = lease.to_bytes()?;
            let swapped = self
                .tree
                .compare_and_swap(LEASE_KEY, current.as_ref(), Some(bytes.clone()))?;
            if swapped.is_ok() {
                self.tree.flush()?;
                tracing::debug!(owner, token, "migration lock acquired");
                return Ok(LockGuard {
                    tree: self.tree.clone(),
                    lease,
                    bytes,
                    released: false,
                });
            }
            // Lost a race with another engine; re-read and decide again.
        }
    }
}

/// Scoped ownership of the migration lock. Dropping it releases the lease.
#[derive(Debug)]
pub struct LockGuard {
    tree: sled::Tree,
    lease: LockLease,
    bytes: Vec<u8>,
    released: bool,
}

impl LockGuard {
    /// The held lease.
    pub fn lease(&self) -> &LockLease {
        &self.lease
    }

    /// Extend the lease by `ttl` from now.
    pub fn renew(&mut self, ttl: Duration) -> Result<(), MigrationError> {
        let renewed = LockLease {
            expires_at: current_timestamp().saturating_add(ttl.as_micros() as u64),
            ..self.lease.clone()
        };
        let bytes = renewed.to_bytes()?;
        match self
            .tree
            .compare_and_swap(LEASE_KEY, Some(&self.bytes), Some(bytes.clone()))?
        {
            Ok(()) => {
                self.lease = renewed;
                self.bytes = bytes;
                Ok(())
            }
            Err(_) => {
                let holder = self.tree.get(LEASE_KEY)?.map(|b| LockLease::from_bytes(&b)).transpose()?;
                self.released = true;
                Err(MigrationError::LockContention {
                    holder: holder.as_ref().map(|l| l.owner.clone()).unwrap_or_default(),
                    expires_at: holder.map(|l| l.expires_at).unwrap_or(0),
                })
            }
        }
    }

    /// Release the lease now and report storage errors.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.release_lease()
    }

    fn release_lease(&mut self) -> Result<(), MigrationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self
            .tree
            .compare_and_swap(LEASE_KEY, Some(&self.bytes), None::<Vec<u8>>)?;
        if result.is_err() {
            tracing::warn!(owner = %self.lease.owner, "migration lock was taken over before release");
        }
        self.tree.flush()?;
        tracing::debug!(owner = %self.lease.owner, "migration lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_lease() {
            tracing::warn!(error = %e, "failed to release migration lock");
        }
    }
}
