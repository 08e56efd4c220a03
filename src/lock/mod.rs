//! Cluster-wide lease-based locking.
//!
//! Every reconciler mutation of a database's grants runs under the
//! `database-grant-v1` lock: Postgres MVCC does not conflict-detect
//! concurrent GRANTs on overlapping object sets, so serialisation has to
//! happen above it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::catalog::Store;
use crate::error::{Error, Result};

/// The single key serialising all grant/revoke mutations.
pub const GRANT_LOCK_KEY: &str = "database-grant-v1";

/// How long acquisition blocks before `LockUnavailable`.
pub const BLOCKING_TIMEOUT: Duration = Duration::from_secs(15);
/// Lease for the short admin-membership step.
pub const MEMBERSHIP_LEASE: Duration = Duration::from_secs(60);
/// Lease for the GRANT/REVOKE apply step.
pub const APPLY_LEASE: Duration = Duration::from_secs(180);

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A held lease. Release explicitly; the lease expiry is the backstop when a
/// holder dies without releasing.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub key: String,
    pub holder: String,
}

/// Any provider offering acquire/release with fencing-by-lease semantics.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Blocks up to `blocking_timeout` trying to take the lease.
    async fn acquire(
        &self,
        key: &str,
        blocking_timeout: Duration,
        lease: Duration,
    ) -> Result<LockLease>;

    async fn release(&self, lease: &LockLease) -> Result<()>;
}

/// Lock provider backed by the shared catalog store's lock table.
pub struct StoreLock {
    store: Arc<dyn Store>,
}

impl StoreLock {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockProvider for StoreLock {
    async fn acquire(
        &self,
        key: &str,
        blocking_timeout: Duration,
        lease: Duration,
    ) -> Result<LockLease> {
        let holder = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + blocking_timeout;

        loop {
            if self.store.try_acquire_lock(key, &holder, lease)? {
                return Ok(LockLease {
                    key: key.to_string(),
                    holder,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::LockUnavailable {
                    key: key.to_string(),
                    waited_ms: blocking_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        if !self.store.release_lock(&lease.key, &lease.holder)? {
            // The lease expired and someone else took over; nothing to undo.
            tracing::warn!("lock '{}' was no longer held at release", lease.key);
        }
        Ok(())
    }
}
