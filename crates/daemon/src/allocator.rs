//! Port pool leasing on top of the coordination store.
//!
//! Store calls block on SQLite (and on the write lock of other replicas), so
//! every one of them runs on the blocking pool.

use chrono::{DateTime, Utc};
use common::LeaseKey;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Claim, LeaseRecord, LeaseStore, Release, StoreError, Tombstone};
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub port: u16,
    pub expires_at: DateTime<Utc>,
    /// False when an existing lease for the same key was refreshed.
    pub fresh: bool,
}

#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<LeaseStore>,
    min_port: u16,
    max_port: u16,
}

impl PortAllocator {
    pub fn new(store: Arc<LeaseStore>, min_port: u16, max_port: u16) -> Self {
        Self {
            store,
            min_port,
            max_port,
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.min_port..=self.max_port
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&LeaseStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        Ok(result?)
    }

    /// Refresh the session of `public_key` on the lease for `key`, or claim a
    /// new port for it.
    pub async fn allocate(
        &self,
        key: &LeaseKey,
        public_key: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Allocation, BrokerError> {
        let expires_at = now + chrono::Duration::milliseconds(duration.as_millis() as i64);
        let range = self.range();
        let (owned_key, public_key) = (key.clone(), public_key.to_string());
        let claim = self
            .blocking(move |store| store.claim(&owned_key, &public_key, range, now, expires_at))
            .await?;
        match claim {
            Claim::Refreshed(port) => {
                tracing::debug!(port, lease = %key, "Refreshed lease");
                Ok(Allocation {
                    port,
                    expires_at,
                    fresh: false,
                })
            }
            Claim::Claimed(port) => {
                tracing::info!(port, lease = %key, "Allocated port");
                Ok(Allocation {
                    port,
                    expires_at,
                    fresh: true,
                })
            }
            Claim::Exhausted => {
                tracing::warn!(lease = %key, min = self.min_port, max = self.max_port, "Port pool exhausted");
                Err(BrokerError::ResourceExhausted {
                    min: self.min_port,
                    max: self.max_port,
                })
            }
        }
    }

    /// Begin releasing the lease for `key`, or only the session of
    /// `public_key` when one is given. Neither a missing lease nor a lease
    /// still held by another session is an error.
    pub async fn release(
        &self,
        key: &LeaseKey,
        public_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Release, BrokerError> {
        let (owned_key, public_key) = (key.clone(), public_key.map(str::to_string));
        let release = self
            .blocking(move |store| store.release(&owned_key, public_key.as_deref(), now))
            .await?;
        match &release {
            Release::Reclaiming(tombstone) => tracing::info!(port = tombstone.port, lease = %key, "Released port"),
            Release::Shared(port) => tracing::info!(port, lease = %key, "Session ended, lease still in use"),
            Release::Missing => tracing::debug!(lease = %key, "No live lease to release"),
        }
        Ok(release)
    }

    /// Finish a release once the port's routes are gone.
    pub async fn forget(&self, tombstone: &Tombstone) -> Result<bool, BrokerError> {
        let tombstone = tombstone.clone();
        self.blocking(move |store| store.forget(&tombstone)).await
    }

    pub async fn list_expired(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<LeaseRecord>, BrokerError> {
        self.blocking(move |store| store.list_expired(now, stale_before)).await
    }

    /// Re-check expiry right before collection and take the row over.
    pub async fn mark_reclaiming(
        &self,
        record: &LeaseRecord,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Tombstone>, BrokerError> {
        let record = record.clone();
        self.blocking(move |store| store.mark_reclaiming(&record, now, stale_before))
            .await
    }

    pub async fn leases(&self) -> Result<Vec<LeaseRecord>, BrokerError> {
        self.blocking(|store| store.list()).await
    }
}
