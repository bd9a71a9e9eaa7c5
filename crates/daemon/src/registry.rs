//! Port leases shared by every supervisor that points at the same store.
//!
//! Allocation is first-fit from a base port. The read of current leases is not
//! trusted on its own: the insert is conditional, and a lost race re-reads and
//! tries again.

use crate::db;
use crate::deck::DeckId;
use crate::error::{PreviewError, Result};
use chrono::Utc;
use preview_common::LeaseInfo;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const DEFAULT_BASE_PORT: u16 = 1024;
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Backing table of leased ports.
pub trait LeaseStore: Send + Sync {
    /// Every leased port, ascending.
    fn leased_ports(&self) -> Result<Vec<u16>>;
    /// Insert unless the port is already leased. `false` means conflict.
    fn try_insert(&self, lease: &LeaseInfo) -> Result<bool>;
    /// Delete a lease. `false` means it was not there.
    fn remove(&self, port: u16) -> Result<bool>;
    fn list(&self) -> Result<Vec<LeaseInfo>>;
}

pub struct SqliteLeaseStore {
    conn: Mutex<Connection>,
}

impl SqliteLeaseStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn leased_ports(&self) -> Result<Vec<u16>> {
        self.with_conn(db::leased_ports)
    }

    fn try_insert(&self, lease: &LeaseInfo) -> Result<bool> {
        self.with_conn(|conn| db::insert_lease(conn, lease))
    }

    fn remove(&self, port: u16) -> Result<bool> {
        self.with_conn(|conn| db::delete_lease(conn, port))
    }

    fn list(&self) -> Result<Vec<LeaseInfo>> {
        self.with_conn(db::load_leases)
    }
}

/// Lowest port in `base..=max` missing from `leased` (sorted ascending).
pub fn first_free_port(leased: &[u16], base: u16, max: u16) -> Option<u16> {
    let mut candidate = base;
    for &port in leased.iter().filter(|&&p| p >= base) {
        if port > candidate {
            break;
        }
        if port == candidate {
            candidate = candidate.checked_add(1)?;
        }
    }
    (candidate <= max).then_some(candidate)
}

#[derive(Clone)]
pub struct PortRegistry {
    store: Arc<dyn LeaseStore>,
    base_port: u16,
    max_port: u16,
}

impl PortRegistry {
    pub fn new(store: Arc<dyn LeaseStore>, base_port: u16, max_port: u16) -> Self {
        Self {
            store,
            base_port,
            max_port,
        }
    }

    /// Lease the lowest free port for `deck`.
    pub async fn allocate(&self, deck: &DeckId) -> Result<u16> {
        let registry = self.clone();
        let deck = deck.clone();
        tokio::task::spawn_blocking(move || registry.allocate_blocking(&deck))
            .await
            .map_err(|e| PreviewError::PortAllocationFailed(e.to_string()))?
    }

    fn allocate_blocking(&self, deck: &DeckId) -> Result<u16> {
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let leased = self
                .store
                .leased_ports()
                .map_err(|e| PreviewError::PortAllocationFailed(e.to_string()))?;

            let port = first_free_port(&leased, self.base_port, self.max_port).ok_or_else(|| {
                PreviewError::PortAllocationFailed(format!(
                    "no free port between {} and {}",
                    self.base_port, self.max_port
                ))
            })?;

            let lease = LeaseInfo {
                port,
                deck: deck.to_string(),
                allocated_at: Utc::now(),
            };
            let inserted = self
                .store
                .try_insert(&lease)
                .map_err(|e| PreviewError::PortAllocationFailed(e.to_string()))?;

            if inserted {
                info!(port, %deck, "leased port");
                return Ok(port);
            }
            debug!(port, attempt, "port taken concurrently, rescanning");
        }

        Err(PreviewError::PortAllocationFailed(format!(
            "gave up after {MAX_ALLOCATION_ATTEMPTS} conflicting attempts"
        )))
    }

    /// Drop the lease on `port`. Releasing an unleased port is not an error.
    pub async fn release(&self, port: u16) -> Result<()> {
        let store = self.store.clone();
        let removed = tokio::task::spawn_blocking(move || store.remove(port))
            .await
            .map_err(|e| PreviewError::ReleaseFailed {
                port,
                reason: e.to_string(),
            })?
            .map_err(|e| PreviewError::ReleaseFailed {
                port,
                reason: e.to_string(),
            })?;

        if removed {
            info!(port, "released port");
        } else {
            debug!(port, "release of unleased port ignored");
        }
        Ok(())
    }

    pub async fn leases(&self) -> Result<Vec<LeaseInfo>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list()).await?
    }
}
