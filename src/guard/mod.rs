//! Concurrency guard
//!
//! A catalog-persisted lease per process marks it as running so that
//! overlapping invocations do not build the same (or a related) process at
//! the same time. Leases carry the owner's id, pid, host and start time. A
//! lease older than the staleness threshold, or taken on this host by a pid
//! that has exited, no longer blocks and may be reclaimed.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use ulid::Ulid;

use dbflow_model::ProcessId;

use crate::catalog::{Catalog, CatalogResult, LeaseRecord};

/// Identity written into every lease this invocation takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseOwner {
    pub owner_id: String,
    pub pid: u32,
    pub hostname: String,
}

impl LeaseOwner {
    /// A fresh identity for the current process.
    pub fn current() -> Self {
        Self {
            owner_id: Ulid::new().to_string(),
            pid: std::process::id(),
            hostname: local_hostname(),
        }
    }
}

pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

/// Whether `pid` names a live process on this host.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// A lease with its liveness as judged by this guard.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseStatus {
    #[serde(flatten)]
    pub lease: LeaseRecord,
    pub stale: bool,
}

pub struct ConcurrencyGuard<'a> {
    catalog: &'a dyn Catalog,
    owner: LeaseOwner,
    stale_after: Duration,
}

impl<'a> ConcurrencyGuard<'a> {
    pub fn new(catalog: &'a dyn Catalog, owner: LeaseOwner, stale_after: Duration) -> Self {
        Self {
            catalog,
            owner,
            stale_after,
        }
    }

    pub fn owner(&self) -> &LeaseOwner {
        &self.owner
    }

    pub fn is_stale(&self, lease: &LeaseRecord) -> bool {
        let age = Utc::now().signed_duration_since(lease.started_at);
        let too_old = age
            .to_std()
            .map(|age| age > self.stale_after)
            .unwrap_or(false);
        if too_old {
            return true;
        }
        lease.hostname == self.owner.hostname && !process_alive(lease.pid)
    }

    fn live_lease(&self, scope: ProcessId) -> CatalogResult<Option<LeaseRecord>> {
        Ok(self.catalog.lease(scope)?.filter(|l| !self.is_stale(l)))
    }

    /// True if `process` or any process related to it holds a live lease.
    pub fn is_running(&self, process: ProcessId) -> CatalogResult<bool> {
        if self.live_lease(process)?.is_some() {
            return Ok(true);
        }
        for related in self.catalog.related_processes(process)? {
            if self.live_lease(related)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Take the lease on `process`.
    ///
    /// Returns `None` if it or a related process is running. A stale lease
    /// is reclaimed. The lease is released when the guard drops.
    pub fn acquire(&self, process: ProcessId) -> CatalogResult<Option<LeaseGuard<'a>>> {
        for related in self.catalog.related_processes(process)? {
            if let Some(lease) = self.live_lease(related)? {
                tracing::info!(process, related, owner = %lease.owner_id, "related process running");
                return Ok(None);
            }
        }

        let expected = match self.catalog.lease(process)? {
            None => None,
            Some(lease) if self.is_stale(&lease) => {
                tracing::warn!(
                    process,
                    owner = %lease.owner_id,
                    pid = lease.pid,
                    host = %lease.hostname,
                    started_at = %lease.started_at,
                    "reclaiming stale lease"
                );
                Some(lease.owner_id)
            }
            Some(lease) => {
                tracing::info!(process, owner = %lease.owner_id, "process already running");
                return Ok(None);
            }
        };

        let record = LeaseRecord {
            scope: process,
            owner_id: self.owner.owner_id.clone(),
            pid: self.owner.pid,
            hostname: self.owner.hostname.clone(),
            started_at: Utc::now(),
        };
        if !self
            .catalog
            .lease_swap(process, expected.as_deref(), &record)?
        {
            tracing::info!(process, "lost lease race");
            return Ok(None);
        }

        tracing::debug!(process, owner = %record.owner_id, "lease acquired");
        Ok(Some(LeaseGuard {
            catalog: self.catalog,
            scope: process,
            owner_id: record.owner_id,
            released: false,
        }))
    }

    /// Forcibly clear the lease on `process`, whoever holds it.
    pub fn reset(&self, process: ProcessId) -> CatalogResult<bool> {
        let cleared = self.catalog.lease_release(process, None)?;
        if cleared {
            tracing::warn!(process, "lease reset");
        }
        Ok(cleared)
    }

    /// Clear every stale lease. Returns how many were cleared.
    pub fn reset_stale(&self) -> CatalogResult<usize> {
        let mut cleared = 0;
        for lease in self.catalog.leases()? {
            if self.is_stale(&lease)
                && self
                    .catalog
                    .lease_release(lease.scope, Some(&lease.owner_id))?
            {
                tracing::info!(process = lease.scope, owner = %lease.owner_id, "stale lease cleared");
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    pub fn leases(&self) -> CatalogResult<Vec<LeaseStatus>> {
        Ok(self
            .catalog
            .leases()?
            .into_iter()
            .map(|lease| LeaseStatus {
                stale: self.is_stale(&lease),
                lease,
            })
            .collect())
    }
}

/// A held lease; released on drop.
pub struct LeaseGuard<'a> {
    catalog: &'a dyn Catalog,
    scope: ProcessId,
    owner_id: String,
    released: bool,
}

impl LeaseGuard<'_> {
    pub fn scope(&self) -> ProcessId {
        self.scope
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Release now, surfacing catalog errors.
    pub fn release(mut self) -> CatalogResult<()> {
        self.released = true;
        self.catalog.lease_release(self.scope, Some(&self.owner_id))?;
        Ok(())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.catalog.lease_release(self.scope, Some(&self.owner_id)) {
            tracing::error!(process = self.scope, error = %e, "failed to release lease");
        }
    }
}
