//! Resource allocation against per-site quotas
//!
//! The allocator grants each VNF an envelope on every one of its target
//! sites. Storage is derived from memory (2x), bandwidth is passed through
//! as the QoS floor. Sites with a configured quota reject reservations that
//! would exceed it; sites without one are tracked but unbounded.

use crate::error::{LifecycleError, LifecycleResult};
use crate::models::VnfSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Storage granted per GB of requested memory
pub const STORAGE_PER_MEMORY_GB: u32 = 2;

/// What a VNF asks the allocator for
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub bandwidth_mbps: f64,
    pub sites: Vec<String>,
}

impl AllocationRequest {
    pub fn from_spec(spec: &VnfSpec) -> Self {
        Self {
            cpu_cores: spec.resources.cpu_cores,
            memory_gb: spec.resources.memory_gb,
            bandwidth_mbps: spec.qos.bandwidth_mbps,
            sites: spec.target_sites.clone(),
        }
    }
}

/// Resources granted to a VNF
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub bandwidth_mbps: f64,
    pub sites: Vec<String>,
    /// One handle per site, used to release exactly what was reserved
    pub reservations: Vec<String>,
}

/// Capacity limits of one site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteQuota {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub bandwidth_mbps: f64,
}

/// Resources currently reserved on one site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SiteUsage {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub bandwidth_mbps: f64,
}

impl SiteUsage {
    /// `self + other`, or `None` if any integer dimension overflows
    fn checked_add(&self, other: &SiteUsage) -> Option<SiteUsage> {
        Some(SiteUsage {
            cpu_cores: self.cpu_cores.checked_add(other.cpu_cores)?,
            memory_gb: self.memory_gb.checked_add(other.memory_gb)?,
            storage_gb: self.storage_gb.checked_add(other.storage_gb)?,
            bandwidth_mbps: self.bandwidth_mbps + other.bandwidth_mbps,
        })
    }

    fn subtract(&mut self, other: &SiteUsage) {
        self.cpu_cores = self.cpu_cores.saturating_sub(other.cpu_cores);
        self.memory_gb = self.memory_gb.saturating_sub(other.memory_gb);
        self.storage_gb = self.storage_gb.saturating_sub(other.storage_gb);
        self.bandwidth_mbps = (self.bandwidth_mbps - other.bandwidth_mbps).max(0.0);
    }

    /// First dimension in which this total exceeds `quota`
    fn exceeds(&self, quota: &SiteQuota) -> Option<String> {
        if self.cpu_cores > quota.cpu_cores {
            return Some(format!("cpu_cores {} > {}", self.cpu_cores, quota.cpu_cores));
        }
        if self.memory_gb > quota.memory_gb {
            return Some(format!("memory_gb {} > {}", self.memory_gb, quota.memory_gb));
        }
        if self.storage_gb > quota.storage_gb {
            return Some(format!("storage_gb {} > {}", self.storage_gb, quota.storage_gb));
        }
        if self.bandwidth_mbps > quota.bandwidth_mbps {
            return Some(format!(
                "bandwidth_mbps {} > {}",
                self.bandwidth_mbps, quota.bandwidth_mbps
            ));
        }
        None
    }
}

/// Pluggable allocation strategy
#[async_trait]
pub trait ResourceAllocator: Send + Sync {
    /// Reserve an envelope for `request`, all sites or none
    async fn allocate(&self, request: &AllocationRequest) -> LifecycleResult<Envelope>;

    /// Return an envelope. Unknown or already released envelopes are a no-op.
    async fn release(&self, envelope: &Envelope) -> LifecycleResult<()>;

    /// Cores currently reserved, for the allocation gauge
    fn allocated_cores(&self) -> u64 {
        0
    }
}

#[derive(Debug)]
struct Reservation {
    site: String,
    usage: SiteUsage,
}

#[derive(Debug, Default)]
struct Ledger {
    usage: HashMap<String, SiteUsage>,
    reservations: HashMap<String, Reservation>,
    next_id: u64,
}

/// Process-local allocator guarded by a single lock
#[derive(Debug, Default)]
pub struct QuotaAllocator {
    quotas: HashMap<String, SiteQuota>,
    ledger: Mutex<Ledger>,
}

impl QuotaAllocator {
    /// Allocator with no quotas: every request is granted
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_quotas(quotas: HashMap<String, SiteQuota>) -> Self {
        Self {
            quotas,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn usage(&self, site: &str) -> SiteUsage {
        self.ledger
            .lock()
            .map(|l| l.usage.get(site).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Cores reserved across all sites
    pub fn total_cores(&self) -> u64 {
        self.ledger
            .lock()
            .map(|l| l.usage.values().map(|u| u.cpu_cores as u64).sum())
            .unwrap_or(0)
    }

    pub fn active_reservations(&self) -> usize {
        self.ledger
            .lock()
            .map(|l| l.reservations.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceAllocator for QuotaAllocator {
    async fn allocate(&self, request: &AllocationRequest) -> LifecycleResult<Envelope> {
        let mut sites: Vec<String> = Vec::with_capacity(request.sites.len());
        for site in &request.sites {
            if !sites.contains(site) {
                sites.push(site.clone());
            }
        }
        if sites.is_empty() {
            return Err(LifecycleError::validation(
                "allocation requires at least one target site",
            ));
        }

        let per_site = SiteUsage {
            cpu_cores: request.cpu_cores,
            memory_gb: request.memory_gb,
            storage_gb: request.memory_gb.saturating_mul(STORAGE_PER_MEMORY_GB),
            bandwidth_mbps: request.bandwidth_mbps,
        };

        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| LifecycleError::internal("allocator lock poisoned"))?;

        // Check every site before touching the ledger so a rejection leaves no partial reservation
        let mut totals = Vec::with_capacity(sites.len());
        for site in &sites {
            let used = ledger.usage.get(site).copied().unwrap_or_default();
            let Some(total) = used.checked_add(&per_site) else {
                debug!(site = %site, "Site usage would overflow");
                return Err(LifecycleError::InsufficientCapacity {
                    site: site.clone(),
                    detail: format!(
                        "{} cores on top of {} overflows the site ledger",
                        per_site.cpu_cores, used.cpu_cores
                    ),
                });
            };
            if let Some(quota) = self.quotas.get(site) {
                if let Some(detail) = total.exceeds(quota) {
                    debug!(site = %site, detail = %detail, "Quota exceeded");
                    return Err(LifecycleError::InsufficientCapacity {
                        site: site.clone(),
                        detail,
                    });
                }
            }
            totals.push(total);
        }

        let mut reservations = Vec::with_capacity(sites.len());
        for (site, total) in sites.iter().zip(totals) {
            ledger.next_id += 1;
            let handle = format!("rsv-{:06}-{}", ledger.next_id, site);
            ledger.usage.insert(site.clone(), total);
            ledger.reservations.insert(
                handle.clone(),
                Reservation {
                    site: site.clone(),
                    usage: per_site,
                },
            );
            reservations.push(handle);
        }

        info!(
            sites = ?sites,
            cpu_cores = per_site.cpu_cores,
            memory_gb = per_site.memory_gb,
            storage_gb = per_site.storage_gb,
            "Resources allocated"
        );

        Ok(Envelope {
            cpu_cores: per_site.cpu_cores,
            memory_gb: per_site.memory_gb,
            storage_gb: per_site.storage_gb,
            bandwidth_mbps: per_site.bandwidth_mbps,
            sites,
            reservations,
        })
    }

    async fn release(&self, envelope: &Envelope) -> LifecycleResult<()> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| LifecycleError::internal("allocator lock poisoned"))?;

        let mut released = 0;
        for handle in &envelope.reservations {
            if let Some(reservation) = ledger.reservations.remove(handle) {
                if let Some(usage) = ledger.usage.get_mut(&reservation.site) {
                    usage.subtract(&reservation.usage);
                }
                released += 1;
            }
        }

        if released > 0 {
            info!(sites = ?envelope.sites, released, "Resources released");
        }
        Ok(())
    }

    fn allocated_cores(&self) -> u64 {
        self.total_cores()
    }
}
