//! The allocation engine.
//!
//! Sits on top of any [`Store`] backend and owns the allocation policy:
//! first-fit single and contiguous-range placement, TTL stamping,
//! idempotent release, and the delete cascade. The engine mints all ids
//! and timestamps so that clustered backends apply identical state
//! transitions on every replica.
//!
//! One engine-level mutex covers the whole read-pool/scan/mark/write
//! sequence of each mutating call; this store-global writer is the sole
//! guarantor of the no-double-allocation invariant.

use crate::bitmap::FreePool;
use crate::cidr::Cidr;
use chrono::{Duration, Utc};
use ipam_common::{
    Allocation, AllocationId, AllocationRequest, AllocationStatus, AuditAction, AuditEntry, Error,
    Network, NetworkId, NetworkStats, Result,
};
use ipam_store::Store;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// IP address management engine over a storage backend
pub struct Ipam {
    store: Arc<dyn Store>,
    write_lock: Mutex<()>,
    user: String,
}

impl Ipam {
    /// Create an engine recording audit entries as the process user
    pub fn new(store: Arc<dyn Store>) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "system".to_string());
        Self::with_user(store, user)
    }

    /// Create an engine recording audit entries as `user`
    pub fn with_user(store: Arc<dyn Store>, user: impl Into<String>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            user: user.into(),
        }
    }

    /// The underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Declare a new CIDR block. Fails with `network_exists` if a network
    /// with the same canonical CIDR is already present.
    pub fn add_network(
        &self,
        cidr: &str,
        description: &str,
        tags: Vec<String>,
    ) -> Result<Network> {
        let parsed = Cidr::parse(cidr)?;
        let canonical = parsed.to_string();

        let _guard = self.write_lock.lock();
        match self.store.get_network_by_cidr(&canonical) {
            Ok(_) => return Err(Error::NetworkExists(canonical)),
            Err(Error::NetworkNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let network = Network::new(canonical.clone(), description, tags);
        self.store.save_network(&network)?;
        self.audit(
            AuditAction::NetworkAdded,
            network.id.to_string(),
            format!("network {canonical} added"),
        )?;
        info!(network_id = %network.id, cidr = %canonical, "network added");
        Ok(network)
    }

    /// Delete a network and cascade over its allocations and indexes.
    /// The cascade is a single atomic store write.
    pub fn delete_network(&self, id: NetworkId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let network = self.store.get_network(&id)?;
        self.store.delete_network(&id)?;
        self.audit(
            AuditAction::NetworkDeleted,
            id.to_string(),
            format!("network {} deleted", network.cidr),
        )?;
        info!(network_id = %id, cidr = %network.cidr, "network deleted");
        Ok(())
    }

    /// Lease the lowest free address (or contiguous run) in the target
    /// network.
    pub fn allocate(&self, request: &AllocationRequest) -> Result<Allocation> {
        if request.count < 1 {
            return Err(Error::InvalidCount(request.count));
        }

        let _guard = self.write_lock.lock();
        let network = self.resolve_network(request)?;
        let cidr = Cidr::parse(&network.cidr)?;

        let mut pool = self.build_pool(&cidr, &network.id)?;
        if request.count > pool.len() {
            // A request larger than the pool window is a sizing error on
            // capped networks, plain exhaustion otherwise
            return Err(if u128::from(pool.len()) < cidr.capacity() {
                Error::NetworkTooLarge {
                    hosts: cidr.capacity(),
                    cap: pool.len(),
                }
            } else {
                Error::IpNotAvailable(network.cidr.clone())
            });
        }

        let offset = if request.count == 1 {
            pool.find_first_free()
        } else {
            pool.find_first_free_run(request.count)
        };
        let Some(offset) = offset else {
            return Err(Error::IpNotAvailable(network.cidr.clone()));
        };
        pool.mark(offset, request.count)?;

        let ip = cidr.addr_at(offset)?;
        let end_ip = if request.count > 1 {
            Some(cidr.addr_at(offset + request.count - 1)?)
        } else {
            None
        };

        let now = Utc::now();
        let allocation = Allocation {
            id: AllocationId::new(),
            network_id: network.id,
            ip,
            end_ip,
            status: AllocationStatus::Allocated,
            allocated_at: now,
            expires_at: (request.ttl_seconds > 0)
                .then(|| now + Duration::seconds(request.ttl_seconds as i64)),
            released_at: None,
            hostname: request.hostname.clone(),
            description: request.description.clone(),
            tags: request.tags.clone(),
        };
        self.store.save_allocation(&allocation)?;

        let details = match allocation.end_ip {
            Some(end) => format!("allocated {ip}-{end} in {}", network.cidr),
            None => format!("allocated {ip} in {}", network.cidr),
        };
        self.audit(AuditAction::IpAllocated, allocation.id.to_string(), details)?;
        debug!(allocation_id = %allocation.id, ip = %ip, count = request.count, "allocated");
        Ok(allocation)
    }

    /// Release the allocation starting at `ip`. The entire range returns
    /// to the pool. Fails with `not_allocated` if the address is not the
    /// start of an unreleased allocation.
    pub fn release(&self, network_id: NetworkId, ip: IpAddr) -> Result<Allocation> {
        let _guard = self.write_lock.lock();
        let mut allocation = self.store.get_allocation_by_ip(&network_id, ip)?;
        if allocation.released_at.is_some() {
            return Err(Error::NotAllocated(ip.to_string()));
        }

        allocation.released_at = Some(Utc::now());
        allocation.status = AllocationStatus::Released;
        self.store.save_allocation(&allocation)?;

        self.audit(
            AuditAction::IpReleased,
            allocation.id.to_string(),
            format!("released {ip}"),
        )?;
        debug!(allocation_id = %allocation.id, ip = %ip, "released");
        Ok(allocation)
    }

    /// Utilization report for a network
    pub fn get_network_stats(&self, network_id: NetworkId) -> Result<NetworkStats> {
        let network = self.store.get_network(&network_id)?;
        let cidr = Cidr::parse(&network.cidr)?;

        let total = cidr.total_addresses();
        let reserved = total - cidr.capacity();
        let mut allocated: u128 = 0;
        for allocation in self.store.list_allocations(&network_id)? {
            if allocation.is_active() {
                let end = allocation.end_ip.unwrap_or(allocation.ip);
                allocated += cidr.span(allocation.ip, end)?;
            }
        }

        let usable = total - reserved;
        let utilization = if usable == 0 {
            0.0
        } else {
            allocated as f64 / usable as f64 * 100.0
        };
        Ok(NetworkStats {
            total_ips: total,
            allocated_ips: allocated,
            available_ips: total - allocated - reserved,
            reserved_ips: reserved,
            utilization_percent: utilization,
        })
    }

    /// Find the network owning an unreleased allocation that starts at
    /// `ip`. Used by front-ends that take a bare address.
    pub fn find_network_for_ip(&self, ip: IpAddr) -> Result<Network> {
        for network in self.store.list_networks()? {
            match self.store.get_allocation_by_ip(&network.id, ip) {
                Ok(allocation) if allocation.is_active() => return Ok(network),
                Ok(_) | Err(Error::NotAllocated(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotAllocated(ip.to_string()))
    }

    // Read pass-throughs for front-ends

    /// All declared networks
    pub fn networks(&self) -> Result<Vec<Network>> {
        self.store.list_networks()
    }

    /// One network by id
    pub fn network(&self, id: NetworkId) -> Result<Network> {
        self.store.get_network(&id)
    }

    /// All allocations under a network
    pub fn allocations(&self, network_id: NetworkId) -> Result<Vec<Allocation>> {
        self.store.list_allocations(&network_id)
    }

    /// The most recent `limit` audit entries, newest first
    pub fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store.list_audit_entries(limit)
    }

    fn resolve_network(&self, request: &AllocationRequest) -> Result<Network> {
        if let Some(id) = request.network_id {
            return self.store.get_network(&id);
        }
        if let Some(cidr) = request.cidr.as_deref().filter(|c| !c.is_empty()) {
            let canonical = Cidr::parse(cidr)?.to_string();
            return self.store.get_network_by_cidr(&canonical);
        }
        Err(Error::NetworkNotFound(
            "no network id or CIDR specified".into(),
        ))
    }

    /// Rebuild the free pool from the network's unreleased allocations
    fn build_pool(&self, cidr: &Cidr, network_id: &NetworkId) -> Result<FreePool> {
        let mut pool = FreePool::new(cidr.pool_size());
        for allocation in self.store.list_allocations(network_id)? {
            if !allocation.is_active() {
                continue;
            }
            let start = cidr.offset(allocation.ip)?;
            let length = match allocation.end_ip {
                Some(end) => cidr.offset(end)? - start + 1,
                None => 1,
            };
            pool.mark(start, length).map_err(|_| {
                Error::Internal(format!(
                    "overlapping allocations in network {network_id} at offset {start}"
                ))
            })?;
        }
        Ok(pool)
    }

    fn audit(&self, action: AuditAction, resource_id: String, details: String) -> Result<()> {
        self.store.save_audit_entry(&AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            resource_id,
            details,
            user: self.user.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_store::LocalStore;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, Ipam) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        (dir, Ipam::with_user(store, "test"))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_network_canonicalizes_and_rejects_duplicates() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/24", "first", vec![]).unwrap();
        assert_eq!(network.cidr, "10.0.0.0/24");

        assert!(matches!(
            ipam.add_network("10.0.0.0/24", "again", vec![]),
            Err(Error::NetworkExists(_))
        ));
        assert!(matches!(
            ipam.add_network("10.0.0.7/24", "host bits", vec![]),
            Err(Error::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_allocate_is_monotonic_on_empty_network() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("192.168.1.0/24", "", vec![]).unwrap();

        for i in 1..=4 {
            let allocation = ipam
                .allocate(&AllocationRequest::for_network(network.id))
                .unwrap();
            assert_eq!(allocation.ip, ip(&format!("192.168.1.{i}")));
            assert!(allocation.end_ip.is_none());
        }
    }

    #[test]
    fn test_allocate_validates_request() {
        let (_dir, ipam) = engine();
        ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();

        let mut request = AllocationRequest::for_cidr("10.0.0.0/24");
        request.count = 0;
        assert!(matches!(
            ipam.allocate(&request),
            Err(Error::InvalidCount(0))
        ));

        assert!(matches!(
            ipam.allocate(&AllocationRequest::for_cidr("10.99.0.0/24")),
            Err(Error::NetworkNotFound(_))
        ));
        assert!(matches!(
            ipam.allocate(&AllocationRequest::default()),
            Err(Error::NetworkNotFound(_))
        ));
    }

    #[test]
    fn test_allocate_with_ttl_stamps_expiry() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();

        let no_ttl = ipam
            .allocate(&AllocationRequest::for_network(network.id))
            .unwrap();
        assert!(no_ttl.expires_at.is_none());

        let leased = ipam
            .allocate(&AllocationRequest::for_network(network.id).ttl_seconds(300))
            .unwrap();
        let expires = leased.expires_at.expect("ttl must set expiry");
        assert_eq!((expires - leased.allocated_at).num_seconds(), 300);
        assert_eq!(leased.status_at(Utc::now()), AllocationStatus::Allocated);
        assert_eq!(
            leased.status_at(expires + Duration::seconds(1)),
            AllocationStatus::Expired
        );
    }

    #[test]
    fn test_release_and_reuse() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("192.168.1.0/24", "", vec![]).unwrap();

        for _ in 0..3 {
            ipam.allocate(&AllocationRequest::for_network(network.id))
                .unwrap();
        }
        ipam.release(network.id, ip("192.168.1.2")).unwrap();

        // The freed address is the new first fit
        let next = ipam
            .allocate(&AllocationRequest::for_network(network.id))
            .unwrap();
        assert_eq!(next.ip, ip("192.168.1.2"));
    }

    #[test]
    fn test_release_is_not_idempotent_at_record_level() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();
        ipam.allocate(&AllocationRequest::for_network(network.id))
            .unwrap();

        ipam.release(network.id, ip("10.0.0.1")).unwrap();
        assert!(matches!(
            ipam.release(network.id, ip("10.0.0.1")),
            Err(Error::NotAllocated(_))
        ));
        assert!(matches!(
            ipam.release(network.id, ip("10.0.0.9")),
            Err(Error::NotAllocated(_))
        ));
    }

    #[test]
    fn test_release_of_range_frees_whole_run() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();

        let range = ipam
            .allocate(&AllocationRequest::for_network(network.id).count(5))
            .unwrap();
        assert_eq!(range.ip, ip("10.0.0.1"));
        assert_eq!(range.end_ip, Some(ip("10.0.0.5")));

        ipam.release(network.id, range.ip).unwrap();
        let next = ipam
            .allocate(&AllocationRequest::for_network(network.id).count(5))
            .unwrap();
        assert_eq!(next.ip, ip("10.0.0.1"));
        assert_eq!(next.end_ip, Some(ip("10.0.0.5")));
    }

    #[test]
    fn test_no_overlap_after_mixed_operations() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/28", "", vec![]).unwrap();

        ipam.allocate(&AllocationRequest::for_network(network.id).count(3))
            .unwrap();
        ipam.allocate(&AllocationRequest::for_network(network.id))
            .unwrap();
        ipam.release(network.id, ip("10.0.0.1")).unwrap();
        ipam.allocate(&AllocationRequest::for_network(network.id).count(2))
            .unwrap();

        // Mass balance: held slots equal the sum of unreleased ranges
        let cidr = Cidr::parse(&network.cidr).unwrap();
        let mut pool = FreePool::new(cidr.pool_size());
        for allocation in ipam.allocations(network.id).unwrap() {
            if allocation.is_active() {
                let start = cidr.offset(allocation.ip).unwrap();
                let end = allocation.end_ip.unwrap_or(allocation.ip);
                let length = cidr.offset(end).unwrap() - start + 1;
                // mark fails if any two active allocations overlap
                pool.mark(start, length).unwrap();
            }
        }
        let stats = ipam.get_network_stats(network.id).unwrap();
        assert_eq!(stats.allocated_ips, u128::from(pool.count_set()));
    }

    #[test]
    fn test_stats_mass_balance() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.50.0.0/29", "", vec![]).unwrap();

        ipam.allocate(&AllocationRequest::for_network(network.id).count(2))
            .unwrap();
        let stats = ipam.get_network_stats(network.id).unwrap();
        assert_eq!(stats.total_ips, 8);
        assert_eq!(stats.reserved_ips, 2);
        assert_eq!(stats.allocated_ips, 2);
        assert_eq!(stats.available_ips, 4);
        assert!((stats.utilization_percent - 100.0 * 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_delete_network_cascade_and_re_add() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();
        for _ in 0..5 {
            ipam.allocate(&AllocationRequest::for_network(network.id))
                .unwrap();
        }

        ipam.delete_network(network.id).unwrap();
        assert!(ipam.networks().unwrap().is_empty());
        assert!(ipam.allocations(network.id).unwrap().is_empty());

        let again = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();
        let first = ipam
            .allocate(&AllocationRequest::for_network(again.id))
            .unwrap();
        assert_eq!(first.ip, ip("10.0.0.1"));
    }

    #[test]
    fn test_audit_trail_records_actions() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();
        ipam.allocate(&AllocationRequest::for_network(network.id))
            .unwrap();
        ipam.release(network.id, ip("10.0.0.1")).unwrap();
        ipam.delete_network(network.id).unwrap();

        let entries = ipam.audit_entries(0).unwrap();
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::NetworkDeleted,
                AuditAction::IpReleased,
                AuditAction::IpAllocated,
                AuditAction::NetworkAdded,
            ]
        );
        assert!(entries.iter().all(|e| e.user == "test"));
    }

    #[test]
    fn test_find_network_for_ip() {
        let (_dir, ipam) = engine();
        let a = ipam.add_network("10.0.0.0/24", "", vec![]).unwrap();
        let b = ipam.add_network("172.16.0.0/24", "", vec![]).unwrap();
        ipam.allocate(&AllocationRequest::for_network(a.id)).unwrap();
        ipam.allocate(&AllocationRequest::for_network(b.id)).unwrap();

        assert_eq!(ipam.find_network_for_ip(ip("172.16.0.1")).unwrap().id, b.id);
        assert!(ipam.find_network_for_ip(ip("192.168.0.1")).is_err());

        ipam.release(b.id, ip("172.16.0.1")).unwrap();
        assert!(ipam.find_network_for_ip(ip("172.16.0.1")).is_err());
    }

    #[test]
    fn test_expired_allocation_still_holds_addresses() {
        let (_dir, ipam) = engine();
        let network = ipam.add_network("10.0.0.0/30", "", vec![]).unwrap();

        let mut leased = ipam
            .allocate(&AllocationRequest::for_network(network.id).ttl_seconds(1))
            .unwrap();
        // Rewrite the record as already expired
        leased.expires_at = Some(Utc::now() - Duration::seconds(10));
        ipam.store().save_allocation(&leased).unwrap();
        assert_eq!(leased.status_at(Utc::now()), AllocationStatus::Expired);

        // Expiry is observational only: the bits stay held until release
        let next = ipam
            .allocate(&AllocationRequest::for_network(network.id))
            .unwrap();
        assert_ne!(next.ip, leased.ip);
    }
}
