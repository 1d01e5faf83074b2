//! Embedded ordered key-value backing for standalone deployments.
//!
//! State lives in a single redb table with a prefix-partitioned keyspace:
//!
//! ```text
//! network:{id}                        → Network record (JSON)
//! allocation:{id}                     → Allocation record (JSON)
//! audit:{ts_nanos}_{id}               → Audit entry (JSON, timestamp-ordered)
//! index:cidr:{canonical_cidr}         → network_id
//! index:ip:{network_id}:{ip_literal}  → allocation_id
//! ```
//!
//! Every multi-key mutation (record + index, delete cascade) commits in a
//! single write transaction. A store-wide reader-writer lock serializes
//! writers; the allocation engine additionally holds its own lock across
//! the full scan-mark-write sequence.

use crate::Store;
use ipam_common::{
    Allocation, AllocationId, AuditEntry, Error, Network, NetworkId, Result, AUDIT_LOG_LIMIT,
};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const KEYSPACE: TableDefinition<&str, &[u8]> = TableDefinition::new("ipam");

const PREFIX_NETWORK: &str = "network:";
const PREFIX_ALLOCATION: &str = "allocation:";
const PREFIX_AUDIT: &str = "audit:";
const PREFIX_INDEX_CIDR: &str = "index:cidr:";
const PREFIX_INDEX_IP: &str = "index:ip:";

/// Store backed by an embedded redb database
pub struct LocalStore {
    db: Database,
    lock: RwLock<()>,
    audit_len: AtomicU64,
}

impl LocalStore {
    /// Open (or create) the database under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("failed to create data dir: {e}")))?;

        let db = Database::create(path.join("ipam.redb")).map_err(store_err)?;

        // Ensure the table exists before the first read
        let wtx = db.begin_write().map_err(store_err)?;
        wtx.open_table(KEYSPACE).map_err(store_err)?;
        wtx.commit().map_err(store_err)?;

        let store = Self {
            db,
            lock: RwLock::new(()),
            audit_len: AtomicU64::new(0),
        };
        let audit_len = store.scan_prefix(PREFIX_AUDIT)?.len() as u64;
        store.audit_len.store(audit_len, Ordering::Relaxed);

        info!(path = %path.display(), audit_entries = audit_len, "opened local store");
        Ok(store)
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rtx = self.db.begin_read().map_err(store_err)?;
        let table = rtx.open_table(KEYSPACE).map_err(store_err)?;
        let value = table.get(key).map_err(store_err)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Collect all `(key, value)` pairs whose key starts with `prefix`,
    /// in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rtx = self.db.begin_read().map_err(store_err)?;
        let table = rtx.open_table(KEYSPACE).map_err(store_err)?;
        let mut out = Vec::new();
        for entry in table.range(prefix..).map_err(store_err)? {
            let (key, value) = entry.map_err(store_err)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    fn network_key(id: &NetworkId) -> String {
        format!("{PREFIX_NETWORK}{id}")
    }

    fn allocation_key(id: &AllocationId) -> String {
        format!("{PREFIX_ALLOCATION}{id}")
    }

    fn audit_key(entry: &AuditEntry) -> String {
        // Zero-padded nanos keep lexicographic order equal to time order
        let nanos = entry.timestamp.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        format!("{PREFIX_AUDIT}{nanos:020}_{}", entry.id)
    }

    fn cidr_index_key(cidr: &str) -> String {
        format!("{PREFIX_INDEX_CIDR}{cidr}")
    }

    fn ip_index_key(network_id: &NetworkId, ip: IpAddr) -> String {
        format!("{PREFIX_INDEX_IP}{network_id}:{ip}")
    }
}

impl Store for LocalStore {
    fn save_network(&self, network: &Network) -> Result<()> {
        let _guard = self.lock.write();
        let data = to_json(network)?;

        let wtx = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wtx.open_table(KEYSPACE).map_err(store_err)?;
            table
                .insert(Self::network_key(&network.id).as_str(), data.as_slice())
                .map_err(store_err)?;
            table
                .insert(
                    Self::cidr_index_key(&network.cidr).as_str(),
                    network.id.to_string().as_bytes(),
                )
                .map_err(store_err)?;
        }
        wtx.commit().map_err(store_err)?;
        debug!(network_id = %network.id, cidr = %network.cidr, "saved network");
        Ok(())
    }

    fn get_network(&self, id: &NetworkId) -> Result<Network> {
        let _guard = self.lock.read();
        self.get_record(&Self::network_key(id))?
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))
    }

    fn get_network_by_cidr(&self, cidr: &str) -> Result<Network> {
        let _guard = self.lock.read();
        let id_bytes = self
            .get_raw(&Self::cidr_index_key(cidr))?
            .ok_or_else(|| Error::NetworkNotFound(cidr.to_string()))?;
        let id: NetworkId = String::from_utf8_lossy(&id_bytes)
            .parse()
            .map_err(|e| Error::Internal(format!("corrupt cidr index for {cidr}: {e}")))?;
        self.get_record(&Self::network_key(&id))?
            .ok_or_else(|| Error::NetworkNotFound(cidr.to_string()))
    }

    fn list_networks(&self) -> Result<Vec<Network>> {
        let _guard = self.lock.read();
        self.scan_prefix(PREFIX_NETWORK)?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(Error::from))
            .collect()
    }

    fn delete_network(&self, id: &NetworkId) -> Result<()> {
        let _guard = self.lock.write();
        let network: Network = self
            .get_record(&Self::network_key(id))?
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))?;

        let wtx = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wtx.open_table(KEYSPACE).map_err(store_err)?;

            // Cascade: collect the network's allocations and their index
            // entries before mutating, then remove everything in one commit.
            let mut doomed = vec![Self::network_key(id), Self::cidr_index_key(&network.cidr)];
            for entry in table.range(PREFIX_ALLOCATION..).map_err(store_err)? {
                let (key, value) = entry.map_err(store_err)?;
                let key = key.value();
                if !key.starts_with(PREFIX_ALLOCATION) {
                    break;
                }
                let allocation: Allocation = serde_json::from_slice(value.value())?;
                if allocation.network_id == *id {
                    doomed.push(key.to_string());
                    doomed.push(Self::ip_index_key(&allocation.network_id, allocation.ip));
                }
            }
            for key in &doomed {
                table.remove(key.as_str()).map_err(store_err)?;
            }
        }
        wtx.commit().map_err(store_err)?;
        debug!(network_id = %id, cidr = %network.cidr, "deleted network");
        Ok(())
    }

    fn save_allocation(&self, allocation: &Allocation) -> Result<()> {
        let _guard = self.lock.write();
        let data = to_json(allocation)?;

        let wtx = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wtx.open_table(KEYSPACE).map_err(store_err)?;
            table
                .insert(Self::allocation_key(&allocation.id).as_str(), data.as_slice())
                .map_err(store_err)?;
            table
                .insert(
                    Self::ip_index_key(&allocation.network_id, allocation.ip).as_str(),
                    allocation.id.to_string().as_bytes(),
                )
                .map_err(store_err)?;
        }
        wtx.commit().map_err(store_err)?;
        debug!(allocation_id = %allocation.id, ip = %allocation.ip, "saved allocation");
        Ok(())
    }

    fn get_allocation(&self, id: &AllocationId) -> Result<Allocation> {
        let _guard = self.lock.read();
        self.get_record(&Self::allocation_key(id))?
            .ok_or_else(|| Error::NotAllocated(id.to_string()))
    }

    fn get_allocation_by_ip(&self, network_id: &NetworkId, ip: IpAddr) -> Result<Allocation> {
        let _guard = self.lock.read();
        let id_bytes = self
            .get_raw(&Self::ip_index_key(network_id, ip))?
            .ok_or_else(|| Error::NotAllocated(ip.to_string()))?;
        let id: AllocationId = String::from_utf8_lossy(&id_bytes)
            .parse()
            .map_err(|e| Error::Internal(format!("corrupt ip index for {ip}: {e}")))?;
        self.get_record(&Self::allocation_key(&id))?
            .ok_or_else(|| Error::NotAllocated(ip.to_string()))
    }

    fn list_allocations(&self, network_id: &NetworkId) -> Result<Vec<Allocation>> {
        let _guard = self.lock.read();
        let mut out = Vec::new();
        for (_, value) in self.scan_prefix(PREFIX_ALLOCATION)? {
            let allocation: Allocation = serde_json::from_slice(&value)?;
            if allocation.network_id == *network_id {
                out.push(allocation);
            }
        }
        Ok(out)
    }

    fn delete_allocation(&self, id: &AllocationId) -> Result<()> {
        let _guard = self.lock.write();
        let allocation: Allocation = self
            .get_record(&Self::allocation_key(id))?
            .ok_or_else(|| Error::NotAllocated(id.to_string()))?;

        let wtx = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wtx.open_table(KEYSPACE).map_err(store_err)?;
            table
                .remove(Self::allocation_key(id).as_str())
                .map_err(store_err)?;
            table
                .remove(Self::ip_index_key(&allocation.network_id, allocation.ip).as_str())
                .map_err(store_err)?;
        }
        wtx.commit().map_err(store_err)?;
        Ok(())
    }

    fn save_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self.lock.write();
        let data = to_json(entry)?;
        let len = self.audit_len.load(Ordering::Relaxed);
        let excess = (len + 1).saturating_sub(AUDIT_LOG_LIMIT as u64);

        let wtx = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wtx.open_table(KEYSPACE).map_err(store_err)?;
            table
                .insert(Self::audit_key(entry).as_str(), data.as_slice())
                .map_err(store_err)?;

            if excess > 0 {
                // Discard the oldest entries to keep the log bounded
                let mut oldest = Vec::with_capacity(excess as usize);
                for row in table.range(PREFIX_AUDIT..).map_err(store_err)? {
                    let (key, _) = row.map_err(store_err)?;
                    let key = key.value();
                    if !key.starts_with(PREFIX_AUDIT) || oldest.len() as u64 == excess {
                        break;
                    }
                    oldest.push(key.to_string());
                }
                for key in &oldest {
                    table.remove(key.as_str()).map_err(store_err)?;
                }
            }
        }
        wtx.commit().map_err(store_err)?;
        self.audit_len
            .store(len + 1 - excess, Ordering::Relaxed);
        Ok(())
    }

    fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let _guard = self.lock.read();
        let all = self.scan_prefix(PREFIX_AUDIT)?;
        let start = if limit == 0 {
            0
        } else {
            all.len().saturating_sub(limit)
        };
        // Most recent first
        all[start..]
            .iter()
            .rev()
            .map(|(_, v)| serde_json::from_slice(v).map_err(Error::from))
            .collect()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::from)
}

fn store_err(e: impl Display) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ipam_common::{AllocationStatus, AuditAction};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample_allocation(network_id: NetworkId, ip: &str) -> Allocation {
        Allocation {
            id: AllocationId::new(),
            network_id,
            ip: ip.parse().unwrap(),
            end_ip: None,
            status: AllocationStatus::Allocated,
            allocated_at: Utc::now(),
            expires_at: None,
            released_at: None,
            hostname: "host".into(),
            description: String::new(),
            tags: Vec::new(),
        }
    }

    fn sample_audit(action: AuditAction) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            resource_id: "r".into(),
            details: "d".into(),
            user: "test".into(),
        }
    }

    #[test]
    fn test_network_save_get_by_id_and_cidr() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let network = Network::new("10.0.0.0/24", "test", vec![]);
        store.save_network(&network).unwrap();

        assert_eq!(store.get_network(&network.id).unwrap(), network);
        assert_eq!(store.get_network_by_cidr("10.0.0.0/24").unwrap(), network);
        assert!(matches!(
            store.get_network_by_cidr("10.9.0.0/24"),
            Err(Error::NetworkNotFound(_))
        ));
    }

    #[test]
    fn test_allocation_save_and_ip_index() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let network = Network::new("10.0.0.0/24", "", vec![]);
        store.save_network(&network).unwrap();

        let allocation = sample_allocation(network.id, "10.0.0.1");
        store.save_allocation(&allocation).unwrap();

        assert_eq!(store.get_allocation(&allocation.id).unwrap(), allocation);
        assert_eq!(
            store
                .get_allocation_by_ip(&network.id, "10.0.0.1".parse().unwrap())
                .unwrap(),
            allocation
        );
        assert!(matches!(
            store.get_allocation_by_ip(&network.id, "10.0.0.2".parse().unwrap()),
            Err(Error::NotAllocated(_))
        ));
        assert_eq!(store.list_allocations(&network.id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_network_cascades() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let network = Network::new("10.0.0.0/24", "", vec![]);
        let other = Network::new("172.16.0.0/24", "", vec![]);
        store.save_network(&network).unwrap();
        store.save_network(&other).unwrap();

        for i in 1..=5 {
            store
                .save_allocation(&sample_allocation(network.id, &format!("10.0.0.{i}")))
                .unwrap();
        }
        let kept = sample_allocation(other.id, "172.16.0.1");
        store.save_allocation(&kept).unwrap();

        store.delete_network(&network.id).unwrap();

        assert!(store.get_network(&network.id).is_err());
        assert!(store.get_network_by_cidr("10.0.0.0/24").is_err());
        assert!(store.list_allocations(&network.id).unwrap().is_empty());
        assert!(store
            .get_allocation_by_ip(&network.id, "10.0.0.1".parse().unwrap())
            .is_err());
        // No stale index keys survive the cascade
        assert!(store.scan_prefix(PREFIX_INDEX_IP).unwrap().iter().all(
            |(key, _)| !key.contains(&network.id.to_string())
        ));

        // The other network is untouched
        assert_eq!(store.list_allocations(&other.id).unwrap(), vec![kept]);

        // A re-add of the same CIDR succeeds
        store
            .save_network(&Network::new("10.0.0.0/24", "", vec![]))
            .unwrap();
    }

    #[test]
    fn test_audit_order_and_limit_listing() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut entry = sample_audit(AuditAction::IpAllocated);
            entry.timestamp = Utc::now();
            ids.push(entry.id);
            store.save_audit_entry(&entry).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let listed = store.list_audit_entries(3).unwrap();
        assert_eq!(listed.len(), 3);
        // Newest first
        assert_eq!(listed[0].id, ids[4]);
        assert_eq!(listed[1].id, ids[3]);
        assert_eq!(listed[2].id, ids[2]);

        assert_eq!(store.list_audit_entries(0).unwrap().len(), 5);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempdir().unwrap();
        let network = Network::new("192.168.0.0/16", "persisted", vec![]);

        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.save_network(&network).unwrap();
            store
                .save_audit_entry(&sample_audit(AuditAction::NetworkAdded))
                .unwrap();
        }

        let store = LocalStore::open(dir.path()).unwrap();
        assert_eq!(store.get_network(&network.id).unwrap(), network);
        assert_eq!(store.list_audit_entries(0).unwrap().len(), 1);
        assert_eq!(store.audit_len.load(Ordering::Relaxed), 1);
    }
}
