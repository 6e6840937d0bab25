use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use redb::ReadableTable;
use tracing::debug;

use crate::agent::store::{self, Store};
use crate::state::ResourceKey;
use crate::{Error, Result};

/// Hands every service a stable address from the configured loopback prefix.
///
/// Records persist across restarts; an address is never reassigned to a
/// different service while its record exists, and records are only removed
/// explicitly. A service vanishing from the cluster keeps its address.
pub struct Allocator {
    cidr: Ipv4Net,
}

impl Allocator {
    pub fn new(cidr: Ipv4Net) -> Self {
        Self { cidr }
    }

    /// Returns the address for every requested service, assigning the
    /// numerically smallest free host address to services without a record.
    /// Runs in a single write transaction so a crash mid-reconcile never
    /// leaves a half-assigned batch behind.
    pub fn ensure_allocated(
        &self,
        store: &Store,
        services: &[ResourceKey],
    ) -> Result<BTreeMap<ResourceKey, Ipv4Addr>> {
        let cidr = self.cidr;
        store.update(|txn| {
            let mut table = txn.open_table(store::IP_ALLOC)?;

            let mut occupied = BTreeSet::new();
            let mut by_owner = BTreeMap::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let ip: Ipv4Addr = serde_json::from_str::<String>(k.value())?.parse()?;
                let owner: ResourceKey = serde_json::from_str(v.value())?;
                occupied.insert(ip);
                by_owner.insert(owner, ip);
            }

            let mut out = BTreeMap::new();
            for key in services {
                if let Some(ip) = by_owner.get(key) {
                    out.insert(key.clone(), *ip);
                    continue;
                }

                // Host addresses only: the network and broadcast addresses
                // are never handed out.
                let Some(ip) = cidr.hosts().find(|c| !occupied.contains(c)) else {
                    return Err(Error::CidrExhausted(cidr));
                };
                let k = serde_json::to_string(&ip.to_string())?;
                let v = serde_json::to_string(key)?;
                table.insert(k.as_str(), v.as_str())?;
                debug!(service = %key, %ip, "allocated address");
                occupied.insert(ip);
                by_owner.insert(key.clone(), ip);
                out.insert(key.clone(), ip);
            }
            Ok(out)
        })
    }

    /// Address of one service, if a record exists.
    pub fn lookup(&self, store: &Store, key: &ResourceKey) -> Result<Option<Ipv4Addr>> {
        store.view(|txn| {
            let table = txn.open_table(store::IP_ALLOC)?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                let owner: ResourceKey = serde_json::from_str(v.value())?;
                if owner == *key {
                    let ip: Ipv4Addr = serde_json::from_str::<String>(k.value())?.parse()?;
                    return Ok(Some(ip));
                }
            }
            Ok(None)
        })
    }
}
