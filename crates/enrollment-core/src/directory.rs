//! Neighbor directory and DIF bootstrap store.
//!
//! Holds the `Neighbor` records that state machines and the watchdog read and
//! write, the local address, and the bootstrap objects a new member needs
//! before it can operate (data-transfer constants, QoS cubes, directory
//! forwarding entries, naming rules). Thread-safe; wrap in `Arc` to share.

use crate::messages::{DataTransferConstants, DirectoryForwardingEntry, QosCube, WhatevercastName};
use crate::transport::PortId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A neighboring IPC process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    pub name: String,
    #[serde(default)]
    pub address: u64,
    #[serde(default)]
    pub old_address: u64,
    #[serde(default)]
    pub supporting_difs: Vec<String>,
    #[serde(default)]
    pub enrolled: bool,
    /// Port of the N-1 flow to this neighbor (only while enrolled or enrolling)
    #[serde(default)]
    pub underlying_port: Option<PortId>,
    #[serde(default)]
    pub enrollment_attempts: u32,
    /// Last time any message was received from the neighbor (ms since epoch, 0 = never)
    #[serde(default)]
    pub last_heard_from_ms: u64,
    #[serde(default)]
    pub average_rtt_ms: u64,
}

impl Neighbor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: 0,
            old_address: 0,
            supporting_difs: Vec::new(),
            enrolled: false,
            underlying_port: None,
            enrollment_attempts: 0,
            last_heard_from_ms: 0,
            average_rtt_ms: 0,
        }
    }

    pub fn with_supporting_dif(mut self, dif: impl Into<String>) -> Self {
        self.supporting_difs.push(dif.into());
        self
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// First supporting DIF, used to pick the security profile.
    pub fn supporting_dif(&self) -> Option<&str> {
        self.supporting_difs.first().map(String::as_str)
    }

    pub fn shares_supporting_dif(&self, difs: &[String]) -> bool {
        self.supporting_difs.iter().any(|d| difs.contains(d))
    }
}

#[derive(Debug, Default)]
struct Bootstrap {
    constants: Option<DataTransferConstants>,
    qos_cubes: Vec<QosCube>,
    dft_entries: Vec<DirectoryForwardingEntry>,
    whatevercast_names: Vec<WhatevercastName>,
}

/// Directory of neighbors plus the DIF bootstrap objects.
pub struct NeighborDirectory {
    neighbors: RwLock<HashMap<String, Neighbor>>,
    bootstrap: RwLock<Bootstrap>,
    address: RwLock<u64>,
}

impl Default for NeighborDirectory {
    fn default() -> Self {
        Self {
            neighbors: RwLock::new(HashMap::new()),
            bootstrap: RwLock::new(Bootstrap::default()),
            address: RwLock::new(0),
        }
    }
}

impl NeighborDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Neighbors ====================

    /// Add a neighbor if its name is unknown. Returns true if added.
    pub fn add_neighbor(&self, neighbor: Neighbor) -> bool {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        if neighbors.contains_key(&neighbor.name) {
            return false;
        }
        neighbors.insert(neighbor.name.clone(), neighbor);
        true
    }

    /// Create the neighbor or update its enrollment fields.
    ///
    /// A known address or supporting-DIF list is kept when the update
    /// carries none. Returns the stored record.
    pub fn add_or_update_neighbor(&self, neighbor: Neighbor) -> Neighbor {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        match neighbors.get_mut(&neighbor.name) {
            Some(existing) => {
                existing.enrolled = neighbor.enrolled;
                existing.underlying_port = neighbor.underlying_port;
                existing.enrollment_attempts = neighbor.enrollment_attempts;
                existing.last_heard_from_ms = neighbor.last_heard_from_ms;
                if neighbor.address != 0 {
                    existing.address = neighbor.address;
                }
                if !neighbor.supporting_difs.is_empty() {
                    existing.supporting_difs = neighbor.supporting_difs;
                }
                existing.clone()
            }
            None => {
                neighbors.insert(neighbor.name.clone(), neighbor.clone());
                neighbor
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Neighbor> {
        self.neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Neighbor whose N-1 flow is bound to `port`.
    pub fn get_by_port(&self, port: PortId) -> Option<Neighbor> {
        self.neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|n| n.underlying_port == Some(port))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// All neighbors, sorted by name.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        let mut list: Vec<_> = self
            .neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn enrolled_neighbors(&self) -> Vec<Neighbor> {
        self.neighbors().into_iter().filter(|n| n.enrolled).collect()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn remove_neighbor(&self, name: &str) -> Option<Neighbor> {
        self.neighbors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    /// Bump the attempt counter. Returns the new count.
    pub fn increment_enrollment_attempts(&self, name: &str) -> Option<u32> {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        neighbors.get_mut(name).map(|n| {
            n.enrollment_attempts += 1;
            n.enrollment_attempts
        })
    }

    /// Mark the neighbor as no longer enrolled. Returns true if it was enrolled.
    pub fn set_unenrolled(&self, name: &str) -> bool {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        match neighbors.get_mut(name) {
            Some(n) => {
                let was_enrolled = n.enrolled;
                n.enrolled = false;
                n.underlying_port = None;
                was_enrolled
            }
            None => false,
        }
    }

    /// Change a neighbor's address. Returns the previous address.
    pub fn update_neighbor_address(&self, name: &str, address: u64) -> Option<u64> {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        neighbors.get_mut(name).map(|n| {
            let old = n.address;
            n.old_address = old;
            n.address = address;
            old
        })
    }

    /// Apply a received neighbor list.
    ///
    /// Skips names already known, the local process, and neighbors that share
    /// no supporting DIF with us. Returns the neighbors that were added.
    pub fn create_neighbors(
        &self,
        list: Vec<Neighbor>,
        local_name: &str,
        local_supporting_difs: &[String],
    ) -> Vec<Neighbor> {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        let mut added = Vec::new();

        for mut candidate in list {
            if neighbors.contains_key(&candidate.name) || candidate.name == local_name {
                continue;
            }
            if !candidate.shares_supporting_dif(local_supporting_difs) {
                continue;
            }

            candidate.enrolled = false;
            candidate.underlying_port = None;
            candidate.enrollment_attempts = 0;
            candidate.last_heard_from_ms = 0;
            candidate.average_rtt_ms = 0;
            neighbors.insert(candidate.name.clone(), candidate.clone());
            added.push(candidate);
        }

        added
    }

    // ==================== Liveness ====================

    /// Record that a message was received from the neighbor.
    pub fn watchdog_read(&self, name: &str, now_ms: u64) -> bool {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        match neighbors.get_mut(name) {
            Some(n) => {
                n.last_heard_from_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Fold a round-trip sample into the moving average and refresh last-heard.
    pub fn record_rtt(&self, name: &str, rtt_ms: u64, now_ms: u64) -> Option<u64> {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        neighbors.get_mut(name).map(|n| {
            n.average_rtt_ms = if n.average_rtt_ms == 0 {
                rtt_ms
            } else {
                (n.average_rtt_ms * 7 + rtt_ms) / 8
            };
            n.last_heard_from_ms = now_ms;
            n.average_rtt_ms
        })
    }

    // ==================== Local address ====================

    /// Local address. 0 until the process has been assigned one.
    pub fn address(&self) -> u64 {
        *self.address.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_address(&self, address: u64) {
        *self.address.write().unwrap_or_else(|e| e.into_inner()) = address;
    }

    // ==================== Bootstrap objects ====================

    pub fn data_transfer_constants(&self) -> Option<DataTransferConstants> {
        self.bootstrap
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .constants
            .clone()
    }

    pub fn set_data_transfer_constants(&self, constants: DataTransferConstants) {
        self.bootstrap
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .constants = Some(constants);
    }

    pub fn qos_cubes(&self) -> Vec<QosCube> {
        self.bootstrap
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .qos_cubes
            .clone()
    }

    /// Add cubes, replacing any with the same id.
    pub fn add_qos_cubes(&self, cubes: Vec<QosCube>) {
        let mut bootstrap = self.bootstrap.write().unwrap_or_else(|e| e.into_inner());
        for cube in cubes {
            bootstrap.qos_cubes.retain(|c| c.id != cube.id);
            bootstrap.qos_cubes.push(cube);
        }
        bootstrap.qos_cubes.sort_by_key(|c| c.id);
    }

    pub fn dft_entries(&self) -> Vec<DirectoryForwardingEntry> {
        self.bootstrap
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .dft_entries
            .clone()
    }

    /// Add entries, replacing any for the same application name.
    pub fn add_dft_entries(&self, entries: Vec<DirectoryForwardingEntry>) {
        let mut bootstrap = self.bootstrap.write().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            bootstrap
                .dft_entries
                .retain(|e| e.application_name != entry.application_name);
            bootstrap.dft_entries.push(entry);
        }
    }

    pub fn whatevercast_names(&self) -> Vec<WhatevercastName> {
        self.bootstrap
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .whatevercast_names
            .clone()
    }

    pub fn add_whatevercast_names(&self, names: Vec<WhatevercastName>) {
        let mut bootstrap = self.bootstrap.write().unwrap_or_else(|e| e.into_inner());
        for name in names {
            bootstrap.whatevercast_names.retain(|n| n.name != name.name);
            bootstrap.whatevercast_names.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn difs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ==================== Add / update ====================

    #[test]
    fn test_add_neighbor_skips_existing() {
        let dir = NeighborDirectory::new();
        assert!(dir.add_neighbor(Neighbor::new("b.ipcp").with_address(7)));
        assert!(!dir.add_neighbor(Neighbor::new("b.ipcp").with_address(9)));
        assert_eq!(dir.get("b.ipcp").unwrap().address, 7);
    }

    #[test]
    fn test_add_or_update_keeps_known_address() {
        let dir = NeighborDirectory::new();
        dir.add_neighbor(
            Neighbor::new("b.ipcp")
                .with_address(7)
                .with_supporting_dif("shim"),
        );

        let mut update = Neighbor::new("b.ipcp");
        update.enrolled = true;
        update.underlying_port = Some(4);
        update.last_heard_from_ms = 500;
        let stored = dir.add_or_update_neighbor(update);

        assert!(stored.enrolled);
        assert_eq!(stored.underlying_port, Some(4));
        assert_eq!(stored.address, 7);
        assert_eq!(stored.supporting_difs, difs(&["shim"]));
        assert_eq!(dir.get_by_port(4).unwrap().name, "b.ipcp");
    }

    #[test]
    fn test_set_unenrolled_clears_port() {
        let dir = NeighborDirectory::new();
        let mut n = Neighbor::new("b.ipcp");
        n.enrolled = true;
        n.underlying_port = Some(2);
        dir.add_neighbor(n);

        assert!(dir.set_unenrolled("b.ipcp"));
        assert!(!dir.set_unenrolled("b.ipcp"));
        let n = dir.get("b.ipcp").unwrap();
        assert!(!n.enrolled);
        assert_eq!(n.underlying_port, None);
        assert!(dir.enrolled_neighbors().is_empty());
    }

    #[test]
    fn test_update_address_records_old() {
        let dir = NeighborDirectory::new();
        dir.add_neighbor(Neighbor::new("b.ipcp").with_address(3));
        assert_eq!(dir.update_neighbor_address("b.ipcp", 8), Some(3));
        let n = dir.get("b.ipcp").unwrap();
        assert_eq!(n.address, 8);
        assert_eq!(n.old_address, 3);
        assert_eq!(dir.update_neighbor_address("zzz", 1), None);
    }

    // ==================== Neighbor list create rule ====================

    #[test]
    fn test_create_neighbors_filters() {
        let dir = NeighborDirectory::new();
        dir.add_neighbor(Neighbor::new("known").with_supporting_dif("shim"));

        let list = vec![
            Neighbor::new("known").with_supporting_dif("shim"),
            Neighbor::new("me").with_supporting_dif("shim"),
            Neighbor::new("far").with_supporting_dif("other"),
            Neighbor::new("new").with_supporting_dif("shim").with_address(12),
        ];

        let added = dir.create_neighbors(list, "me", &difs(&["shim"]));
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "new");
        assert_eq!(dir.get("new").unwrap().address, 12);
        assert!(!dir.contains("far"));
        assert!(!dir.contains("me"));
    }

    #[test]
    fn test_created_neighbor_is_not_enrolled() {
        let dir = NeighborDirectory::new();
        let mut remote = Neighbor::new("c.ipcp").with_supporting_dif("shim");
        remote.enrolled = true;
        remote.underlying_port = Some(9);
        remote.enrollment_attempts = 2;

        dir.create_neighbors(vec![remote], "a.ipcp", &difs(&["shim"]));
        let stored = dir.get("c.ipcp").unwrap();
        assert!(!stored.enrolled);
        assert_eq!(stored.underlying_port, None);
        assert_eq!(stored.enrollment_attempts, 0);
    }

    // ==================== Liveness ====================

    #[test]
    fn test_record_rtt_moving_average() {
        let dir = NeighborDirectory::new();
        dir.add_neighbor(Neighbor::new("b"));

        assert_eq!(dir.record_rtt("b", 80, 1000), Some(80));
        assert_eq!(dir.record_rtt("b", 160, 2000), Some(90));
        assert_eq!(dir.get("b").unwrap().last_heard_from_ms, 2000);
        assert_eq!(dir.record_rtt("nobody", 1, 1), None);
    }

    #[test]
    fn test_watchdog_read_unknown() {
        let dir = NeighborDirectory::new();
        assert!(!dir.watchdog_read("ghost", 10));
    }

    // ==================== Bootstrap ====================

    #[test]
    fn test_bootstrap_objects() {
        let dir = NeighborDirectory::new();
        assert!(dir.data_transfer_constants().is_none());
        assert!(dir.qos_cubes().is_empty());

        dir.set_data_transfer_constants(DataTransferConstants::default());
        dir.add_qos_cubes(vec![QosCube::new(2, "b"), QosCube::new(1, "a")]);
        dir.add_qos_cubes(vec![QosCube::new(2, "b2")]);

        assert!(dir.data_transfer_constants().is_some());
        let cubes = dir.qos_cubes();
        assert_eq!(cubes.len(), 2);
        assert_eq!(cubes[0].id, 1);
        assert_eq!(cubes[1].name, "b2");
    }

    #[test]
    fn test_dft_entries_replace_by_name() {
        let dir = NeighborDirectory::new();
        dir.add_dft_entries(vec![DirectoryForwardingEntry {
            application_name: "app".into(),
            address: 1,
            seq_number: 0,
        }]);
        dir.add_dft_entries(vec![DirectoryForwardingEntry {
            application_name: "app".into(),
            address: 2,
            seq_number: 1,
        }]);
        let entries = dir.dft_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, 2);
    }
}
