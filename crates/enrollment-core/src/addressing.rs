//! Address assignment for joining members.

use crate::directory::NeighborDirectory;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

/// Decides whether a requested address is usable and hands out new ones.
pub trait AddressAssigner: Send + Sync {
    /// True if `name` may keep using `address`.
    fn is_valid_address(&self, address: u64, name: &str) -> bool;

    /// A usable address for `name`, or None if the range is exhausted.
    fn get_valid_address(&self, name: &str) -> Option<u64>;

    /// Forget any address reserved for `name`.
    fn release_address(&self, name: &str);
}

/// Assigns addresses from a fixed range.
///
/// An address is taken when it is the local address, held by a different
/// neighbor in the directory, or already handed out to a different name.
/// Each name holds at most one reservation.
pub struct RangeAddressAssigner {
    range: RangeInclusive<u64>,
    directory: Arc<NeighborDirectory>,
    assigned: Mutex<HashMap<u64, String>>,
}

impl RangeAddressAssigner {
    pub fn new(range: RangeInclusive<u64>, directory: Arc<NeighborDirectory>) -> Self {
        Self {
            range,
            directory,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    fn is_taken(&self, address: u64, name: &str) -> bool {
        if address == self.directory.address() {
            return true;
        }
        let held_by_neighbor = self
            .directory
            .neighbors()
            .iter()
            .any(|n| n.address == address && n.name != name);
        if held_by_neighbor {
            return true;
        }
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .is_some_and(|holder| holder != name)
    }
}

impl AddressAssigner for RangeAddressAssigner {
    fn is_valid_address(&self, address: u64, name: &str) -> bool {
        address != 0 && self.range.contains(&address) && !self.is_taken(address, name)
    }

    fn get_valid_address(&self, name: &str) -> Option<u64> {
        let address = self
            .range
            .clone()
            .filter(|a| *a != 0)
            .find(|a| !self.is_taken(*a, name))?;

        let mut assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
        assigned.retain(|_, holder| holder != name);
        assigned.insert(address, name.to_string());
        Some(address)
    }

    fn release_address(&self, name: &str) {
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, holder| holder != name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Neighbor;

    fn assigner(range: RangeInclusive<u64>) -> (RangeAddressAssigner, Arc<NeighborDirectory>) {
        let directory = Arc::new(NeighborDirectory::new());
        (RangeAddressAssigner::new(range, directory.clone()), directory)
    }

    #[test]
    fn test_validity() {
        let (assigner, directory) = assigner(1..=10);
        directory.set_address(1);
        directory.add_neighbor(Neighbor::new("b").with_address(5));

        assert!(!assigner.is_valid_address(0, "c"));
        assert!(!assigner.is_valid_address(1, "c"));
        assert!(!assigner.is_valid_address(11, "c"));
        assert!(!assigner.is_valid_address(5, "c"));
        assert!(assigner.is_valid_address(5, "b"));
        assert!(assigner.is_valid_address(6, "c"));
    }

    #[test]
    fn test_assigns_lowest_free() {
        let (assigner, directory) = assigner(1..=4);
        directory.set_address(1);
        directory.add_neighbor(Neighbor::new("b").with_address(2));

        assert_eq!(assigner.get_valid_address("c"), Some(3));
        assert_eq!(assigner.get_valid_address("d"), Some(4));
        assert_eq!(assigner.get_valid_address("e"), None);
    }

    #[test]
    fn test_reassigns_same_name() {
        let (assigner, _directory) = assigner(7..=7);
        assert_eq!(assigner.get_valid_address("c"), Some(7));
        assert_eq!(assigner.get_valid_address("c"), Some(7));
        assert!(assigner.is_valid_address(7, "c"));
        assert!(!assigner.is_valid_address(7, "d"));
    }

    #[test]
    fn test_reassignment_drops_old_reservation() {
        let (assigner, directory) = assigner(1..=2);
        directory.add_neighbor(Neighbor::new("b").with_address(1));
        assert_eq!(assigner.get_valid_address("c"), Some(2));

        // b leaves and c is handed the lower address
        directory.remove_neighbor("b");
        assert_eq!(assigner.get_valid_address("c"), Some(1));
        assert_eq!(assigner.get_valid_address("d"), Some(2));
    }

    #[test]
    fn test_released_address_is_reused() {
        let (assigner, _directory) = assigner(1..=2);
        assert_eq!(assigner.get_valid_address("c"), Some(1));
        assert_eq!(assigner.get_valid_address("d"), Some(2));
        assert_eq!(assigner.get_valid_address("e"), None);

        assigner.release_address("c");
        assert!(assigner.is_valid_address(1, "e"));
        assert_eq!(assigner.get_valid_address("e"), Some(1));
    }
}
