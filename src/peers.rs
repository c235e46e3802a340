//! Per-peer Client Characteristic Configuration state.
//!
//! The table tracks, for every remote device that ever touched a CCC
//! descriptor, which characteristics it subscribed to. Entries outlive the
//! individual transport connections and are only purged in bulk at shutdown
//! or, per handle range, when a service disappears.

use std::{collections::HashMap, sync::Mutex};

use crate::{
    att::{Handle, HandleRange},
    Address, AddressType,
};

/// Identity of a remote peer.
///
/// Two peers are equal iff their full 48-bit addresses and their address
/// types match exactly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PeerId {
    /// Device address.
    pub address: Address,
    /// Device address type.
    pub address_type: AddressType,
}

impl PeerId {
    /// Creates a new peer identity.
    pub fn new(address: Address, address_type: AddressType) -> Self {
        Self { address, address_type }
    }
}

/// Client Characteristic Configuration value of one peer for one descriptor.
///
/// Bit 0 enables notifications, bit 1 enables indications. The remaining
/// 14 bits are reserved and stored verbatim.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CccEntry {
    /// Raw two-byte descriptor value.
    pub value: [u8; 2],
}

impl CccEntry {
    /// Whether the peer enabled notifications.
    pub fn notifications_enabled(&self) -> bool {
        self.value[0] & 0x01 != 0
    }

    /// Whether the peer enabled indications.
    pub fn indications_enabled(&self) -> bool {
        self.value[0] & 0x02 != 0
    }
}

/// Subscription state of one remote device.
#[derive(Debug, Default)]
pub struct PeerState {
    ccc: HashMap<Handle, CccEntry>,
}

impl PeerState {
    /// Looks up the CCC entry for the given descriptor handle.
    pub fn ccc(&self, handle: Handle) -> Option<CccEntry> {
        self.ccc.get(&handle).copied()
    }
}

/// Table of per-peer subscription state, keyed by device address and
/// address type.
///
/// Peer entries are append-only during the lifetime of the process and are
/// purged in bulk by [clear](Self::clear) at shutdown.
#[derive(Debug, Default)]
pub struct PeerStateTable {
    peers: Mutex<HashMap<PeerId, PeerState>>,
}

impl PeerStateTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a state entry exists for the peer.
    pub fn get_or_create(&self, peer: PeerId) {
        let mut peers = self.peers.lock().unwrap();
        peers.entry(peer).or_default();
    }

    /// Whether the peer has a state entry.
    pub fn find(&self, peer: PeerId) -> bool {
        let peers = self.peers.lock().unwrap();
        peers.contains_key(&peer)
    }

    /// Returns the peer's CCC entry for the descriptor handle, creating a
    /// cleared entry (and the peer state, if necessary) when absent.
    pub fn ccc_get_or_create(&self, peer: PeerId, handle: Handle) -> CccEntry {
        let mut peers = self.peers.lock().unwrap();
        *peers.entry(peer).or_default().ccc.entry(handle).or_default()
    }

    /// Looks up the peer's CCC entry for the descriptor handle.
    pub fn ccc_find(&self, peer: PeerId, handle: Handle) -> Option<CccEntry> {
        let peers = self.peers.lock().unwrap();
        peers.get(&peer).and_then(|state| state.ccc(handle))
    }

    /// Stores the peer's CCC value verbatim, creating the entry when absent.
    pub fn ccc_write(&self, peer: PeerId, handle: Handle, value: [u8; 2]) {
        let mut peers = self.peers.lock().unwrap();
        peers.entry(peer).or_default().ccc.insert(handle, CccEntry { value });
    }

    /// Visits every known peer.
    pub fn for_each_peer(&self, mut f: impl FnMut(PeerId, &PeerState)) {
        let peers = self.peers.lock().unwrap();
        for (peer, state) in peers.iter() {
            f(*peer, state);
        }
    }

    /// Erases, for every peer, all CCC entries whose handle lies within the
    /// given range.
    ///
    /// Called when a service is removed so that no subscription can refer
    /// to a handle range that no longer exists.
    pub fn remove_ccc_in_range(&self, range: HandleRange) {
        let mut peers = self.peers.lock().unwrap();
        for state in peers.values_mut() {
            state.ccc.retain(|handle, _| !range.contains(*handle));
        }
    }

    /// Drops all peer state.
    pub fn clear(&self) {
        let mut peers = self.peers.lock().unwrap();
        peers.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn peer(last: u8, address_type: AddressType) -> PeerId {
        PeerId::new(Address::new([0, 1, 2, 3, 4, last]), address_type)
    }

    #[test]
    fn ccc_round_trip() {
        let table = PeerStateTable::new();
        let p = peer(1, AddressType::LePublic);

        assert_eq!(table.ccc_find(p, Handle(10)), None);
        assert_eq!(table.ccc_get_or_create(p, Handle(10)).value, [0, 0]);

        table.ccc_write(p, Handle(10), [0x03, 0xa5]);
        let entry = table.ccc_find(p, Handle(10)).unwrap();
        assert_eq!(entry.value, [0x03, 0xa5]);
        assert!(entry.notifications_enabled());
        assert!(entry.indications_enabled());
    }

    #[test]
    fn peers_differ_by_address_type() {
        let table = PeerStateTable::new();
        let public = peer(1, AddressType::LePublic);
        let random = peer(1, AddressType::LeRandom);

        table.ccc_write(public, Handle(5), [0x01, 0x00]);
        assert!(table.find(public));
        assert!(!table.find(random));
        assert_eq!(table.ccc_find(random, Handle(5)), None);
    }

    #[test]
    fn range_purge() {
        let table = PeerStateTable::new();
        let a = peer(1, AddressType::LePublic);
        let b = peer(2, AddressType::LeRandom);

        table.ccc_write(a, Handle(10), [0x01, 0x00]);
        table.ccc_write(a, Handle(20), [0x02, 0x00]);
        table.ccc_write(b, Handle(12), [0x02, 0x00]);

        table.remove_ccc_in_range(HandleRange { start: Handle(10), end: Handle(15) });

        assert_eq!(table.ccc_find(a, Handle(10)), None);
        assert_eq!(table.ccc_find(b, Handle(12)), None);
        assert_eq!(table.ccc_find(a, Handle(20)).unwrap().value, [0x02, 0x00]);
    }

    #[test]
    fn clear_drops_everything() {
        let table = PeerStateTable::new();
        let p = peer(7, AddressType::BrEdr);
        table.ccc_write(p, Handle(3), [0x01, 0x00]);
        table.clear();
        assert!(!table.find(p));
    }
}
