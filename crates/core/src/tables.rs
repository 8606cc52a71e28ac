use crate::crypto::LayerKey;
use std::collections::HashMap;

/// `(ip, port)` identifying one accepted circuit leg. This is the raw
/// TCP peer address of the accepted connection, not the `ip`/`port` the
/// create/extend payload advertises: the payload's fields are a
/// placeholder the predecessor fills with its own listening identity
/// (or nothing at all, when the predecessor is the client), so every
/// leg a node accepts would otherwise collide on one key. The accepted
/// socket's address is assigned by the OS and distinct for every
/// concurrently open connection, so it is the only value available here
/// that actually identifies one leg.
pub type PeerAddr = (String, u16);

/// Maintained by a relay: which circID is associated with a given
/// accepted leg's peer address, and the reverse. Ported from
/// `circuit_table` in `circuit_tables.py`; a relay's peer-keyed
/// direction needs reverse lookup by circID too (a single table serves
/// both, as the original comments note, rather than keeping two).
#[derive(Debug, Default)]
pub struct CircuitTable {
    by_addr: HashMap<PeerAddr, u32>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: PeerAddr, circ_id: u32) {
        self.by_addr.insert(addr, circ_id);
    }

    pub fn remove(&mut self, addr: &PeerAddr) -> Option<u32> {
        self.by_addr.remove(addr)
    }

    pub fn circ_id_for(&self, addr: &PeerAddr) -> Option<u32> {
        self.by_addr.get(addr).copied()
    }

    pub fn addr_for(&self, circ_id: u32) -> Option<PeerAddr> {
        self.by_addr
            .iter()
            .find(|(_, &id)| id == circ_id)
            .map(|(addr, _)| addr.clone())
    }

    pub fn contains_circ_id(&self, circ_id: u32) -> bool {
        self.by_addr.values().any(|&id| id == circ_id)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

/// A client's per-hop symmetric keys for one circuit, indexed by hop
/// position. Ported from `sender_key_table` — the original keys by
/// `"circID:nodeNo"`; we key by `(circ_id, hop)` directly.
#[derive(Debug, Default)]
pub struct SenderKeyTable {
    keys: HashMap<(u32, usize), LayerKey>,
}

impl SenderKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, circ_id: u32, hop: usize, key: LayerKey) {
        self.keys.insert((circ_id, hop), key);
    }

    pub fn get(&self, circ_id: u32, hop: usize) -> Option<&LayerKey> {
        self.keys.get(&(circ_id, hop))
    }

    pub fn remove_circuit(&mut self, circ_id: u32) {
        self.keys.retain(|&(id, _), _| id != circ_id);
    }
}

/// A relay's per-circuit symmetric key, keyed by the circID the cell
/// arrived on. Ported from `node_key_table`.
#[derive(Debug, Default)]
pub struct NodeKeyTable {
    keys: HashMap<u32, LayerKey>,
}

impl NodeKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, circ_id: u32, key: LayerKey) {
        self.keys.insert(circ_id, key);
    }

    pub fn get(&self, circ_id: u32) -> Option<&LayerKey> {
        self.keys.get(&circ_id)
    }

    pub fn remove(&mut self, circ_id: u32) -> Option<LayerKey> {
        self.keys.remove(&circ_id)
    }

    pub fn contains(&self, circ_id: u32) -> bool {
        self.keys.contains_key(&circ_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A relay's forwarding table: which outbound circID a given inbound
/// circID relays onto, once `extend` has completed. Ported from
/// `node_relay_table`.
#[derive(Debug, Default)]
pub struct NodeRelayTable {
    forward: HashMap<u32, u32>,
}

impl NodeRelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from_id: u32, to_id: u32) {
        self.forward.insert(from_id, to_id);
    }

    pub fn dest_of(&self, from_id: u32) -> Option<u32> {
        self.forward.get(&from_id).copied()
    }

    pub fn origin_of(&self, dest_id: u32) -> Option<u32> {
        self.forward
            .iter()
            .find(|(_, &to)| to == dest_id)
            .map(|(&from, _)| from)
    }

    pub fn remove_either(&mut self, circ_id: u32) {
        self.forward.retain(|&from, &mut to| from != circ_id && to != circ_id);
    }

    pub fn contains_either(&self, circ_id: u32) -> bool {
        self.forward
            .iter()
            .any(|(&from, &to)| from == circ_id || to == circ_id)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_table_resolves_both_directions() {
        let mut t = CircuitTable::new();
        let addr: PeerAddr = ("127.0.0.1".to_string(), 9001);
        t.insert(addr.clone(), 42);
        assert_eq!(t.circ_id_for(&addr), Some(42));
        assert_eq!(t.addr_for(42), Some(addr.clone()));
        assert!(t.contains_circ_id(42));
        t.remove(&addr);
        assert_eq!(t.circ_id_for(&addr), None);
    }

    #[test]
    fn sender_key_table_is_keyed_by_circuit_and_hop() {
        let mut t = SenderKeyTable::new();
        t.insert(7, 0, [1u8; 32]);
        t.insert(7, 1, [2u8; 32]);
        assert_eq!(t.get(7, 0), Some(&[1u8; 32]));
        assert_eq!(t.get(7, 1), Some(&[2u8; 32]));
        t.remove_circuit(7);
        assert_eq!(t.get(7, 0), None);
    }

    #[test]
    fn node_relay_table_routes_in_both_directions() {
        let mut t = NodeRelayTable::new();
        t.insert(10, 20);
        assert_eq!(t.dest_of(10), Some(20));
        assert_eq!(t.origin_of(20), Some(10));
        assert!(t.contains_either(10));
        assert!(t.contains_either(20));
        t.remove_either(10);
        assert!(!t.contains_either(20));
    }
}
