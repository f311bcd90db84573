//! Endpoint table: candidate transport paths with per-path RTT history,
//! modeled as entries in a stable arena keyed by a small id rather than
//! shared pointers, so removal never invalidates the cursors held
//! elsewhere (`current`, `preferred_relay`, `peer_preferred_relay`).

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::types::EndpointKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u32);

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: u64,
    pub kind: EndpointKind,
    pub addr_v4: Option<Ipv4Addr>,
    pub addr_v6: Option<Ipv6Addr>,
    pub port: u16,
    pub peer_tag: [u8; 16],
    pub last_ping_time: f64,
    pub last_ping_seq: u32,
    pub rtts: [f64; 6],
    pub average_rtt: f64,
}

impl Endpoint {
    pub fn new(id: u64, kind: EndpointKind, addr_v4: Option<Ipv4Addr>, addr_v6: Option<Ipv6Addr>, port: u16, peer_tag: [u8; 16]) -> Self {
        Self {
            id,
            kind,
            addr_v4,
            addr_v6,
            port,
            peer_tag,
            last_ping_time: 0.0,
            last_ping_seq: 0,
            rtts: [0.0; 6],
            average_rtt: 0.0,
        }
    }

    /// Ring-push a fresh RTT sample (newest first) and recompute the mean
    /// of the nonzero entries.
    pub fn push_rtt(&mut self, sample: f64) {
        for i in (1..self.rtts.len()).rev() {
            self.rtts[i] = self.rtts[i - 1];
        }
        self.rtts[0] = sample;
        let (sum, count) = self.rtts.iter().fold((0.0, 0u32), |(s, c), &v| if v > 0.0 { (s + v, c + 1) } else { (s, c) });
        self.average_rtt = if count > 0 { sum / count as f64 } else { 0.0 };
    }

    pub fn clear_rtts(&mut self) {
        self.rtts = [0.0; 6];
        self.average_rtt = 0.0;
    }
}

/// Arena of endpoints plus the three named cursors, all stored as
/// optional ids rather than references.
#[derive(Default)]
pub struct EndpointTable {
    slots: Vec<Option<Endpoint>>,
    pub current: Option<EndpointId>,
    pub preferred_relay: Option<EndpointId>,
    pub peer_preferred_relay: Option<EndpointId>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, endpoint: Endpoint) -> EndpointId {
        self.slots.push(Some(endpoint));
        EndpointId((self.slots.len() - 1) as u32)
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, id: EndpointId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
        if self.current == Some(id) {
            self.current = None;
        }
        if self.preferred_relay == Some(id) {
            self.preferred_relay = None;
        }
        if self.peer_preferred_relay == Some(id) {
            self.peer_preferred_relay = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EndpointId, &Endpoint)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (EndpointId(i as u32), e)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EndpointId, &mut Endpoint)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|e| (EndpointId(i as u32), e)))
    }

    pub fn find_by_kind(&self, kind: EndpointKind) -> Option<EndpointId> {
        self.iter().find(|(_, e)| e.kind == kind).map(|(id, _)| id)
    }

    /// Drop every endpoint of the given kind (used when a fresh reflector
    /// reply or LAN-endpoint message supersedes the old candidate).
    pub fn remove_all_of_kind(&mut self, kind: EndpointKind) {
        let ids: Vec<EndpointId> = self.iter().filter(|(_, e)| e.kind == kind).map(|(id, _)| id).collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Replace the sole previous endpoint of `kind` (if any) with a new
    /// one, returning the new id. Used by both the P2P-INET reflector
    /// path and the `PKT_LAN_ENDPOINT` path.
    pub fn replace_kind(&mut self, kind: EndpointKind, new_endpoint: Endpoint) -> EndpointId {
        self.remove_all_of_kind(kind);
        self.insert(new_endpoint)
    }

    /// Minimum-RTT relay among all relays with a positive average RTT.
    pub fn best_relay(&self) -> Option<EndpointId> {
        self.iter()
            .filter(|(_, e)| e.kind.is_relay() && e.average_rtt > 0.0)
            .min_by(|(_, a), (_, b)| a.average_rtt.partial_cmp(&b.average_rtt).unwrap())
            .map(|(id, _)| id)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.current = None;
        self.preferred_relay = None;
        self.peer_preferred_relay = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn relay(id: u64) -> Endpoint {
        Endpoint::new(id, EndpointKind::UdpRelay, Some(Ipv4Addr::new(1, 2, 3, 4)), None, 9000, [0u8; 16])
    }

    #[test]
    fn removal_clears_cursors_without_invalidating_other_entries() {
        let mut table = EndpointTable::new();
        let a = table.insert(relay(1));
        let b = table.insert(relay(2));
        table.current = Some(a);
        table.preferred_relay = Some(a);
        table.remove(a);
        assert!(table.current.is_none());
        assert!(table.preferred_relay.is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn best_relay_picks_minimum_rtt() {
        let mut table = EndpointTable::new();
        let a = table.insert(relay(1));
        let b = table.insert(relay(2));
        table.get_mut(a).unwrap().push_rtt(0.2);
        table.get_mut(b).unwrap().push_rtt(0.05);
        assert_eq!(table.best_relay(), Some(b));
    }
}
