//! C3 — Registry.
//!
//! The process-wide address → tunnel routing table. Enforces exclusive
//! ownership of an address and the "only if still mine" unregister rule that
//! a lingering teardown racing a fresher registration depends on.

use std::sync::Arc;

use dashmap::DashMap;

use crate::address::AgentAddress;
use crate::tunnel::{Tunnel, TunnelId};

#[derive(Default)]
pub struct Registry {
    by_address: DashMap<AgentAddress, Arc<Tunnel>>,
    by_id: DashMap<TunnelId, Arc<Tunnel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once when a tunnel's socket is accepted, before any address is
    /// bound, so `active_tunnels` reflects connected-but-unauthenticated
    /// sockets too.
    pub fn insert_tunnel(&self, tunnel: Arc<Tunnel>) {
        self.by_id.insert(tunnel.id().clone(), tunnel);
    }

    pub fn remove_tunnel(&self, id: &TunnelId) {
        self.by_id.remove(id);
    }

    /// Binds `address` to `tunnel` unless it is already bound to a
    /// *different* tunnel (first-bound wins).
    pub fn register(&self, tunnel: &Arc<Tunnel>, address: AgentAddress) -> bool {
        match self.by_address.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                existing.get().id() == tunnel.id()
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tunnel.clone());
                true
            }
        }
    }

    /// Removes `address`'s binding only if it still points at `tunnel` —
    /// the conditional-remove rule that prevents a lingering teardown from
    /// evicting a newer owner's binding.
    pub fn unregister(&self, tunnel: &Arc<Tunnel>, address: &AgentAddress) {
        if let dashmap::mapref::entry::Entry::Occupied(existing) = self.by_address.entry(address.clone()) {
            if existing.get().id() == tunnel.id() {
                existing.remove();
            }
        }
    }

    pub fn lookup(&self, address: &AgentAddress) -> Option<Arc<Tunnel>> {
        self.by_address.get(address).map(|entry| entry.clone())
    }

    pub fn active_tunnels(&self) -> usize {
        self.by_id.len()
    }

    pub fn active_agents(&self) -> usize {
        self.by_address.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Tunnel;

    fn test_tunnel() -> Arc<Tunnel> {
        Tunnel::new_for_test().0
    }

    fn addr(n: u8) -> AgentAddress {
        AgentAddress::parse(&format!("0x{:040x}", n)).unwrap()
    }

    #[test]
    fn second_tunnel_cannot_steal_a_bound_address() {
        let registry = Registry::new();
        let t1 = test_tunnel();
        let t2 = test_tunnel();
        let a = addr(1);

        assert!(registry.register(&t1, a.clone()));
        assert!(!registry.register(&t2, a.clone()));
        assert_eq!(registry.lookup(&a).unwrap().id(), t1.id());
    }

    #[test]
    fn stale_teardown_does_not_evict_newer_owner() {
        let registry = Registry::new();
        let t1 = test_tunnel();
        let t2 = test_tunnel();
        let a = addr(2);

        assert!(registry.register(&t1, a.clone()));
        registry.unregister(&t1, &a); // t1 gives it up (remove_agent)
        assert!(registry.register(&t2, a.clone()));

        // A late teardown of t1 must not evict t2's binding.
        registry.unregister(&t1, &a);
        assert_eq!(registry.lookup(&a).unwrap().id(), t2.id());
    }

    #[test]
    fn unregister_of_unowned_address_is_a_no_op() {
        let registry = Registry::new();
        let t1 = test_tunnel();
        let a = addr(3);
        registry.unregister(&t1, &a);
        assert!(registry.lookup(&a).is_none());
    }

    #[test]
    fn active_counts_reflect_both_maps() {
        let registry = Registry::new();
        let t1 = test_tunnel();
        registry.insert_tunnel(t1.clone());
        registry.register(&t1, addr(4));
        registry.register(&t1, addr(5));
        assert_eq!(registry.active_tunnels(), 1);
        assert_eq!(registry.active_agents(), 2);
    }
}
