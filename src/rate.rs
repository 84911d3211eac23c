use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Capacity of the validated-address cache
const VALIDATED_ADDR_CAPACITY: usize = 100;

/// Per-peer accounting backing the dispatcher's exhaustion defenses:
/// how many sessions a peer currently has, how many stateless resets it
/// has been sent, and which peers recently proved their address.
pub(crate) struct RateTables {
    conns: HashMap<SocketAddr, u32>,
    resets: HashMap<SocketAddr, u32>,
    validated: LruCache<SocketAddr, ()>,
}

impl RateTables {
    pub(crate) fn new() -> Self {
        Self {
            conns: HashMap::new(),
            resets: HashMap::new(),
            validated: LruCache::new(NonZeroUsize::new(VALIDATED_ADDR_CAPACITY).unwrap()),
        }
    }

    pub(crate) fn inc_conns(&mut self, peer: SocketAddr) {
        *self.conns.entry(peer).or_insert(0) += 1;
    }

    pub(crate) fn dec_conns(&mut self, peer: &SocketAddr) {
        match self.conns.entry(*peer) {
            Entry::Occupied(mut e) => {
                *e.get_mut() -= 1;
                if *e.get() == 0 {
                    e.remove_entry();
                }
            }
            Entry::Vacant(_) => debug_assert!(false, "decrement for an untracked peer"),
        }
    }

    pub(crate) fn current_conns(&self, peer: &SocketAddr) -> u32 {
        self.conns.get(peer).copied().unwrap_or(0)
    }

    pub(crate) fn inc_resets(&mut self, peer: SocketAddr) {
        *self.resets.entry(peer).or_insert(0) += 1;
    }

    pub(crate) fn current_resets(&self, peer: &SocketAddr) -> u32 {
        self.resets.get(peer).copied().unwrap_or(0)
    }

    /// Records a proven address, promoting it if already present.
    pub(crate) fn set_validated(&mut self, peer: SocketAddr) {
        self.validated.put(peer, ());
    }

    /// Queries without promoting.
    pub(crate) fn is_validated(&self, peer: &SocketAddr) -> bool {
        self.validated.contains(peer)
    }
}
