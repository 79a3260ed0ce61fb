//! Interrupt-source subscriptions of one module.
//!
//! For each of the module's sources the registry keeps the set of clients
//! connected to it, plus the aggregate enabled mask (every source with at
//! least one subscriber). The owning module guards it with a spin lock so
//! the interrupt path can read it without blocking.

use skel_common::consts::MAX_INTERRUPTS;
use skel_common::driver::types::{mask_bits, ClientId, ClientSet};

/// Source → subscriber-set table with its aggregate mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRegistry {
    subscribers: [ClientSet; MAX_INTERRUPTS],
    enabled: u32,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Registry with no subscriptions.
    pub const fn new() -> Self {
        Self {
            subscribers: [ClientSet::EMPTY; MAX_INTERRUPTS],
            enabled: 0,
        }
    }

    /// Subscribe `client` to every source in `mask`. Returns the new
    /// aggregate mask.
    pub fn connect(&mut self, client: ClientId, mask: u32) -> u32 {
        for bit in mask_bits(mask) {
            self.subscribers[bit].insert(client);
        }
        self.enabled |= mask;
        self.enabled
    }

    /// Unsubscribe `client` from the sources in `mask` (0 = every source it
    /// is on). Returns the new aggregate mask.
    pub fn disconnect(&mut self, client: ClientId, mask: u32) -> u32 {
        let mask = if mask == 0 { u32::MAX } else { mask };
        for bit in mask_bits(mask) {
            let set = &mut self.subscribers[bit];
            if set.remove(client) && set.is_empty() {
                self.enabled &= !(1 << bit);
            }
        }
        self.enabled
    }

    /// Clients subscribed to source number `source`.
    pub fn active_subscribers(&self, source: usize) -> ClientSet {
        self.subscribers
            .get(source)
            .copied()
            .unwrap_or(ClientSet::EMPTY)
    }

    /// Sources `client` is subscribed to.
    pub fn connections_of(&self, client: ClientId) -> u32 {
        self.subscribers
            .iter()
            .enumerate()
            .filter(|(_, set)| set.contains(client))
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }

    /// Aggregate enabled mask.
    pub fn enabled_mask(&self) -> u32 {
        self.enabled
    }

    /// Whether the aggregate mask equals the union of non-empty sources.
    pub fn is_consistent(&self) -> bool {
        let union = self
            .subscribers
            .iter()
            .enumerate()
            .filter(|(_, set)| !set.is_empty())
            .fold(0u32, |mask, (bit, _)| mask | (1 << bit));
        union == self.enabled
    }
}
