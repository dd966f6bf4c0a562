//! Routing table from logical domain to secondary context.

use std::collections::HashMap;

use cross_relay_core::ContextHandle;
use parking_lot::RwLock;

/// Live routing table, populated by handshakes.
///
/// Holds exactly one handle per domain. Handles are non-owning, so an
/// entry may outlive its context until a fresh handshake replaces it or
/// the entry is forgotten.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: RwLock<HashMap<String, ContextHandle>>,
}

impl RoutingTable {
    /// Create an empty routing table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handle for `domain`, returning the old one.
    pub fn upsert(&self, domain: impl Into<String>, handle: ContextHandle) -> Option<ContextHandle> {
        self.entries.write().insert(domain.into(), handle)
    }

    /// Handle for `domain`.
    #[must_use]
    pub fn get(&self, domain: &str) -> Option<ContextHandle> {
        self.entries.read().get(domain).cloned()
    }

    /// Drop the entry for `domain`.
    pub fn forget(&self, domain: &str) -> Option<ContextHandle> {
        self.entries.write().remove(domain)
    }

    /// Snapshot of every entry, so sends happen without holding the lock.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, ContextHandle)> {
        self.entries
            .read()
            .iter()
            .map(|(d, h)| (d.clone(), h.clone()))
            .collect()
    }

    /// Known domains, sorted.
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.entries.read().keys().cloned().collect();
        domains.sort();
        domains
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
