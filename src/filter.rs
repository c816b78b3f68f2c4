use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Shared set of atom ids the ingress should parse in full.
///
/// The ingress consults this on every incoming atom, so reads are lock-free;
/// the processor swaps in a whole new set whenever the configuration set
/// changes. Atoms outside the set are decoded header-only.
pub struct EventFilter {
    enabled: AtomicBool,
    ids: ArcSwap<HashSet<i32>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            ids: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    /// Replaces the full-parse atom set.
    pub fn set_atom_ids(&self, ids: HashSet<i32>) {
        self.ids.store(Arc::new(ids));
    }

    /// Debug surfaces disable filtering to force full parsing of every atom.
    pub fn set_filtering_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the given atom should be parsed in full.
    pub fn test(&self, atom_id: i32) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return true;
        }
        self.ids.load().contains(&atom_id)
    }

    pub fn len(&self) -> usize {
        self.ids.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.load().is_empty()
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}
