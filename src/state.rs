use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::event::LogEvent;

/// Cross-cutting device state derived from state atoms.
///
/// Managers register the state atoms their metric conditions reference;
/// the processor feeds every event through here before fan-out so state
/// transitions are visible to all configurations at the same point in the
/// stream. Producers consult `state_value` when a metric carries a
/// condition.
pub struct StateManager {
    /// atom id -> (group -> state value). Single-field state atoms use
    /// group 0; otherwise the group is field 1 and the state the last
    /// field.
    states: RwLock<HashMap<i32, HashMap<i64, i32>>>,
    registered_atoms: RwLock<HashSet<i32>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            registered_atoms: RwLock::new(HashSet::new()),
        }
    }

    /// Registers an atom id as a state atom to track.
    pub fn register_state_atom(&self, atom_id: i32) {
        self.registered_atoms.write().insert(atom_id);
    }

    pub fn on_log_event(&self, event: &LogEvent) {
        if !self.registered_atoms.read().contains(&event.atom_id()) {
            return;
        }
        let size = event.size();
        if size == 0 {
            return;
        }
        let (group, state) = if size == 1 {
            let Ok(state) = event.long(1) else {
                return;
            };
            (0, state)
        } else {
            let (Ok(group), Ok(state)) = (event.long(1), event.long(size)) else {
                return;
            };
            (group, state)
        };
        self.states
            .write()
            .entry(event.atom_id())
            .or_default()
            .insert(group, state as i32);
    }

    /// Current state value for (atom, group), or -1 when unknown.
    pub fn state_value(&self, atom_id: i32, group: i64) -> i32 {
        self.states
            .read()
            .get(&atom_id)
            .and_then(|groups| groups.get(&group))
            .copied()
            .unwrap_or(-1)
    }

    pub fn add_all_atom_ids(&self, set: &mut HashSet<i32>) {
        set.extend(self.registered_atoms.read().iter().copied());
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
