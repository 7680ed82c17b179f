use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::debug;

use crate::models::{AppointmentSlot, ScanResult, TimePreferences};

/// Slots already seen, per location, keyed by `raw_key` and remembering the slot date for pruning.
#[derive(Debug, Clone, Default)]
pub struct SeenSlotRegistry {
    seen: HashMap<u32, HashMap<String, NaiveDate>>,
}

impl SeenSlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, slot: &AppointmentSlot) -> bool {
        self.seen
            .get(&slot.location_id)
            .is_some_and(|keys| keys.contains_key(slot.raw_key()))
    }

    /// Returns `true` if the slot had not been seen before.
    pub fn insert(&mut self, slot: &AppointmentSlot) -> bool {
        self.seen
            .entry(slot.location_id)
            .or_default()
            .insert(slot.raw_key().to_string(), slot.date)
            .is_none()
    }

    /// Forget every slot dated before `today`. Returns how many were removed.
    pub fn prune_before(&mut self, today: NaiveDate) -> usize {
        let mut removed = 0;
        for keys in self.seen.values_mut() {
            let before = keys.len();
            keys.retain(|_, date| *date >= today);
            removed += before - keys.len();
        }
        self.seen.retain(|_, keys| !keys.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns a cycle's scan results into the slots worth notifying about.
#[derive(Debug, Clone, Default)]
pub struct SlotTracker {
    registry: SeenSlotRegistry,
}

impl SlotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SeenSlotRegistry {
        &self.registry
    }

    /// Register unseen slots from successful results and return the ones matching `prefs`.
    ///
    /// Running the same results through twice yields nothing the second time.
    pub fn process(
        &mut self,
        results: &[ScanResult],
        prefs: &TimePreferences,
        today: NaiveDate,
    ) -> Vec<AppointmentSlot> {
        let mut matches = Vec::new();

        for result in results.iter().filter(|r| r.success) {
            for slot in &result.slots {
                if slot.date < today {
                    continue;
                }
                if self.registry.insert(slot) && prefs.matches(slot) {
                    matches.push(slot.clone());
                }
            }
        }

        let pruned = self.registry.prune_before(today);
        if pruned > 0 {
            debug!("Pruned {} past slot(s) from the registry", pruned);
        }

        matches
    }
}
