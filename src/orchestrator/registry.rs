//! Ordered destination registry with the round-robin cursor

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::slot::DestinationSlot;

/// Cursor sentinel: no assignment has been made yet this run.
const CURSOR_END: usize = usize::MAX;

/// Ordered set of configured destinations.
///
/// Iteration order is configuration order, which makes round-robin
/// fairness deterministic. The registry itself only changes in
/// `configure`/`scrap`; the cursor moves on every assignment.
pub struct DestinationRegistry {
    slots: Vec<Arc<DestinationSlot>>,
    by_name: HashMap<String, usize>,
    last_assignment_cursor: AtomicUsize,
}

impl Default for DestinationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_name: HashMap::new(),
            last_assignment_cursor: AtomicUsize::new(CURSOR_END),
        }
    }

    /// Register a destination, keeping insertion order. Re-inserting a
    /// name replaces the slot in place.
    pub fn insert(&mut self, slot: Arc<DestinationSlot>) {
        match self.by_name.get(slot.name()) {
            Some(&index) => self.slots[index] = slot,
            None => {
                self.by_name.insert(slot.name().to_string(), self.slots.len());
                self.slots.push(slot);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<DestinationSlot>> {
        self.by_name.get(name).map(|&index| &self.slots[index])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Destinations in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DestinationSlot>> {
        self.slots.iter()
    }

    pub fn slot_at(&self, index: usize) -> &Arc<DestinationSlot> {
        &self.slots[index]
    }

    /// First index the selection loop should probe: one past the last
    /// assignment, wrapping; the first destination when no assignment has
    /// been made yet.
    pub fn probe_start(&self) -> usize {
        match self.last_assignment_cursor.load(Ordering::SeqCst) {
            CURSOR_END => 0,
            index => (index + 1) % self.slots.len(),
        }
    }

    pub fn advance_cursor_to(&self, index: usize) {
        self.last_assignment_cursor.store(index, Ordering::SeqCst);
    }

    pub fn reset_cursor(&self) {
        self.last_assignment_cursor.store(CURSOR_END, Ordering::SeqCst);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_name.clear();
        self.reset_cursor();
    }
}
