//! GC handle table
//!
//! Strong handles keep objects alive across safepoints for runtime code
//! that cannot appear in any stackmap. Pinning handles additionally fix
//! the object's address for the compactor. The whole table is a GC root.

use crate::object::GcRef;
use parking_lot::Mutex;

/// Index of a handle in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

/// What a handle does beyond keeping its target alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Keep alive; the target may move.
    Strong,
    /// Keep alive and pinned in place.
    Pinned,
}

struct HandleSlot {
    target: GcRef,
    kind: HandleKind,
}

/// Table of GC handles.
#[derive(Default)]
pub struct HandleTable {
    slots: Mutex<HandleSlots>,
}

#[derive(Default)]
struct HandleSlots {
    entries: Vec<Option<HandleSlot>>,
    free: Vec<usize>,
}

impl HandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for `target`.
    pub fn create(&self, target: GcRef, kind: HandleKind) -> Handle {
        if kind == HandleKind::Pinned {
            target.header().set_pinned(true);
        }
        let mut slots = self.slots.lock();
        let slot = HandleSlot { target, kind };
        match slots.free.pop() {
            Some(index) => {
                slots.entries[index] = Some(slot);
                Handle(index)
            }
            None => {
                slots.entries.push(Some(slot));
                Handle(slots.entries.len() - 1)
            }
        }
    }

    /// The current target of a handle.
    pub fn get(&self, handle: Handle) -> Option<GcRef> {
        self.slots.lock().entries[handle.0].as_ref().map(|s| s.target)
    }

    /// Release a handle. Unpins the target if this was a pinning handle.
    pub fn drop_handle(&self, handle: Handle) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.entries[handle.0].take() {
            if slot.kind == HandleKind::Pinned {
                slot.target.header().set_pinned(false);
            }
            slots.free.push(handle.0);
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.entries.len() - slots.free.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every handle target (mark roots).
    pub(crate) fn for_each_target(&self, mut f: impl FnMut(GcRef)) {
        for slot in self.slots.lock().entries.iter().flatten() {
            f(slot.target);
        }
    }

    /// Rewrite every handle target through the forwarding map (adjust
    /// phase).
    pub(crate) fn adjust_targets(&self, mut forward: impl FnMut(GcRef) -> GcRef) {
        for slot in self.slots.lock().entries.iter_mut().flatten() {
            slot.target = forward(slot.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::gc::Heap;
    use crate::types::TypeRegistry;

    #[test]
    fn test_handle_create_get_drop() {
        let reg = TypeRegistry::new();
        let heap = Heap::new(*SERVICES);
        let table = HandleTable::new();
        let obj = heap.alloc_object(reg.object()).unwrap();

        let h = table.create(obj, HandleKind::Strong);
        assert_eq!(table.get(h), Some(obj));
        assert_eq!(table.len(), 1);

        table.drop_handle(h);
        assert_eq!(table.get(h), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_pinned_handle_sets_and_clears_pin_bit() {
        let reg = TypeRegistry::new();
        let heap = Heap::new(*SERVICES);
        let table = HandleTable::new();
        let obj = heap.alloc_object(reg.object()).unwrap();

        let h = table.create(obj, HandleKind::Pinned);
        assert!(obj.header().is_pinned());
        table.drop_handle(h);
        assert!(!obj.header().is_pinned());
    }

    #[test]
    fn test_slots_are_reused() {
        let reg = TypeRegistry::new();
        let heap = Heap::new(*SERVICES);
        let table = HandleTable::new();
        let obj = heap.alloc_object(reg.object()).unwrap();

        let h1 = table.create(obj, HandleKind::Strong);
        table.drop_handle(h1);
        let h2 = table.create(obj, HandleKind::Strong);
        assert_eq!(h1.0, h2.0);
    }
}
