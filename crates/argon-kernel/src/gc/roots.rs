//! Precise root discovery
//!
//! Roots are memory slots holding references: frame slots enumerated by
//! stackmaps (walked from each stopped thread's recorded origins),
//! static-region slots, and the finalizer queue. Slots are deduplicated
//! by address so the adjust phase rewrites each exactly once. Handle
//! table targets are adjusted through their own accessor and do not
//! appear here.
//!
//! A conservative scanner would be incompatible with compaction; every
//! slot here is known to hold either null or a valid reference.

use crate::eh::FrameWalker;
use crate::jit::code_heap::CodeHeap;
use crate::jit::tables::RefLocation;
use crate::loader::LoadedModule;
use crate::sched::{ThreadRecord, ThreadState};
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// One root slot.
#[derive(Debug, Clone, Copy)]
pub struct RootSlot {
    /// Address of the slot holding the reference.
    pub addr: *mut usize,
    /// Whether the slot holds an interior pointer.
    pub interior: bool,
}

/// The deduplicated root set.
#[derive(Default)]
pub struct RootSet {
    slots: Vec<RootSlot>,
    seen: FxHashSet<usize>,
}

impl RootSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slot, ignoring duplicates.
    pub fn add(&mut self, addr: *mut usize, interior: bool) {
        if self.seen.insert(addr as usize) {
            self.slots.push(RootSlot { addr, interior });
        }
    }

    /// All collected slots.
    pub fn slots(&self) -> &[RootSlot] {
        &self.slots
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Walk origins for one stopped thread.
///
/// # Safety
///
/// The thread must be off-CPU (stop-the-world), so its saved context is
/// stable.
pub(crate) unsafe fn origins_for(thread: &Arc<ThreadRecord>) -> Vec<(usize, usize)> {
    let mut origins = thread.walk_origins();
    match thread.state() {
        ThreadState::Waiting | ThreadState::Runnable => {
            let ctx = &*thread.context.get();
            if ctx.gpr[argon_hal::cpu::gpr::RBP] != 0 || ctx.rip != 0 {
                origins.push((ctx.rip as usize, ctx.gpr[argon_hal::cpu::gpr::RBP] as usize));
            }
        }
        _ => {}
    }
    origins
}

/// Collect the frame roots of one thread from one walk origin.
///
/// Panics if a managed frame's PC has no stackmap record: that is a
/// broken runtime invariant, not a workload error.
pub(crate) fn collect_frame_roots(
    code_heap: &CodeHeap,
    pc: usize,
    rbp: usize,
    set: &mut RootSet,
) {
    for frame in FrameWalker::new(code_heap, pc, rbp) {
        let code = frame
            .md
            .compiled()
            .expect("walked frame of uncompiled method");
        let offset = code.offset_of(frame.pc);
        let entry = code.stackmap.at(offset).unwrap_or_else(|| {
            panic!(
                "stackmap missing at safepoint {}+{:#x}",
                frame.md.name, offset
            )
        });
        for slot in &entry.refs {
            match slot.loc {
                RefLocation::Frame(disp) => {
                    let addr = (frame.rbp as i64 + disp as i64) as *mut usize;
                    set.add(addr, slot.interior);
                }
                RefLocation::Register(_) => {
                    // The tier-0 generator keeps no references in
                    // registers across safepoints
                    panic!("register reference at safepoint in {}", frame.md.name);
                }
            }
        }
    }
}

/// Collect every root slot: thread frames and static regions.
pub(crate) fn collect_roots(
    code_heap: &CodeHeap,
    threads: &[Arc<ThreadRecord>],
    modules: &[&'static LoadedModule],
) -> RootSet {
    let mut set = RootSet::new();
    for thread in threads {
        if matches!(
            thread.state(),
            ThreadState::Terminating | ThreadState::Finalized
        ) {
            continue;
        }
        // Safety: the world is stopped
        let origins = unsafe { origins_for(thread) };
        for (pc, rbp) in origins {
            collect_frame_roots(code_heap, pc, rbp, &mut set);
        }
    }
    for module in modules {
        if let Some(region) = module.statics() {
            for &offset in &region.ref_offsets {
                let addr = (region.base() + offset as usize) as *mut usize;
                set.add(addr, false);
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::jit::tables::{CompiledCode, EhTable, SafepointEntry, SlotRef, StackMap};

    #[test]
    fn test_root_set_dedupes() {
        let mut set = RootSet::new();
        let mut slot = 0usize;
        set.add(&mut slot, false);
        set.add(&mut slot, false);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_frame_roots_from_stackmap() {
        let code_heap = CodeHeap::new(*SERVICES);
        let md = crate::eh::frames::tests::dummy_method("m");
        let addr = code_heap.publish(&[0x90; 32], Some(md)).unwrap();
        md.compiled
            .set(CompiledCode {
                code_ptr: addr,
                code_size: 32,
                entry_offset: 0,
                frame_size: 48,
                stackmap: StackMap::new(vec![SafepointEntry {
                    code_offset: 8,
                    refs: vec![
                        SlotRef {
                            loc: RefLocation::Frame(-8),
                            interior: false,
                        },
                        SlotRef {
                            loc: RefLocation::Frame(-24),
                            interior: true,
                        },
                    ],
                }]),
                eh: EhTable::default(),
            })
            .ok()
            .unwrap();

        // Fake frame: [rbp]=0 sentinel, slots below it
        let mut stack = vec![0usize; 8];
        let rbp = (stack.as_mut_ptr() as usize) + 32;
        stack[2] = 0xAAA0; // rbp-16? (offset -8 => rbp-8 = base+24 => index 3)
        let _ = &mut stack;

        let mut set = RootSet::new();
        collect_frame_roots(&code_heap, addr + 8, rbp, &mut set);
        assert_eq!(set.len(), 2);
        let interior: Vec<bool> = set.slots().iter().map(|s| s.interior).collect();
        assert_eq!(interior, vec![false, true]);
        assert_eq!(set.slots()[0].addr as usize, rbp - 8);
        assert_eq!(set.slots()[1].addr as usize, rbp - 24);
    }

    #[test]
    #[should_panic(expected = "stackmap missing")]
    fn test_missing_stackmap_is_an_invariant_break() {
        let code_heap = CodeHeap::new(*SERVICES);
        let md = crate::eh::frames::tests::dummy_method("bad");
        let addr = code_heap.publish(&[0x90; 16], Some(md)).unwrap();
        md.compiled
            .set(CompiledCode {
                code_ptr: addr,
                code_size: 16,
                entry_offset: 0,
                frame_size: 16,
                stackmap: StackMap::default(),
                eh: EhTable::default(),
            })
            .ok()
            .unwrap();
        let mut stack = [0usize; 4];
        let rbp = stack.as_mut_ptr() as usize;
        let mut set = RootSet::new();
        collect_frame_roots(&code_heap, addr + 4, rbp, &mut set);
    }
}
