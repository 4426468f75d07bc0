//! Stop-the-world mark-sweep-compact collector
//!
//! Lisp-2 over the small-object slabs: mark from precise roots, plan
//! forwarding addresses packed toward each slab base (pinned objects
//! stay put and moved objects pack around them), adjust every reference
//! slot, then slide objects in one forward pass. The large-object list
//! is swept without compaction. Interior pointers are adjusted by their
//! containing object's delta.

use super::finalizer::FinalizerQueue;
use super::handles::HandleTable;
use super::header::ObjHeader;
use super::heap::{Heap, Slab};
use super::roots::{collect_roots, RootSet};
use crate::jit::code_heap::CodeHeap;
use crate::loader::LoadedModule;
use crate::object::GcRef;
use crate::sched::{Scheduler, ThreadRecord};
use crate::types::TypeKind;
use argon_hal::KernelServices;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;

/// Statistics across collections.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total collections.
    pub collections: usize,
    /// Total objects freed.
    pub objects_freed: usize,
    /// Total bytes freed (SOH + LOH).
    pub bytes_freed: usize,
    /// Total pause time in nanoseconds.
    pub total_pause_ns: u64,
    /// Last pause in nanoseconds.
    pub last_pause_ns: u64,
    /// Longest pause in nanoseconds.
    pub max_pause_ns: u64,
    /// Objects marked in the last collection.
    pub last_marked: usize,
    /// Objects freed in the last collection.
    pub last_freed: usize,
    /// Live SOH bytes after the last collection.
    pub live_bytes: usize,
}

/// Outcome of one collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionOutcome {
    /// Objects marked (== objects retained on the SOH and LOH).
    pub marked: usize,
    /// SOH objects freed.
    pub freed_objects: usize,
    /// SOH bytes freed.
    pub freed_bytes: usize,
    /// LOH regions unmapped.
    pub loh_freed_regions: usize,
    /// LOH bytes unmapped.
    pub loh_freed_bytes: usize,
    /// Objects moved onto the finalizer queue.
    pub queued_finalizable: usize,
}

struct Planned {
    obj: usize,
    size: usize,
    dest: usize,
    seed: usize,
}

/// The collector.
pub struct Collector {
    heap: &'static Heap,
    code_heap: &'static CodeHeap,
    handles: &'static HandleTable,
    services: KernelServices,
    /// Finalization queue shared with the finalizer thread.
    pub finalizer: FinalizerQueue,
    stats: Mutex<GcStats>,
}

impl Collector {
    /// Create a collector over the given heap.
    pub fn new(
        heap: &'static Heap,
        code_heap: &'static CodeHeap,
        handles: &'static HandleTable,
        services: KernelServices,
    ) -> Self {
        Self {
            heap,
            code_heap,
            handles,
            services,
            finalizer: FinalizerQueue::new(),
            stats: Mutex::new(GcStats::default()),
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Run a full collection: rendezvous, collect, resume.
    ///
    /// `coordinator` is the triggering thread with its managed walk
    /// origin (the allocation site's frame).
    pub fn collect(
        &self,
        scheduler: &Scheduler,
        modules: &[&'static LoadedModule],
        coordinator: Option<(&ThreadRecord, usize, usize)>,
    ) -> CollectionOutcome {
        if let Some((thread, pc, rbp)) = coordinator {
            thread.set_parked_walk(pc, rbp);
        }
        scheduler.stop_the_world(coordinator.map(|(t, _, _)| t));

        let threads = scheduler.threads();
        let roots = collect_roots(self.code_heap, &threads, modules);
        let outcome = unsafe { self.collect_stopped(roots, modules, &threads) };

        scheduler.resume_the_world();
        if let Some((thread, _, _)) = coordinator {
            thread.clear_parked_walk();
        }
        outcome
    }

    /// Collect with the world already stopped and roots gathered.
    ///
    /// # Safety
    ///
    /// Every mutator must be stopped; `roots` must enumerate every live
    /// reference slot not reachable through handles, statics or the
    /// finalizer queue.
    pub(crate) unsafe fn collect_stopped(
        &self,
        roots: RootSet,
        _modules: &[&'static LoadedModule],
        threads: &[std::sync::Arc<ThreadRecord>],
    ) -> CollectionOutcome {
        let started = self.services.timer.now_ns();
        let pre_soh = self.heap.soh_used();
        let mut outcome = CollectionOutcome::default();

        // ===== Mark =====
        let mut marked = 0usize;
        let mut work: Vec<GcRef> = Vec::new();
        for slot in roots.slots() {
            let value = slot.addr.read();
            if value == 0 {
                continue;
            }
            let obj = if slot.interior {
                match self.containing_object(value) {
                    Some(obj) => obj,
                    None => panic!("interior root {value:#x} points outside the heap"),
                }
            } else {
                GcRef::from_word(value).unwrap()
            };
            self.mark_and_trace(obj, &mut work, &mut marked);
        }
        self.handles
            .for_each_target(|obj| self.mark_and_trace(obj, &mut work, &mut marked));
        self.finalizer
            .for_each(|obj| self.mark_and_trace(obj, &mut work, &mut marked));

        // ===== Finalization scan: resurrect the newly unreachable =====
        let candidates = self.heap.take_finalizable();
        let mut survivors = Vec::new();
        let mut queued = Vec::new();
        for obj in candidates {
            if obj.header().is_marked() {
                survivors.push(obj);
            } else {
                self.mark_and_trace(obj, &mut work, &mut marked);
                queued.push(obj);
            }
        }
        outcome.queued_finalizable = queued.len();
        self.heap.put_finalizable(survivors);
        self.finalizer.enqueue_all(queued);

        outcome.marked = marked;

        // ===== Plan (Lisp-2 forwarding, per slab) =====
        let slabs = self.heap.slabs();
        let mut plan: Vec<Planned> = Vec::new();
        let mut new_used: Vec<usize> = Vec::with_capacity(slabs.len());
        let mut zero_ranges: Vec<(usize, usize)> = Vec::new();
        for slab in &slabs {
            let (used, freed_objs, freed_bytes) =
                self.plan_slab(slab, &mut plan, &mut zero_ranges);
            new_used.push(used);
            outcome.freed_objects += freed_objs;
            outcome.freed_bytes += freed_bytes;
        }

        // ===== Adjust =====
        for slot in roots.slots() {
            let value = slot.addr.read();
            if value == 0 {
                continue;
            }
            let adjusted = if slot.interior {
                self.forward_interior(value)
            } else {
                self.forward_address(value)
            };
            slot.addr.write(adjusted);
        }
        self.handles.adjust_targets(|obj| {
            GcRef::from_word(self.forward_address(obj.addr())).unwrap()
        });
        self.finalizer.adjust(|obj| {
            GcRef::from_word(self.forward_address(obj.addr())).unwrap()
        });
        for thread in threads {
            let current = thread.current_exception.load(Ordering::Relaxed);
            if current != 0 {
                thread
                    .current_exception
                    .store(self.forward_address(current), Ordering::Relaxed);
            }
        }
        // Fields of every surviving object, old addresses still valid
        for planned in &plan {
            let obj = GcRef::from_ptr(planned.obj as *mut u8).unwrap();
            self.adjust_fields(obj);
        }
        self.heap.for_each_loh_object(|obj| {
            if obj.header().is_marked() {
                self.adjust_fields(obj);
            }
        });

        // ===== Compact =====
        for planned in &plan {
            if planned.dest != planned.obj {
                std::ptr::copy(
                    planned.obj as *const u8,
                    planned.dest as *mut u8,
                    planned.size,
                );
            }
            ObjHeader::at(planned.dest as *mut u8).restore_after_move(planned.seed);
        }
        for (start, end) in &zero_ranges {
            std::ptr::write_bytes(*start as *mut u8, 0, end - start);
        }
        self.heap.set_slab_usage(&new_used);

        // ===== LOH sweep =====
        let (loh_regions, loh_bytes) = self.heap.sweep_loh();
        outcome.loh_freed_regions = loh_regions;
        outcome.loh_freed_bytes = loh_bytes;

        self.heap.reset_trigger();

        let pause = self.services.timer.now_ns().saturating_sub(started);
        let mut stats = self.stats.lock();
        stats.collections += 1;
        stats.objects_freed += outcome.freed_objects;
        stats.bytes_freed += outcome.freed_bytes + outcome.loh_freed_bytes;
        stats.total_pause_ns += pause;
        stats.last_pause_ns = pause;
        stats.max_pause_ns = stats.max_pause_ns.max(pause);
        stats.last_marked = outcome.marked;
        stats.last_freed = outcome.freed_objects;
        stats.live_bytes = pre_soh - outcome.freed_bytes;
        log::debug!(
            "gc: marked {} freed {} objects / {} bytes (loh {} bytes)",
            outcome.marked,
            outcome.freed_objects,
            outcome.freed_bytes,
            outcome.loh_freed_bytes
        );
        outcome
    }

    fn containing_object(&self, addr: usize) -> Option<GcRef> {
        // Safety: quiescent heap
        unsafe {
            self.heap
                .find_containing_object(addr)
                .or_else(|| self.heap.loh_object_containing(addr))
        }
    }

    fn mark_and_trace(&self, obj: GcRef, work: &mut Vec<GcRef>, marked: &mut usize) {
        if obj.header().mark() {
            *marked += 1;
            work.push(obj);
        }
        while let Some(obj) = work.pop() {
            self.trace(obj, work, marked);
        }
    }

    fn trace(&self, obj: GcRef, work: &mut Vec<GcRef>, marked: &mut usize) {
        let td = obj.td();
        // Safety: obj is a live object under stop-the-world
        unsafe {
            if td.kind == TypeKind::Array && td.element.unwrap().is_reference_like() {
                let len = obj.length();
                for i in 0..len {
                    let slot = obj.element_ptr(i) as *const usize;
                    if let Some(child) = GcRef::from_word(slot.read()) {
                        if child.header().mark() {
                            *marked += 1;
                            work.push(child);
                        }
                    }
                }
            }
            for &off in td.ref_offsets() {
                if let Some(child) = obj.read_ref(off) {
                    if child.header().mark() {
                        *marked += 1;
                        work.push(child);
                    }
                }
            }
        }
    }

    /// Plan one slab: assign forwarding addresses, record zero ranges.
    ///
    /// Returns (new bump offset, freed object count, freed bytes).
    unsafe fn plan_slab(
        &self,
        slab: &Slab,
        plan: &mut Vec<Planned>,
        zero_ranges: &mut Vec<(usize, usize)>,
    ) -> (usize, usize, usize) {
        let mut cursor = slab.base;
        let top = slab.top();
        let mut dest = slab.base;
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        let mut live_end = slab.base;

        while cursor < top {
            if (cursor as *const usize).read() == 0 {
                cursor += 8;
                continue;
            }
            let obj = GcRef::from_ptr(cursor as *mut u8).unwrap();
            let size = obj.object_size();
            let header = obj.header();
            if !header.is_marked() {
                freed_objects += 1;
                freed_bytes += size;
                cursor += size;
                continue;
            }
            let mut seed = 0;
            if header.is_pinned() {
                if dest < cursor {
                    zero_ranges.push((dest, cursor));
                }
                header.set_forwarding(cursor, &mut seed);
                plan.push(Planned {
                    obj: cursor,
                    size,
                    dest: cursor,
                    seed,
                });
                dest = cursor + size;
            } else {
                header.set_forwarding(dest, &mut seed);
                plan.push(Planned {
                    obj: cursor,
                    size,
                    dest,
                    seed,
                });
                dest += size;
            }
            live_end = dest;
            cursor += size;
        }

        let used = live_end - slab.base;
        if live_end < slab.top() {
            zero_ranges.push((live_end, slab.top()));
        }
        (used, freed_objects, freed_bytes)
    }

    fn forward_address(&self, addr: usize) -> usize {
        // Safety: quiescent heap; addr is a live object
        let header = unsafe { ObjHeader::at(addr as *mut u8) };
        header.forwarding().unwrap_or(addr)
    }

    fn forward_interior(&self, addr: usize) -> usize {
        match self.containing_object(addr) {
            Some(obj) => {
                let base = obj.addr();
                let forwarded = self.forward_address(base);
                addr - base + forwarded
            }
            None => addr,
        }
    }

    fn adjust_fields(&self, obj: GcRef) {
        let td = obj.td();
        // Safety: quiescent heap
        unsafe {
            if td.kind == TypeKind::Array && td.element.unwrap().is_reference_like() {
                let len = obj.length();
                for i in 0..len {
                    let slot = obj.element_ptr(i) as *mut usize;
                    let value = slot.read();
                    if value != 0 {
                        slot.write(self.forward_address(value));
                    }
                }
            }
            for &off in td.ref_offsets() {
                let slot = (obj.as_ptr() as usize + off as usize) as *mut usize;
                let value = slot.read();
                if value != 0 {
                    slot.write(self.forward_address(value));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::gc::HandleKind;
    use crate::types::{Prim, TypeDesc, TypeRegistry};
    use once_cell::sync::Lazy;

    static REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::new);

    fn leak<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    fn fresh() -> (&'static Heap, &'static Collector, &'static HandleTable) {
        let heap = leak(Heap::new(*SERVICES));
        let code_heap = leak(CodeHeap::new(*SERVICES));
        let handles = leak(HandleTable::new());
        let collector = leak(Collector::new(heap, code_heap, handles, *SERVICES));
        (heap, collector, handles)
    }

    /// A reference type with one reference field at offset 16.
    fn linked_td() -> &'static TypeDesc {
        let td = crate::types::registry_leak_for_tests(TypeDesc::shell(
            "Linked".into(),
            crate::types::TypeKind::Reference,
            24,
            8,
            Some(REGISTRY.object()),
        ));
        td.fields.set(Box::new([])).unwrap();
        td.ref_offsets.set(vec![16].into_boxed_slice()).unwrap();
        td.methods.set(Box::new([])).unwrap();
        td.seal_vtable(Box::new([]));
        td.iface_map.set(Box::new([])).unwrap();
        td.finalizer.set(None).unwrap();
        td
    }

    fn collect(collector: &Collector, roots: RootSet) -> CollectionOutcome {
        unsafe { collector.collect_stopped(roots, &[], &[]) }
    }

    #[test]
    fn test_unreachable_objects_are_freed_and_survivor_slides() {
        let (heap, collector, _) = fresh();
        let _a = heap.alloc_object(REGISTRY.object()).unwrap();
        let b = heap.alloc_object(REGISTRY.object()).unwrap();
        let _c = heap.alloc_object(REGISTRY.object()).unwrap();
        let slab_base = heap.slabs()[0].base;
        assert_ne!(b.addr(), slab_base);

        let mut root = b.addr();
        let mut roots = RootSet::new();
        roots.add(&mut root as *mut usize, false);

        let outcome = collect(collector, roots);
        assert_eq!(outcome.marked, 1);
        assert_eq!(outcome.freed_objects, 2);
        assert_eq!(outcome.freed_bytes, 32);
        // The survivor compacted to the slab base and the root moved
        assert_eq!(root, slab_base);
        let moved = unsafe { GcRef::from_word(root) }.unwrap();
        assert!(std::ptr::eq(moved.td(), REGISTRY.object()));
        assert!(!moved.header().is_marked());
        assert_eq!(heap.soh_used(), 16);
    }

    #[test]
    fn test_reference_fields_traced_and_adjusted() {
        let (heap, collector, _) = fresh();
        let td = linked_td();
        let _garbage = heap.alloc_object(REGISTRY.object()).unwrap();
        let a = heap.alloc_object(td).unwrap();
        let b = heap.alloc_object(td).unwrap();
        unsafe { a.write_ref(16, Some(b)) };

        let mut root = a.addr();
        let mut roots = RootSet::new();
        roots.add(&mut root as *mut usize, false);

        let outcome = collect(collector, roots);
        assert_eq!(outcome.marked, 2);
        assert_eq!(outcome.freed_objects, 1);

        let a_new = unsafe { GcRef::from_word(root) }.unwrap();
        let b_new = unsafe { a_new.read_ref(16) }.unwrap();
        assert!(std::ptr::eq(b_new.td(), td));
        // b slid directly after a
        assert_eq!(b_new.addr(), a_new.addr() + 24);
    }

    #[test]
    fn test_identity_hash_survives_compaction() {
        let (heap, collector, _) = fresh();
        let _garbage = heap.alloc_object(REGISTRY.object()).unwrap();
        let obj = heap.alloc_object(REGISTRY.object()).unwrap();
        let hash = obj.header().identity_hash(|| heap.next_hash_seed());

        let mut root = obj.addr();
        let mut roots = RootSet::new();
        roots.add(&mut root as *mut usize, false);
        collect(collector, roots);

        let moved = unsafe { GcRef::from_word(root) }.unwrap();
        assert_ne!(moved.addr(), obj.addr());
        assert_eq!(moved.header().identity_hash(|| 0), hash);
    }

    #[test]
    fn test_pinned_object_does_not_move() {
        let (heap, collector, handles) = fresh();
        let _garbage = heap.alloc_object(REGISTRY.object()).unwrap();
        let pinned = heap.alloc_object(REGISTRY.object()).unwrap();
        let after = heap.alloc_object(REGISTRY.object()).unwrap();
        let pinned_addr = pinned.addr();
        let handle = handles.create(pinned, HandleKind::Pinned);

        let mut root = after.addr();
        let mut roots = RootSet::new();
        roots.add(&mut root as *mut usize, false);
        collect(collector, roots);

        assert_eq!(handles.get(handle).unwrap().addr(), pinned_addr);
        // The survivor behind the pin compacted past it
        assert_eq!(root, pinned_addr + 16);
        // The gap in front of the pin was zeroed
        let slab_base = heap.slabs()[0].base;
        assert_eq!(unsafe { (slab_base as *const usize).read() }, 0);
    }

    #[test]
    fn test_interior_pointer_adjusted_with_container() {
        let (heap, collector, _) = fresh();
        let td = REGISTRY.array_of(REGISTRY.prim(Prim::I4), 1);
        let _garbage = heap.alloc_object(REGISTRY.object()).unwrap();
        let arr = heap.alloc_array(td, 8).unwrap();
        unsafe { (arr.element_ptr(3) as *mut i32).write(77) };

        let mut obj_root = arr.addr();
        let mut interior_root = unsafe { arr.element_ptr(3) } as usize;
        let delta_before = interior_root - obj_root;

        let mut roots = RootSet::new();
        roots.add(&mut obj_root as *mut usize, false);
        roots.add(&mut interior_root as *mut usize, true);
        collect(collector, roots);

        assert_ne!(obj_root, arr.addr());
        assert_eq!(interior_root - obj_root, delta_before);
        assert_eq!(unsafe { (interior_root as *const i32).read() }, 77);
    }

    #[test]
    fn test_finalizable_resurrected_then_reclaimed() {
        let (heap, collector, _) = fresh();
        let td = crate::types::registry_leak_for_tests(TypeDesc::shell(
            "Finalizable".into(),
            crate::types::TypeKind::Reference,
            16,
            8,
            Some(REGISTRY.object()),
        ));
        td.fields.set(Box::new([])).unwrap();
        td.ref_offsets.set(Box::new([])).unwrap();
        td.methods.set(Box::new([])).unwrap();
        td.seal_vtable(Box::new([]));
        td.iface_map.set(Box::new([])).unwrap();
        td.finalizer
            .set(Some(crate::eh::frames::tests::dummy_method("Finalize")))
            .unwrap();

        let obj = heap.alloc_object(td).unwrap();
        let size = obj.object_size();

        // First collection: unreachable, resurrected onto the queue
        let outcome = collect(collector, RootSet::new());
        assert_eq!(outcome.freed_objects, 0);
        assert_eq!(outcome.queued_finalizable, 1);
        assert_eq!(collector.finalizer.len(), 1);

        // Finalizer thread drains it; next collection reclaims
        let _ = collector.finalizer.dequeue().unwrap();
        let outcome = collect(collector, RootSet::new());
        assert_eq!(outcome.freed_objects, 1);
        assert_eq!(outcome.freed_bytes, size);
    }

    #[test]
    fn test_marked_equals_retained_invariant() {
        let (heap, collector, _) = fresh();
        let keep: Vec<_> = (0..5)
            .map(|_| heap.alloc_object(REGISTRY.object()).unwrap())
            .collect();
        for _ in 0..7 {
            heap.alloc_object(REGISTRY.object()).unwrap();
        }
        let mut root_storage: Vec<usize> = keep.iter().map(|o| o.addr()).collect();
        let mut roots = RootSet::new();
        for slot in root_storage.iter_mut() {
            roots.add(slot as *mut usize, false);
        }
        let pre = heap.soh_used();
        let outcome = collect(collector, roots);
        assert_eq!(outcome.marked, 5);
        assert_eq!(outcome.freed_objects, 7);
        // bytes freed equals pre-size minus post-size (no LOH delta)
        assert_eq!(outcome.freed_bytes, pre - heap.soh_used());

        // All survivors alive with valid headers in the type table
        let mut live = 0;
        unsafe {
            heap.for_each_soh_object(|obj| {
                assert!(std::ptr::eq(obj.td(), REGISTRY.object()));
                live += 1;
            })
        };
        assert_eq!(live, 5);
    }
}
