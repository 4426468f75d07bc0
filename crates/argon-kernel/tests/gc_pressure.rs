//! Collection under allocation pressure
//!
//! Drives the collector through the public stop-the-world entry with a
//! quiescent scheduler: a live set held through handles must survive
//! arbitrary amounts of garbage, the heap must stay bounded, and no
//! observable field may change across compactions.

use argon_kernel::gc::{Collector, HandleKind, HandleTable, Heap};
use argon_kernel::hal::mock::{
    FixedTopology, HostMemory, HostPageAllocator, ManualTimer, NullInterrupts, RecordingConsole,
    SingleCpu,
};
use argon_kernel::hal::KernelServices;
use argon_kernel::jit::code_heap::CodeHeap;
use argon_kernel::sched::Scheduler;
use argon_kernel::types::{Prim, TypeRegistry, LENGTH_OFFSET};

fn leak<T>(v: T) -> &'static T {
    Box::leak(Box::new(v))
}

struct World {
    registry: &'static TypeRegistry,
    heap: &'static Heap,
    handles: &'static HandleTable,
    collector: &'static Collector,
    scheduler: &'static Scheduler,
}

fn build_world() -> World {
    let _ = env_logger::builder().is_test(true).try_init();
    let services = KernelServices {
        pages: leak(HostPageAllocator::new()),
        memory: leak(HostMemory::new()),
        interrupts: leak(NullInterrupts::new()),
        timer: leak(ManualTimer::new()),
        topology: leak(FixedTopology::new(1)),
        cpu: &SingleCpu,
        console: leak(RecordingConsole::new()),
    };
    let registry = leak(TypeRegistry::new());
    let heap = leak(Heap::new(services));
    let handles = leak(HandleTable::new());
    let code_heap = leak(CodeHeap::new(services));
    let collector = leak(Collector::new(heap, code_heap, handles, services));
    let scheduler = leak(Scheduler::new(
        services,
        argon_kernel::jit::helpers::table(),
        std::ptr::null(),
    ));
    World {
        registry,
        heap,
        handles,
        collector,
        scheduler,
    }
}

#[test]
fn test_heap_stays_bounded_under_garbage() {
    let world = build_world();
    let int_array = world.registry.array_of(world.registry.prim(Prim::I4), 1);

    // A live set of arrays with recognizable contents
    let mut live = Vec::new();
    for i in 0..16 {
        let arr = world.heap.alloc_array(int_array, 32).unwrap();
        unsafe {
            for k in 0..32 {
                (arr.element_ptr(k) as *mut i32).write((i * 100 + k) as i32);
            }
        }
        live.push(world.handles.create(arr, HandleKind::Strong));
    }
    let live_bytes = world.heap.soh_used();

    // Churn garbage through several collection cycles
    for _ in 0..8 {
        for _ in 0..2_000 {
            world.heap.alloc_array(int_array, 16).unwrap();
        }
        world.collector.collect(world.scheduler, &[], None);
        // Post-collection heap is exactly the live set
        assert_eq!(world.heap.soh_used(), live_bytes);
    }

    // No observable element changed across all those moves
    for (i, handle) in live.iter().enumerate() {
        let arr = world.handles.get(*handle).unwrap();
        unsafe {
            assert_eq!(arr.length(), 32);
            for k in 0..32 {
                assert_eq!(
                    (arr.element_ptr(k) as *const i32).read(),
                    (i * 100 + k) as i32
                );
            }
        }
    }
}

#[test]
fn test_marked_equals_retained_and_byte_accounting() {
    let world = build_world();
    let td = world.registry.object();

    let mut keepers = Vec::new();
    for _ in 0..10 {
        keepers.push(
            world
                .handles
                .create(world.heap.alloc_object(td).unwrap(), HandleKind::Strong),
        );
    }
    for _ in 0..25 {
        world.heap.alloc_object(td).unwrap();
    }

    let pre = world.heap.soh_used();
    let outcome = world.collector.collect(world.scheduler, &[], None);
    assert_eq!(outcome.marked, 10);
    assert_eq!(outcome.freed_objects, 25);
    assert_eq!(outcome.freed_bytes, pre - world.heap.soh_used());
    assert_eq!(outcome.loh_freed_bytes, 0);

    let stats = world.collector.stats();
    assert_eq!(stats.collections, 1);
    assert_eq!(stats.last_marked, 10);
}

#[test]
fn test_identity_and_references_survive_moves() {
    let world = build_world();
    let object_array = world.registry.array_of(world.registry.object(), 1);

    // a[0] -> b, plus garbage in front so everything slides
    for _ in 0..6 {
        world.heap.alloc_object(world.registry.object()).unwrap();
    }
    let a = world.heap.alloc_array(object_array, 2).unwrap();
    let b = world.heap.alloc_object(world.registry.object()).unwrap();
    unsafe {
        let slot = a.element_ptr(0) as *mut usize;
        slot.write(b.addr());
    }
    let b_hash = b.header().identity_hash(|| world.heap.next_hash_seed());
    let a_handle = world.handles.create(a, HandleKind::Strong);

    world.collector.collect(world.scheduler, &[], None);

    let a_moved = world.handles.get(a_handle).unwrap();
    assert_ne!(a_moved.addr(), a.addr());
    unsafe {
        assert_eq!(a_moved.length(), 2);
        let b_moved = (a_moved.element_ptr(0) as *const usize).read();
        assert_ne!(b_moved, 0);
        let b_ref = argon_kernel::GcRef::from_word(b_moved).unwrap();
        assert_eq!(b_ref.header().identity_hash(|| 0), b_hash);
        // The second element stayed null
        assert_eq!((a_moved.element_ptr(1) as *const usize).read(), 0);
    }
    let _ = LENGTH_OFFSET;
}

#[test]
fn test_loh_objects_swept_not_compacted() {
    let world = build_world();
    let byte_array = world.registry.array_of(world.registry.prim(Prim::U1), 1);

    let keep = world
        .heap
        .alloc_array(byte_array, argon_kernel::gc::LOH_THRESHOLD)
        .unwrap();
    let keep_addr = keep.addr();
    let _garbage = world
        .heap
        .alloc_array(byte_array, argon_kernel::gc::LOH_THRESHOLD)
        .unwrap();
    let handle = world.handles.create(keep, HandleKind::Strong);
    let before = world.heap.loh_bytes();

    let outcome = world.collector.collect(world.scheduler, &[], None);
    assert_eq!(outcome.loh_freed_regions, 1);
    assert!(world.heap.loh_bytes() < before);
    // Large objects never move
    assert_eq!(world.handles.get(handle).unwrap().addr(), keep_addr);
}
