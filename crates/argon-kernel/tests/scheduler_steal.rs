//! Multi-CPU queue behavior
//!
//! Eight threads over four CPUs: every thread is dequeued exactly once,
//! the final queue sum is zero, and stealing moves at most one thread
//! per attempt.

use argon_kernel::hal::mock::{
    FixedTopology, HostMemory, HostPageAllocator, ManualTimer, NullInterrupts, RecordingConsole,
    SingleCpu,
};
use argon_kernel::hal::{CpuId, KernelServices};
use argon_kernel::sched::{Scheduler, ThreadId};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

fn leak<T>(v: T) -> &'static T {
    Box::leak(Box::new(v))
}

fn build_scheduler(cpus: u32) -> &'static Scheduler {
    let services = KernelServices {
        pages: leak(HostPageAllocator::new()),
        memory: leak(HostMemory::new()),
        interrupts: leak(NullInterrupts::new()),
        timer: leak(ManualTimer::new()),
        topology: leak(FixedTopology::new(cpus)),
        cpu: &SingleCpu,
        console: leak(RecordingConsole::new()),
    };
    leak(Scheduler::new(
        services,
        argon_kernel::jit::helpers::table(),
        std::ptr::null(),
    ))
}

#[test]
fn test_eight_threads_on_four_cpus_drain_to_zero() {
    let scheduler = build_scheduler(4);
    for _ in 0..8 {
        scheduler.spawn(Box::new(|| {})).unwrap();
    }
    assert_eq!(scheduler.queued_total(), 8);

    // Round-robin the CPUs until every queue is dry
    let mut seen: HashSet<ThreadId> = HashSet::new();
    let mut rounds = 0;
    while scheduler.queued_total() > 0 {
        for cpu in 0..4 {
            if let Some(thread) = scheduler.try_dequeue(CpuId(cpu)) {
                // No thread is ever handed out twice
                assert!(seen.insert(thread.id), "thread dequeued twice");
            }
        }
        rounds += 1;
        assert!(rounds < 64, "queues failed to drain");
    }
    assert_eq!(seen.len(), 8);
    assert_eq!(scheduler.queued_total(), 0);
}

#[test]
fn test_spawn_spreads_across_cpus() {
    let scheduler = build_scheduler(4);
    let mut per_cpu = [0usize; 4];
    for _ in 0..8 {
        let thread = scheduler.spawn(Box::new(|| {})).unwrap();
        per_cpu[thread.owning_cpu().index()] += 1;
    }
    assert_eq!(per_cpu, [2, 2, 2, 2]);
}

#[test]
fn test_steal_only_when_local_queue_dry() {
    let scheduler = build_scheduler(2);
    // Load both CPUs
    let a = scheduler.spawn(Box::new(|| {})).unwrap();
    let b = scheduler.spawn(Box::new(|| {})).unwrap();
    assert_ne!(a.owning_cpu(), b.owning_cpu());

    // CPU 0 takes its own work first: no steal recorded
    let first = scheduler.try_dequeue(CpuId(0)).unwrap();
    assert_eq!(first.owning_cpu(), CpuId(0));
    assert_eq!(scheduler.stats.steals.load(Ordering::Relaxed), 0);

    // Its queue is now dry: the next dequeue steals exactly one
    let second = scheduler.try_dequeue(CpuId(0)).unwrap();
    assert_eq!(second.owning_cpu(), CpuId(0)); // migrated by the steal
    assert_eq!(scheduler.stats.steals.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.queued_total(), 0);
}

#[test]
fn test_cancellation_flag_raises_at_next_safepoint_path() {
    let scheduler = build_scheduler(1);
    let thread = scheduler.spawn(Box::new(|| {})).unwrap();
    thread.cancel();
    assert!(thread.has_flag(argon_kernel::jit::trampoline::poll_flags::CANCEL));
}
