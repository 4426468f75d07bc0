//! Per-CPU dispatch, preemption and thread lifecycle
//!
//! Each CPU owns a FIFO run queue (a local deque fed by a lock-free
//! remote-enqueue injector) and a dispatcher context. The timer tick
//! requests preemption by setting a flag; threads yield at their next
//! safepoint. Stealing takes one thread per attempt and only when the
//! local queue is dry.

use super::safepoint::SafepointCoordinator;
use super::thread::{StackRegion, ThreadRecord, ThreadState, WakeReason};
use super::timer::TimerWheel;
use crate::fault::FaultKind;
use crate::jit::trampoline::{poll_flags, HelperTable};
use argon_hal::{AllocFlags, CpuContext, CpuId, KernelServices, PageProt, PAGE_SIZE};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default managed thread stack: 256 KiB.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default preemption quantum: 50 microseconds.
pub const DEFAULT_TICK_NS: u64 = 50_000;

/// Aggregate scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Threads created.
    pub spawned: AtomicU64,
    /// Threads reaped.
    pub completed: AtomicU64,
    /// Successful steals.
    pub steals: AtomicU64,
    /// Timer ticks taken.
    pub ticks: AtomicU64,
}

struct CpuLocal {
    id: CpuId,
    /// Remote enqueues land here; the owning CPU drains into its worker.
    injector: Injector<Arc<ThreadRecord>>,
    /// Stealer handle for the CPU's local deque, set when the CPU enters
    /// its dispatch loop.
    stealer: OnceCell<Stealer<Arc<ThreadRecord>>>,
    /// The dispatcher's own context, switched to when a thread yields.
    dispatcher_ctx: UnsafeCell<CpuContext>,
    /// Thread currently on this CPU.
    current: Mutex<Option<Arc<ThreadRecord>>>,
}

// Safety: dispatcher_ctx is only used by the owning CPU and by threads
// context-switching back to it.
unsafe impl Sync for CpuLocal {}

static INSTALLED: OnceCell<&'static Scheduler> = OnceCell::new();

/// The scheduler.
pub struct Scheduler {
    services: KernelServices,
    helpers: &'static HelperTable,
    runtime: AtomicUsize,
    cpus: Box<[CpuLocal]>,
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    /// GC rendezvous.
    pub safepoint: SafepointCoordinator,
    /// Wait deadlines.
    pub timers: TimerWheel,
    next_cpu: AtomicUsize,
    /// Statistics.
    pub stats: SchedulerStats,
}

impl Scheduler {
    /// Create a scheduler for the machine's topology.
    pub fn new(
        services: KernelServices,
        helpers: &'static HelperTable,
        runtime: *const (),
    ) -> Self {
        let cpus: Box<[CpuLocal]> = services
            .topology
            .cpus()
            .iter()
            .map(|info| CpuLocal {
                id: info.id,
                injector: Injector::new(),
                stealer: OnceCell::new(),
                dispatcher_ctx: UnsafeCell::new(CpuContext::zeroed()),
                current: Mutex::new(None),
            })
            .collect();
        Self {
            services,
            helpers,
            runtime: AtomicUsize::new(runtime as usize),
            cpus,
            threads: Mutex::new(Vec::new()),
            safepoint: SafepointCoordinator::new(),
            timers: TimerWheel::new(),
            next_cpu: AtomicUsize::new(0),
            stats: SchedulerStats::default(),
        }
    }

    /// Install the global scheduler (timer handlers and thread exit paths
    /// reach it through this).
    pub fn install(scheduler: &'static Scheduler) {
        let _ = INSTALLED.set(scheduler);
    }

    /// Late-bind the runtime pointer handed to new thread contexts.
    pub fn set_runtime(&self, runtime: *const ()) {
        self.runtime.store(runtime as usize, Ordering::Release);
    }

    /// The installed scheduler.
    pub fn installed() -> &'static Scheduler {
        INSTALLED.get().expect("scheduler not installed")
    }

    /// Number of CPUs.
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// All live threads (GC root scanning).
    pub fn threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().clone()
    }

    /// The thread currently running on `cpu`.
    pub fn current_on(&self, cpu: CpuId) -> Option<Arc<ThreadRecord>> {
        self.cpus[cpu.index()].current.lock().clone()
    }

    /// The thread running on the calling CPU.
    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        self.current_on(self.services.cpu.current_cpu())
    }

    // ===== Thread creation and teardown =====

    /// Create a thread executing `run`, queued round-robin.
    pub fn spawn(
        &self,
        run: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<ThreadRecord>, FaultKind> {
        let stack = self.alloc_stack(DEFAULT_STACK_SIZE)?;
        let runtime = self.runtime.load(Ordering::Acquire) as *const ();
        let thread = ThreadRecord::new(Some(stack), runtime, self.helpers);
        *thread.run.lock() = Some(run);

        // Fresh context: enters thread_entry with the record pointer
        // Safety: the record is not yet visible to any CPU
        unsafe {
            let ctx = &mut *thread.context.get();
            ctx.rip = thread_entry as usize as u64;
            // Fake return address slot keeps the entry 16-byte discipline;
            // rbp = 0 terminates frame walks.
            let top = stack.top() - 16;
            (top as *mut u64).write(0);
            ctx.rsp = top as u64;
            ctx.gpr[argon_hal::cpu::gpr::RDI] = Arc::as_ptr(&thread) as u64;
            ctx.gpr[argon_hal::cpu::gpr::RBP] = 0;
        }

        let cpu = CpuId(
            (self.next_cpu.fetch_add(1, Ordering::Relaxed) % self.cpus.len()) as u32,
        );
        thread.set_owning_cpu(cpu);
        self.threads.lock().push(thread.clone());
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.enqueue(thread.clone());
        Ok(thread)
    }

    fn alloc_stack(&self, size: usize) -> Result<StackRegion, FaultKind> {
        let pages = size / PAGE_SIZE;
        let phys = self
            .services
            .pages
            .alloc_contiguous(pages, AllocFlags::ZEROED)
            .map_err(|_| FaultKind::OutOfMemory)?;
        let base = self
            .services
            .memory
            .map(phys, size, PageProt::READ | PageProt::WRITE)
            .map_err(|_| FaultKind::OutOfMemory)?;
        Ok(StackRegion { base, size, phys })
    }

    /// Reclaim a terminated thread's stack.
    fn reap(&self, thread: &Arc<ThreadRecord>) {
        if let Some(stack) = thread.stack {
            let _ = self.services.memory.unmap(stack.base, stack.size);
            self.services
                .pages
                .free_contiguous(stack.phys, stack.size / PAGE_SIZE);
        }
        thread.set_state(ThreadState::Finalized);
        self.threads
            .lock()
            .retain(|t| !Arc::ptr_eq(t, thread));
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    // ===== Queues =====

    /// Enqueue a runnable thread on its affinity CPU.
    pub fn enqueue(&self, thread: Arc<ThreadRecord>) {
        let cpu = thread.owning_cpu();
        self.cpus[cpu.index()].injector.push(thread);
    }

    /// Take the next thread for `cpu`: local deque first, then the
    /// remote-enqueue injector, then one steal attempt per other CPU.
    fn find_work(&self, worker: &Worker<Arc<ThreadRecord>>, cpu: CpuId) -> Option<Arc<ThreadRecord>> {
        if let Some(thread) = worker.pop() {
            return Some(thread);
        }
        let local = &self.cpus[cpu.index()];
        loop {
            match local.injector.steal_batch_and_pop(worker) {
                Steal::Success(thread) => return Some(thread),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        // Local queue is dry: steal one thread from a remote CPU
        for other in self.cpus.iter() {
            if other.id == cpu {
                continue;
            }
            loop {
                match other.injector.steal() {
                    Steal::Success(thread) => {
                        self.stats.steals.fetch_add(1, Ordering::Relaxed);
                        thread.set_owning_cpu(cpu);
                        return Some(thread);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
            if let Some(stealer) = other.stealer.get() {
                loop {
                    match stealer.steal() {
                        Steal::Success(thread) => {
                            self.stats.steals.fetch_add(1, Ordering::Relaxed);
                            thread.set_owning_cpu(cpu);
                            return Some(thread);
                        }
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
        }
        None
    }

    /// Sum of queued threads across all injectors (tests, diagnostics;
    /// threads in local deques are only visible to their CPU).
    pub fn queued_total(&self) -> usize {
        self.cpus.iter().map(|c| c.injector.len()).sum()
    }

    /// Take the next thread `cpu` would dispatch, without dispatching it
    /// (diagnostics and tests).
    pub fn try_dequeue(&self, cpu: CpuId) -> Option<Arc<ThreadRecord>> {
        let worker = Worker::new_fifo();
        let thread = self.find_work(&worker, cpu);
        // Anything batched into the transient worker goes back
        while let Some(extra) = worker.pop() {
            self.cpus[cpu.index()].injector.push(extra);
        }
        thread
    }

    // ===== Dispatch =====

    /// Enter the dispatch loop on the calling CPU. Never returns.
    ///
    /// # Safety
    ///
    /// Must run exactly once per CPU, after [`Scheduler::install`].
    pub unsafe fn run_cpu(&'static self, cpu_id: CpuId) -> ! {
        let cpu = &self.cpus[cpu_id.index()];
        let worker = Worker::new_fifo();
        let _ = cpu.stealer.set(worker.stealer());

        loop {
            // Do not hand out CPUs while the world is stopped
            if self.safepoint.gc_active() {
                core::hint::spin_loop();
                continue;
            }
            match self.find_work(&worker, cpu_id) {
                Some(thread) => self.dispatch(cpu_id, thread),
                None => {
                    if cpu_id.index() == 0 {
                        self.sweep_deadlines();
                    }
                    self.services.cpu.idle();
                }
            }
        }
    }

    unsafe fn dispatch(&self, cpu_id: CpuId, thread: Arc<ThreadRecord>) {
        let cpu = &self.cpus[cpu_id.index()];
        thread.set_owning_cpu(cpu_id);
        thread.set_state(ThreadState::Running);
        *cpu.current.lock() = Some(thread.clone());

        self.services
            .cpu
            .context_switch(cpu.dispatcher_ctx.get(), thread.context.get());

        // The thread yielded, blocked or terminated
        *cpu.current.lock() = None;
        if thread.state() == ThreadState::Terminating {
            self.reap(&thread);
        }
    }

    /// Switch from the running `thread` back to this CPU's dispatcher.
    ///
    /// # Safety
    ///
    /// Must be called on the thread's own CPU, with `thread` Running.
    pub unsafe fn yield_to_dispatcher(&self, thread: &ThreadRecord) {
        let cpu = &self.cpus[self.services.cpu.current_cpu().index()];
        self.services
            .cpu
            .context_switch(thread.context.get(), cpu.dispatcher_ctx.get());
    }

    /// Voluntary yield from the running thread (preemption observed).
    pub fn yield_current(&self, thread: &Arc<ThreadRecord>) {
        thread.clear_flag(poll_flags::PREEMPT);
        thread.set_state(ThreadState::Runnable);
        self.enqueue(thread.clone());
        // Safety: called from the thread itself at a safepoint
        unsafe { self.yield_to_dispatcher(thread) };
    }

    /// Block the running thread, optionally with a deadline.
    ///
    /// Returns how the wait ended.
    pub fn block_current(
        &self,
        thread: &Arc<ThreadRecord>,
        deadline_ns: Option<u64>,
    ) -> WakeReason {
        thread.set_wake_reason(WakeReason::Signaled);
        thread.set_state(ThreadState::Waiting);
        if let Some(deadline) = deadline_ns {
            self.timers.arm(deadline, thread.clone());
        }
        // Safety: called from the thread itself at a safepoint
        unsafe { self.yield_to_dispatcher(thread) };
        thread.wake_reason()
    }

    /// Make a waiting thread runnable (event signaled).
    pub fn wake(&self, thread: &Arc<ThreadRecord>) {
        if thread.try_transition(ThreadState::Waiting, ThreadState::Runnable) {
            self.timers.disarm(thread);
            thread.set_wake_reason(WakeReason::Signaled);
            self.enqueue(thread.clone());
        }
    }

    /// Terminate the running thread. Never returns.
    pub fn exit_current(&self, thread: &Arc<ThreadRecord>) -> ! {
        for waiter in thread.join_waiters.lock().drain(..) {
            self.wake(&waiter);
        }
        thread.set_state(ThreadState::Terminating);
        // Safety: the dispatcher reaps after the switch; this stack is
        // never resumed.
        unsafe { self.yield_to_dispatcher(thread) };
        unreachable!("terminated thread was rescheduled");
    }

    /// Block until `target` terminates. Returns immediately if it already
    /// has.
    pub fn join(
        &self,
        current: &Arc<ThreadRecord>,
        target: &Arc<ThreadRecord>,
        deadline_ns: Option<u64>,
    ) -> WakeReason {
        {
            let state = target.state();
            if matches!(state, ThreadState::Terminating | ThreadState::Finalized) {
                return WakeReason::Signaled;
            }
            target.join_waiters.lock().push(current.clone());
        }
        self.block_current(current, deadline_ns)
    }

    // ===== Timer tick =====

    /// Periodic tick, called from the timer interrupt on every CPU.
    ///
    /// Only sets flags and moves expired waiters; never blocks, never
    /// allocates from the managed heap.
    pub fn tick(&self, cpu: CpuId) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        // try_lock: the tick may have interrupted this CPU's dispatcher
        // mid-update; skipping one preempt request is harmless
        if let Some(current) = self.cpus[cpu.index()].current.try_lock() {
            if let Some(current) = current.as_ref() {
                current.set_flag(poll_flags::PREEMPT);
            }
        }
        if cpu.index() == 0 {
            self.sweep_deadlines();
        }
    }

    fn sweep_deadlines(&self) {
        let now = self.services.timer.now_ns();
        for thread in self.timers.expire(now) {
            if thread.try_transition(ThreadState::Waiting, ThreadState::Runnable) {
                self.enqueue(thread);
            }
        }
    }

    /// Arm the periodic tick on the calling CPU and register the handler.
    pub fn start_timer(&self, tick_ns: u64) {
        let vector = self.services.timer.vector();
        self.services.interrupts.register(vector, timer_interrupt);
        self.services.timer.arm_periodic(tick_ns);
    }

    // ===== GC cooperation =====

    /// Stop every mutator except `coordinator`.
    pub fn stop_the_world(&self, coordinator: Option<&ThreadRecord>) {
        let threads = self.threads();
        self.safepoint.stop_the_world(&threads, coordinator);
    }

    /// Resume after collection.
    pub fn resume_the_world(&self) {
        let threads = self.threads();
        self.safepoint.resume_the_world(&threads);
    }
}

/// First instruction of every spawned thread.
extern "C" fn thread_entry(thread: *const ThreadRecord) {
    // Safety: the scheduler keeps the Arc alive in its registry
    let thread = unsafe { &*thread };
    let run = thread.run.lock().take();
    if let Some(run) = run {
        run();
    }
    let scheduler = Scheduler::installed();
    let current = scheduler
        .threads()
        .into_iter()
        .find(|t| std::ptr::eq(t.as_ref(), thread))
        .expect("exiting thread not registered");
    scheduler.exit_current(&current);
}

/// Timer interrupt entry: flag the current thread and sweep deadlines.
fn timer_interrupt(vector: u8) {
    let scheduler = Scheduler::installed();
    let cpu = scheduler.services.cpu.current_cpu();
    scheduler.tick(cpu);
    scheduler.services.interrupts.eoi(vector);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;

    fn leak<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    fn fresh_scheduler(cpus: u32) -> &'static Scheduler {
        let services = {
            let mut s = *SERVICES;
            s.topology = leak(argon_hal::mock::FixedTopology::new(cpus));
            s
        };
        leak(Scheduler::new(
            services,
            crate::runtime::helpers_for_tests(),
            std::ptr::null(),
        ))
    }

    #[test]
    fn test_spawn_queues_round_robin() {
        let sched = fresh_scheduler(4);
        let a = sched.spawn(Box::new(|| {})).unwrap();
        let b = sched.spawn(Box::new(|| {})).unwrap();
        assert_eq!(sched.queued_total(), 2);
        assert_ne!(a.owning_cpu(), b.owning_cpu());
        assert_eq!(a.state(), ThreadState::Runnable);
        // Fresh contexts point at the entry thunk with a terminating rbp
        unsafe {
            let ctx = &*a.context.get();
            assert_eq!(ctx.rip, thread_entry as usize as u64);
            assert_eq!(ctx.gpr[argon_hal::cpu::gpr::RBP], 0);
            assert_eq!(ctx.rsp % 16, 0);
        }
    }

    #[test]
    fn test_steal_takes_one_thread() {
        let sched = fresh_scheduler(2);
        // Put two threads on CPU 1's queue
        let a = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        let b = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        a.set_owning_cpu(CpuId(1));
        b.set_owning_cpu(CpuId(1));
        sched.threads.lock().push(a.clone());
        sched.threads.lock().push(b.clone());
        sched.enqueue(a.clone());
        sched.enqueue(b.clone());

        // CPU 0 steals exactly one
        let worker = Worker::new_fifo();
        let stolen = sched.find_work(&worker, CpuId(0)).unwrap();
        assert_eq!(stolen.owning_cpu(), CpuId(0));
        assert_eq!(sched.queued_total(), 1);
        assert_eq!(sched.stats.steals.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tick_sets_preempt_on_current() {
        let sched = fresh_scheduler(4);
        let t = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        t.set_state(ThreadState::Running);
        *sched.cpus[2].current.lock() = Some(t.clone());
        sched.tick(CpuId(2));
        assert!(t.has_flag(poll_flags::PREEMPT));
        *sched.cpus[2].current.lock() = None;
    }

    #[test]
    fn test_wake_only_from_waiting() {
        let sched = fresh_scheduler(4);
        let t = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        t.set_owning_cpu(CpuId(3));
        // Not waiting: wake is a no-op
        sched.wake(&t);
        assert_eq!(sched.queued_total(), 0);

        t.set_state(ThreadState::Waiting);
        sched.wake(&t);
        assert_eq!(t.state(), ThreadState::Runnable);
        assert_eq!(sched.queued_total(), 1);
    }

    #[test]
    fn test_deadline_sweep_wakes_timed_out() {
        let manual = leak(argon_hal::mock::ManualTimer::new());
        let services = {
            let mut s = *SERVICES;
            s.timer = manual;
            s.topology = leak(argon_hal::mock::FixedTopology::new(1));
            s
        };
        let sched: &'static Scheduler = leak(Scheduler::new(
            services,
            crate::runtime::helpers_for_tests(),
            std::ptr::null(),
        ));
        let t = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        t.set_state(ThreadState::Waiting);
        sched.timers.arm(1_000, t.clone());

        sched.tick(CpuId(0));
        assert_eq!(t.state(), ThreadState::Waiting);

        // Advance past the deadline and tick again
        manual.advance(2_000);
        sched.tick(CpuId(0));
        assert_eq!(t.state(), ThreadState::Runnable);
        assert_eq!(t.wake_reason(), WakeReason::TimedOut);
        assert_eq!(sched.queued_total(), 1);
    }

    #[test]
    fn test_join_on_dead_thread_returns_immediately() {
        let sched = fresh_scheduler(1);
        let current = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        let dead = ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests());
        dead.set_state(ThreadState::Finalized);
        assert_eq!(sched.join(&current, &dead, None), WakeReason::Signaled);
    }
}
