//! Thread records
//!
//! A [`ThreadRecord`] owns everything the scheduler, GC and exception
//! dispatcher need to know about one thread: its saved CPU context, its
//! stack region, the lifecycle state machine, the safepoint flag word
//! (inside the embedded [`RuntimeContext`]), and the managed walk origin
//! recorded whenever the thread is stopped at a safepoint.

use crate::jit::trampoline::{poll_flags, HelperTable, RuntimeContext};
use argon_hal::{CpuContext, CpuId, PhysAddr, VirtAddr};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Queued, ready to run.
    Runnable = 0,
    /// Currently on a CPU.
    Running = 1,
    /// Blocked on an event or deadline.
    Waiting = 2,
    /// Stopped at a safepoint for the collector.
    ParkedForGc = 3,
    /// Returned from its entry point or was terminated.
    Terminating = 4,
    /// Stack reclaimed by the reaper.
    Finalized = 5,
}

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Runnable,
            1 => ThreadState::Running,
            2 => ThreadState::Waiting,
            3 => ThreadState::ParkedForGc,
            4 => ThreadState::Terminating,
            _ => ThreadState::Finalized,
        }
    }
}

/// Why a waiting thread woke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The awaited event was signaled.
    Signaled,
    /// The wait's deadline expired.
    TimedOut,
}

/// The thread's stack mapping.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    /// Lowest mapped address.
    pub base: VirtAddr,
    /// Size in bytes.
    pub size: usize,
    /// Backing physical range (returned to the allocator by the reaper).
    pub phys: PhysAddr,
}

impl StackRegion {
    /// Initial stack pointer: top of the mapping, 16-aligned.
    pub fn top(&self) -> usize {
        (self.base.as_usize() + self.size) & !15
    }
}

/// A kernel thread running managed code.
pub struct ThreadRecord {
    /// Thread id.
    pub id: ThreadId,
    state: AtomicU8,
    /// Saved CPU context. Valid whenever the thread is not Running.
    pub(crate) context: UnsafeCell<CpuContext>,
    /// Per-thread runtime context; `r14` points here in managed code.
    pub rt_ctx: RuntimeContext,
    /// Stack mapping, None for the bootstrap thread (boot-provided stack).
    pub stack: Option<StackRegion>,
    owning_cpu: AtomicU32,
    /// Entry closure, taken exactly once by the dispatcher.
    pub(crate) run: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Managed walk origin (pc, rbp) while stopped at a safepoint.
    parked_walk: Mutex<Option<(usize, usize)>>,
    /// Additional walk origin while the exception dispatcher is active.
    eh_walk: Mutex<Option<(usize, usize)>>,
    /// The exception being dispatched or handled (GC-visible via the
    /// dispatcher's handle, mirrored here for `rethrow`).
    pub(crate) current_exception: AtomicUsize,
    /// Depth of filter funclets currently executing.
    pub(crate) filter_depth: AtomicU32,
    /// Resume point captured before invoking a filter funclet.
    pub(crate) filter_resume: UnsafeCell<CpuContext>,
    /// How the last wait ended.
    wake_reason: AtomicU8,
    /// Set when an unhandled exception terminated the thread.
    pub(crate) died_unhandled: Mutex<Option<String>>,
    /// Threads blocked in `join` on this thread.
    pub(crate) join_waiters: Mutex<Vec<Arc<ThreadRecord>>>,
}

// Safety: the mutable interior (context, filter_resume) is only touched
// by the owning thread, or by the scheduler/GC while the thread is
// provably off-CPU.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    /// Create a record in the Runnable state.
    pub fn new(
        stack: Option<StackRegion>,
        runtime: *const (),
        helpers: &'static HelperTable,
    ) -> Arc<ThreadRecord> {
        let mut record = Arc::new(ThreadRecord {
            id: ThreadId::next(),
            state: AtomicU8::new(ThreadState::Runnable as u8),
            context: UnsafeCell::new(CpuContext::zeroed()),
            rt_ctx: RuntimeContext::new(std::ptr::null_mut(), runtime, helpers),
            stack,
            owning_cpu: AtomicU32::new(0),
            run: Mutex::new(None),
            parked_walk: Mutex::new(None),
            eh_walk: Mutex::new(None),
            current_exception: AtomicUsize::new(0),
            filter_depth: AtomicU32::new(0),
            filter_resume: UnsafeCell::new(CpuContext::zeroed()),
            wake_reason: AtomicU8::new(0),
            died_unhandled: Mutex::new(None),
            join_waiters: Mutex::new(Vec::new()),
        });
        // Wire the back-pointer now that the record has its final address
        let ptr = Arc::as_ptr(&record) as *mut ();
        Arc::get_mut(&mut record).expect("fresh arc").rt_ctx.thread = ptr;
        record
    }

    /// Current state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition to a new state.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Compare-and-set the state; returns whether the transition won.
    pub fn try_transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CPU the thread last ran on (wake affinity).
    pub fn owning_cpu(&self) -> CpuId {
        CpuId(self.owning_cpu.load(Ordering::Relaxed))
    }

    /// Record the CPU the thread is dispatched on.
    pub fn set_owning_cpu(&self, cpu: CpuId) {
        self.owning_cpu.store(cpu.0, Ordering::Relaxed);
    }

    /// Set a safepoint flag (preempt/GC/cancel).
    pub fn set_flag(&self, flag: u32) {
        self.rt_ctx.flags.fetch_or(flag, Ordering::Release);
    }

    /// Clear a safepoint flag.
    pub fn clear_flag(&self, flag: u32) {
        self.rt_ctx.flags.fetch_and(!flag, Ordering::Release);
    }

    /// Whether a flag is currently set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.rt_ctx.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.set_flag(poll_flags::CANCEL);
    }

    /// Record the managed walk origin while stopping at a safepoint.
    pub fn set_parked_walk(&self, pc: usize, rbp: usize) {
        *self.parked_walk.lock() = Some((pc, rbp));
    }

    /// Clear the walk origin on resume.
    pub fn clear_parked_walk(&self) {
        *self.parked_walk.lock() = None;
    }

    /// The walk origins the GC must scan for this thread: the safepoint
    /// park site and, if an exception dispatch is in flight, the throw
    /// site below it.
    pub fn walk_origins(&self) -> Vec<(usize, usize)> {
        let mut origins = Vec::with_capacity(2);
        if let Some(walk) = *self.parked_walk.lock() {
            origins.push(walk);
        }
        if let Some(walk) = *self.eh_walk.lock() {
            origins.push(walk);
        }
        origins
    }

    /// Record the dispatcher's walk origin.
    pub fn set_eh_walk(&self, pc: usize, rbp: usize) {
        *self.eh_walk.lock() = Some((pc, rbp));
    }

    /// Clear the dispatcher's walk origin.
    pub fn clear_eh_walk(&self) {
        *self.eh_walk.lock() = None;
    }

    /// How the last wait ended.
    pub fn wake_reason(&self) -> WakeReason {
        if self.wake_reason.load(Ordering::Acquire) == 1 {
            WakeReason::TimedOut
        } else {
            WakeReason::Signaled
        }
    }

    /// Set the wake reason before enqueueing a woken thread.
    pub fn set_wake_reason(&self, reason: WakeReason) {
        self.wake_reason
            .store(matches!(reason, WakeReason::TimedOut) as u8, Ordering::Release);
    }

    /// The context pointer handed to `r14` for this thread.
    pub fn ctx_ptr(&self) -> *mut RuntimeContext {
        &self.rt_ctx as *const RuntimeContext as *mut RuntimeContext
    }
}
