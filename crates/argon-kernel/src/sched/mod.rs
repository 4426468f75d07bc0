//! Preemptive multi-CPU scheduler
//!
//! One run queue per CPU, a periodic per-CPU timer tick, and cooperative
//! preemption: the tick only sets a flag, and the running thread yields
//! at its next safepoint poll. The same poll path parks threads for the
//! GC, which is what keeps every parked frame walkable through stackmaps.

mod safepoint;
mod scheduler;
mod thread;
mod timer;

pub use safepoint::SafepointCoordinator;
pub use scheduler::{Scheduler, SchedulerStats, DEFAULT_STACK_SIZE, DEFAULT_TICK_NS};
pub use thread::{StackRegion, ThreadId, ThreadRecord, ThreadState, WakeReason};
pub use timer::TimerWheel;
