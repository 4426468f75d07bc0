//! Argon managed core
//!
//! The managed-runtime heart of the Argon kernel:
//! - **Types**: canonical type descriptors, layout, vtables, interface
//!   maps, generic instantiation (`types` module)
//! - **Loader**: lazy token resolution over parsed assemblies (`loader`)
//! - **JIT**: tier-0 stack-bytecode to x86-64 compiler with stackmaps
//!   and EH tables (`jit`)
//! - **GC**: stop-the-world compacting mark-sweep with precise roots
//!   (`gc`)
//! - **EH**: two-pass search/unwind exception dispatch (`eh`)
//! - **Scheduler**: preemptive per-CPU run queues with safepoint
//!   cooperation (`sched`)
//!
//! The boot environment supplies hardware collaborators through
//! `argon-hal` and calls [`boot::boot`]; everything above that line is
//! managed code.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod boot;
pub mod diag;
pub mod eh;
pub mod fault;
pub mod gc;
pub mod jit;
pub mod loader;
pub mod object;
pub mod reflect;
pub mod runtime;
pub mod sched;
pub mod types;

pub use boot::{boot, secondary_cpu_entry};
pub use fault::FaultKind;
pub use object::GcRef;
pub use runtime::{runtime, Runtime};

// The collaborator surface, re-exported for boot environments
pub use argon_hal as hal;
