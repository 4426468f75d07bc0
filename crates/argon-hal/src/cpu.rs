//! CPU enumeration and control
//!
//! The GDT/IDT/TSS bring-up and the context-switch trampolines live in the
//! boot environment (assembly); the core drives them through [`CpuControl`].

/// Logical CPU identifier, dense from zero in topology order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Index form for per-CPU arrays.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry of the CPU topology.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    /// Logical CPU id.
    pub id: CpuId,
    /// NUMA node the CPU belongs to.
    pub numa_node: u32,
    /// Local APIC id, as programmed by firmware.
    pub apic_id: u32,
}

/// CPU enumeration, filled from ACPI by the boot environment.
pub trait CpuTopology: Sync {
    /// All CPUs that were brought online, in [`CpuId`] order.
    fn cpus(&self) -> &[CpuInfo];
}

/// Saved execution state of a thread.
///
/// The layout is shared with the assembly trampolines and must not change
/// without updating them. The FPU area is an `fxsave64` image.
#[derive(Debug, Clone)]
#[repr(C, align(16))]
pub struct CpuContext {
    /// Callee-visible general purpose registers, rax..r15 in encoding order.
    pub gpr: [u64; 16],
    /// Instruction pointer to resume at.
    pub rip: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// RFLAGS image.
    pub rflags: u64,
    /// `fxsave64` area (x87 + SSE state).
    pub fpu: [u8; 512],
}

/// Register numbers within [`CpuContext::gpr`], matching x86-64 encoding.
#[allow(missing_docs)]
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const R13: usize = 13;
    pub const R14: usize = 14;
    pub const R15: usize = 15;
}

impl CpuContext {
    /// A zeroed context. `rip`/`rsp` must be filled before restoring it.
    pub fn zeroed() -> Self {
        Self {
            gpr: [0; 16],
            rip: 0,
            rsp: 0,
            rflags: 0x202, // IF set
            fpu: [0; 512],
        }
    }
}

/// Control over the executing CPU.
pub trait CpuControl: Sync {
    /// The CPU this call executes on (read from the GS base).
    fn current_cpu(&self) -> CpuId;

    /// Save the current thread state into `save` and resume `restore`.
    ///
    /// Returns (into `save`'s owner) when some other thread switches back.
    ///
    /// # Safety
    ///
    /// `restore` must hold a context previously captured by this trampoline
    /// or built for a fresh thread with a valid stack and entry point.
    unsafe fn context_switch(&self, save: *mut CpuContext, restore: *const CpuContext);

    /// Discard the current thread state and resume `restore`.
    ///
    /// Used for first dispatch onto a fresh thread and for exception
    /// resumption into a catch handler.
    ///
    /// # Safety
    ///
    /// As for [`CpuControl::context_switch`]; additionally the current
    /// stack must not be referenced by `restore`.
    unsafe fn restore(&self, restore: *const CpuContext) -> !;

    /// Capture the current execution state into `save`.
    ///
    /// Returns `true` on the capturing path. A later [`CpuControl::restore`]
    /// of the same context resumes here returning `false` (setjmp
    /// discipline; used by the exception dispatcher around filter
    /// funclets).
    ///
    /// # Safety
    ///
    /// `save` must point to writable context storage that outlives any
    /// restore of it, and the capturing frame must still be live when the
    /// context is restored.
    unsafe fn capture(&self, save: *mut CpuContext) -> bool;

    /// Wait for the next interrupt with interrupts enabled (`sti; hlt`).
    fn idle(&self);

    /// Stop the machine. Terminal; used by panics and the boot-thread
    /// unhandled-exception path.
    fn halt(&self) -> !;
}
