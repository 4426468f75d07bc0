//! Interrupt vectors and the local timer

/// An interrupt handler. Runs in interrupt context on the CPU that took the
/// vector: it must not allocate from the managed heap, block, or take any
/// lock shared with thread context.
pub type IrqHandler = fn(vector: u8);

/// Interrupt controller (IOAPIC/LAPIC programming is the boot
/// environment's concern; the core only registers handlers and signals
/// end-of-interrupt).
pub trait Interrupt: Sync {
    /// Install `handler` for `vector`. Replaces any previous handler.
    fn register(&self, vector: u8, handler: IrqHandler);

    /// Signal end-of-interrupt for `vector`.
    fn eoi(&self, vector: u8);
}

/// The per-CPU local timer (APIC timer). Calls affect the calling CPU only.
pub trait Timer: Sync {
    /// Vector the timer fires on.
    fn vector(&self) -> u8;

    /// Arm a single expiry `ns` nanoseconds from now.
    fn arm_oneshot(&self, ns: u64);

    /// Arm a periodic expiry every `ns` nanoseconds.
    fn arm_periodic(&self, ns: u64);

    /// Monotonic nanoseconds since boot.
    fn now_ns(&self) -> u64;
}
