//! Runtime ABI between emitted code and the kernel
//!
//! Emitted code keeps a pinned register (`r14`) holding the current
//! thread's [`RuntimeContext`]: the safepoint flag word, the TLAB bump
//! pair, and a table of helper entry points. All managed arguments pass
//! on the stack; the callee pops them with `ret imm16`. Integer and
//! reference results return in `rax`, floats in `xmm0`.
//!
//! ## Managed calling convention
//!
//! ```text
//! caller:   sub rsp, padded(argc)         ; 16-byte multiple
//!           mov [rsp + 8*i], arg_i        ; left-to-right
//!           call entry
//! callee:   push rbp ; mov rbp, rsp
//!           sub rsp, frame_size           ; 16-byte multiple
//!           ...
//!           ret padded(argc)
//! ```
//!
//! Arguments are at `[rbp + 16 + 8*i]`; locals and spill slots below
//! `rbp`. Frames always chain through `rbp`, which is what lets the GC
//! and the exception dispatcher walk them.
//!
//! This module also emits the three kernel thunks that bridge the two
//! worlds: the per-method prepare stub (first-call compile trampoline),
//! the argument-marshalling invoke thunk (kernel calling managed), and
//! the funclet invoker (exception dispatcher calling filter/finally
//! funclets with a borrowed frame pointer).

use super::emit::{Asm, Cond, Fpr, Reg};
use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, AtomicUsize};

/// Safepoint flag bits in [`RuntimeContext::flags`].
pub mod poll_flags {
    /// The scheduler wants this thread to yield.
    pub const PREEMPT: u32 = 1 << 0;
    /// The GC coordinator wants this thread parked.
    pub const GC: u32 = 1 << 1;
    /// Cooperative cancellation: raise ThreadInterrupted.
    pub const CANCEL: u32 = 1 << 2;
}

/// Bytes a call site reserves for `argc` stack arguments (16-byte
/// multiple; the callee pops the same amount).
pub fn padded_arg_bytes(argc: usize) -> u32 {
    ((argc * 8 + 15) & !15) as u32
}

/// Table of kernel entry points callable from emitted code.
///
/// All fields are `extern "C"` function pointers; emitted code loads them
/// from the context with `call [r14 + offset]`.
#[repr(C)]
pub struct HelperTable {
    /// Safepoint slow path: park/yield/raise as flags demand. Receives
    /// the polling frame so the GC can walk from it while parked.
    pub safepoint_poll: extern "C" fn(ctx: *mut RuntimeContext, rbp: usize, pc: usize),
    /// First-call compile: returns the compiled entry point.
    pub prepare_method: extern "C" fn(md: usize, rbp: usize, pc: usize) -> usize,
    /// Allocate an object of the given type.
    pub alloc_object: extern "C" fn(ctx: *mut RuntimeContext, td: usize, rbp: usize, pc: usize) -> usize,
    /// Allocate a single-dimension array.
    pub alloc_array:
        extern "C" fn(ctx: *mut RuntimeContext, td: usize, len: i64, rbp: usize, pc: usize) -> usize,
    /// Allocate a multi-dimension array from a dims vector.
    pub alloc_multi_array: extern "C" fn(
        ctx: *mut RuntimeContext,
        td: usize,
        dims: *const i64,
        rank: usize,
        rbp: usize,
        pc: usize,
    ) -> usize,
    /// Box a value: allocate and copy.
    pub box_value:
        extern "C" fn(ctx: *mut RuntimeContext, box_td: usize, src: *const u8, rbp: usize, pc: usize) -> usize,
    /// Unbox: type-check and return the payload address.
    pub unbox_value:
        extern "C" fn(ctx: *mut RuntimeContext, obj: usize, td: usize, rbp: usize, pc: usize) -> usize,
    /// `castclass`: raises InvalidCast on failure.
    pub cast_class:
        extern "C" fn(ctx: *mut RuntimeContext, obj: usize, td: usize, rbp: usize, pc: usize) -> usize,
    /// `isinst`: returns the reference or null.
    pub is_inst: extern "C" fn(ctx: *mut RuntimeContext, obj: usize, td: usize) -> usize,
    /// Interface dispatch: resolve the implementing entry point through
    /// the receiver's interface map.
    pub interface_entry: extern "C" fn(
        ctx: *mut RuntimeContext,
        obj: usize,
        iface_td: usize,
        index: u32,
        rbp: usize,
        pc: usize,
    ) -> usize,
    /// Covariant array store check: raises ArrayTypeMismatch.
    pub stelem_check:
        extern "C" fn(ctx: *mut RuntimeContext, array: usize, value: usize, rbp: usize, pc: usize),
    /// Raise a runtime fault by kind. Never returns.
    pub raise_fault: extern "C" fn(ctx: *mut RuntimeContext, kind: u32, rbp: usize, pc: usize) -> !,
    /// `throw`. Never returns.
    pub throw_exception:
        extern "C" fn(ctx: *mut RuntimeContext, exception: usize, rbp: usize, pc: usize) -> !,
    /// `rethrow`. Never returns.
    pub rethrow: extern "C" fn(ctx: *mut RuntimeContext, rbp: usize, pc: usize) -> !,
    /// Invoke a delegate chain with marshalled arguments.
    pub delegate_invoke: extern "C" fn(
        ctx: *mut RuntimeContext,
        delegate: usize,
        args: *const u64,
        argc: usize,
        rbp: usize,
        pc: usize,
    ) -> u64,
    /// Construct a delegate over (target, code).
    pub delegate_create: extern "C" fn(
        ctx: *mut RuntimeContext,
        td: usize,
        target: usize,
        code: usize,
        rbp: usize,
        pc: usize,
    ) -> usize,
    /// IEEE remainder for f64 (`Rem` on floats).
    pub float_rem64: extern "C" fn(a: f64, b: f64) -> f64,
    /// IEEE remainder for f32.
    pub float_rem32: extern "C" fn(a: f32, b: f32) -> f32,
    /// Checked float-to-integer conversion; raises Overflow.
    pub conv_float_to_int_ovf: extern "C" fn(
        ctx: *mut RuntimeContext,
        bits: u64,
        from_double: u32,
        target: u32,
        rbp: usize,
        pc: usize,
    ) -> i64,
    /// Bulk copy for oversized value types.
    pub copy_bytes: extern "C" fn(dst: *mut u8, src: *const u8, len: usize),
    /// Spawn a thread running a zero-argument delegate; returns its id.
    pub thread_start:
        extern "C" fn(ctx: *mut RuntimeContext, delegate: usize, rbp: usize, pc: usize) -> i64,
    /// Join a thread by id with an optional millisecond timeout (<0 =
    /// infinite). Returns 0 on signal, 1 on timeout.
    pub thread_join: extern "C" fn(
        ctx: *mut RuntimeContext,
        id: i64,
        timeout_ms: i64,
        rbp: usize,
        pc: usize,
    ) -> i32,
    /// Voluntarily yield the calling thread.
    pub thread_yield: extern "C" fn(ctx: *mut RuntimeContext, rbp: usize, pc: usize),
    /// Sleep the calling thread for the given milliseconds.
    pub thread_sleep:
        extern "C" fn(ctx: *mut RuntimeContext, ms: i64, rbp: usize, pc: usize),
}

/// Per-thread context pinned in `r14` while managed code runs.
#[repr(C)]
pub struct RuntimeContext {
    /// Safepoint flags, checked by every poll sequence.
    pub flags: AtomicU32,
    _pad: u32,
    /// TLAB bump pointer.
    pub tlab_ptr: AtomicUsize,
    /// TLAB limit.
    pub tlab_end: AtomicUsize,
    /// The owning thread record (opaque to this module).
    pub thread: *mut (),
    /// The global runtime (opaque to this module).
    pub runtime: *const (),
    /// Kernel entry points.
    pub helpers: &'static HelperTable,
}

// Safety: the context is only mutated by its owning thread and, while
// that thread is parked, by the scheduler/GC.
unsafe impl Send for RuntimeContext {}
unsafe impl Sync for RuntimeContext {}

impl RuntimeContext {
    /// Create a context for a fresh thread.
    pub fn new(thread: *mut (), runtime: *const (), helpers: &'static HelperTable) -> Self {
        Self {
            flags: AtomicU32::new(0),
            _pad: 0,
            tlab_ptr: AtomicUsize::new(0),
            tlab_end: AtomicUsize::new(0),
            thread,
            runtime,
            helpers,
        }
    }
}

/// Offset of the flag word (codegen poll sequence).
pub const CTX_FLAGS: i32 = offset_of!(RuntimeContext, flags) as i32;
/// Offset of the TLAB bump pointer.
pub const CTX_TLAB_PTR: i32 = offset_of!(RuntimeContext, tlab_ptr) as i32;
/// Offset of the TLAB limit.
pub const CTX_TLAB_END: i32 = offset_of!(RuntimeContext, tlab_end) as i32;
/// Offset of the helper-table pointer.
pub const CTX_HELPERS: i32 = offset_of!(RuntimeContext, helpers) as i32;

/// Offset of a helper slot within [`HelperTable`].
#[macro_export]
macro_rules! helper_offset {
    ($field:ident) => {
        std::mem::offset_of!($crate::jit::trampoline::HelperTable, $field) as i32
    };
}

/// The register emitted code keeps the context in.
pub const CTX_REG: Reg = Reg::R14;

/// Register holding the exception reference at catch/filter entry.
pub const EXCEPTION_REG: Reg = Reg::Rcx;

/// Emit the per-method prepare stub.
///
/// The stub is the method's entry point until first call: it forwards to
/// the compile helper with the method descriptor and the caller's frame,
/// then tail-jumps into the compiled code with the original stack intact.
pub fn emit_prepare_stub(md: usize, prepare_fn: usize) -> Vec<u8> {
    let mut a = Asm::new();
    a.push(Reg::Rax); // align
    a.mov_ri(Reg::Rdi, md as i64);
    a.mov_rr(Reg::Rsi, Reg::Rbp);
    a.mov_rm(Reg::Rdx, Reg::Rsp, 8); // caller's return address
    a.mov_ri(Reg::Rax, prepare_fn as i64);
    a.call_r(Reg::Rax);
    a.pop(Reg::Rcx);
    a.jmp_r(Reg::Rax);
    a.finish()
}

/// Emit the invoke thunk: `fn(entry, args, argc, ctx, ret_is_float) -> u64`.
///
/// Copies `argc` raw argument words onto a fresh managed argument area and
/// calls `entry` with `r14` set to `ctx`. Returns the raw result bits.
pub fn emit_invoke_thunk() -> Vec<u8> {
    let mut a = Asm::new();
    // rdi=entry rsi=args rdx=argc rcx=ctx r8=ret_is_float
    a.push(Reg::Rbp);
    a.mov_rr(Reg::Rbp, Reg::Rsp);
    a.push(Reg::R14);
    a.push(Reg::R15);
    a.push(Reg::Rbx);
    a.push(Reg::R12); // alignment: rsp is 16-byte aligned here
    a.mov_rr(Reg::R14, Reg::Rcx);
    a.mov_rr(Reg::R15, Reg::R8);
    a.mov_rr(Reg::Rbx, Reg::Rdx);

    // padded = (argc*8 + 15) & !15
    a.mov_rr(Reg::Rax, Reg::Rbx);
    a.shift_imm(4, Reg::Rax, 3);
    a.add_ri(Reg::Rax, 15);
    a.and_ri(Reg::Rax, -16);
    a.sub_rr(Reg::Rsp, Reg::Rax);

    // copy args: r11 = dst cursor, rsi = src cursor, rbx = remaining
    a.mov_rr(Reg::R11, Reg::Rsp);
    let copy_top = a.label();
    let copy_done = a.label();
    a.bind(copy_top);
    a.test_rr(Reg::Rbx, Reg::Rbx);
    a.jcc(Cond::E, copy_done);
    a.mov_rm(Reg::R10, Reg::Rsi, 0);
    a.mov_mr(Reg::R11, 0, Reg::R10);
    a.add_ri(Reg::Rsi, 8);
    a.add_ri(Reg::R11, 8);
    a.sub_ri(Reg::Rbx, 1);
    a.jmp(copy_top);
    a.bind(copy_done);

    a.call_r(Reg::Rdi); // callee pops the argument area

    // Float results come back in xmm0; normalize to rax bits
    let int_ret = a.label();
    a.test_rr(Reg::R15, Reg::R15);
    a.jcc(Cond::E, int_ret);
    a.movq_rx(Reg::Rax, Fpr::Xmm0);
    a.bind(int_ret);

    a.pop(Reg::R12);
    a.pop(Reg::Rbx);
    a.pop(Reg::R15);
    a.pop(Reg::R14);
    a.pop(Reg::Rbp);
    a.ret();
    a.finish()
}

/// Emit the funclet invoker: `fn(funclet_pc, frame_rbp, exception, ctx) -> u64`.
///
/// Calls a filter/finally funclet with `rbp` borrowed from the frame being
/// searched or unwound. Filters return their verdict in `rax`.
pub fn emit_funclet_invoker() -> Vec<u8> {
    let mut a = Asm::new();
    // rdi=funclet rsi=frame_rbp rdx=exception rcx=ctx
    a.push(Reg::Rbp);
    a.push(Reg::R14);
    a.push(Reg::Rbx); // alignment
    a.mov_rr(Reg::Rbp, Reg::Rsi);
    a.mov_rr(Reg::R14, Reg::Rcx);
    a.mov_rr(EXCEPTION_REG, Reg::Rdx);
    a.call_r(Reg::Rdi);
    a.pop(Reg::Rbx);
    a.pop(Reg::R14);
    a.pop(Reg::Rbp);
    a.ret();
    a.finish()
}

/// Signature of the emitted invoke thunk.
pub type InvokeThunkFn =
    unsafe extern "C" fn(entry: usize, args: *const u64, argc: usize, ctx: *mut RuntimeContext, ret_is_float: usize) -> u64;

/// Signature of the emitted funclet invoker.
pub type FuncletInvokerFn =
    unsafe extern "C" fn(funclet_pc: usize, frame_rbp: usize, exception: usize, ctx: *mut RuntimeContext) -> u64;
