//! Runtime helpers callable from emitted code
//!
//! The concrete functions behind the [`HelperTable`]: allocation, type
//! checks, exception raising, delegates, thread control and the
//! safepoint slow path. All of them run on a managed thread's stack with
//! that thread's context as their first argument; the ones that can
//! raise receive the faulting frame and PC explicitly.

use super::trampoline::{poll_flags, HelperTable, RuntimeContext};
use crate::fault::FaultKind;
use crate::gc::HandleKind;
use crate::object::GcRef;
use crate::runtime::runtime;
use crate::sched::ThreadRecord;
use crate::types::registry::delegate_layout;
use crate::types::{MethodDesc, TypeDesc};
use argon_bytecode::PrimKind;
use std::sync::atomic::Ordering;

static HELPERS: HelperTable = HelperTable {
    safepoint_poll: hp_safepoint_poll,
    prepare_method: hp_prepare_method,
    alloc_object: hp_alloc_object,
    alloc_array: hp_alloc_array,
    alloc_multi_array: hp_alloc_multi_array,
    box_value: hp_box_value,
    unbox_value: hp_unbox_value,
    cast_class: hp_cast_class,
    is_inst: hp_is_inst,
    interface_entry: hp_interface_entry,
    stelem_check: hp_stelem_check,
    raise_fault: hp_raise_fault,
    throw_exception: hp_throw_exception,
    rethrow: hp_rethrow,
    delegate_invoke: hp_delegate_invoke,
    delegate_create: hp_delegate_create,
    float_rem64: hp_float_rem64,
    float_rem32: hp_float_rem32,
    conv_float_to_int_ovf: hp_conv_float_to_int_ovf,
    copy_bytes: hp_copy_bytes,
    thread_start: hp_thread_start,
    thread_join: hp_thread_join,
    thread_yield: hp_thread_yield,
    thread_sleep: hp_thread_sleep,
};

/// The kernel's helper table.
pub fn table() -> &'static HelperTable {
    &HELPERS
}

/// Address of the prepare helper (prepare stubs jump through it).
pub fn prepare_entry() -> usize {
    hp_prepare_method as usize
}

fn thread_of(ctx: *mut RuntimeContext) -> &'static ThreadRecord {
    // Safety: ctx lives inside its thread record, which the scheduler
    // keeps alive for the thread's lifetime
    unsafe { &*((*ctx).thread as *const ThreadRecord) }
}

// ===== Safepoints =====

extern "C" fn hp_safepoint_poll(ctx: *mut RuntimeContext, rbp: usize, pc: usize) {
    let rt = runtime();
    let thread = thread_of(ctx);

    if thread.has_flag(poll_flags::GC) {
        thread.set_parked_walk(pc, rbp);
        rt.scheduler.safepoint.park_until_resumed(thread);
        thread.clear_parked_walk();
    }
    if thread.has_flag(poll_flags::CANCEL) {
        thread.clear_flag(poll_flags::CANCEL);
        rt.raise(ctx, FaultKind::ThreadInterrupted, rbp, pc);
    }
    if thread.has_flag(poll_flags::PREEMPT) {
        match rt.scheduler.current() {
            Some(current) if std::ptr::eq(current.as_ref(), thread) => {
                rt.scheduler.yield_current(&current);
            }
            _ => thread.clear_flag(poll_flags::PREEMPT),
        }
    }
}

// ===== Compilation =====

extern "C" fn hp_prepare_method(md: usize, rbp: usize, pc: usize) -> usize {
    let rt = runtime();
    // Safety: prepare stubs embed a &'static MethodDesc
    let md = unsafe { &*(md as *const MethodDesc) };
    match rt.prepare(md) {
        Ok(entry) => entry,
        Err(err) => {
            log::warn!("jit: {}::{} failed to compile: {err}", md.declaring().name, md.name);
            let ctx = rt
                .scheduler
                .current()
                .expect("compiling off a managed thread")
                .ctx_ptr();
            rt.raise(ctx, FaultKind::TypeLoadFailed, rbp, pc)
        }
    }
}

// ===== Allocation =====

extern "C" fn hp_alloc_object(
    ctx: *mut RuntimeContext,
    td: usize,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    // Safety: emitted code embeds &'static TypeDesc
    let td = unsafe { &*(td as *const TypeDesc) };
    rt.alloc_object(ctx, td, rbp, pc).addr()
}

extern "C" fn hp_alloc_array(
    ctx: *mut RuntimeContext,
    td: usize,
    len: i64,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    let td = unsafe { &*(td as *const TypeDesc) };
    if len < 0 {
        rt.raise(ctx, FaultKind::Overflow, rbp, pc);
    }
    rt.alloc_raising(ctx, rbp, pc, || rt.heap.alloc_array(td, len as usize))
        .addr()
}

extern "C" fn hp_alloc_multi_array(
    ctx: *mut RuntimeContext,
    td: usize,
    dims: *const i64,
    rank: usize,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    let td = unsafe { &*(td as *const TypeDesc) };
    // Safety: dims points at `rank` scratch slots in the caller's frame
    let dims = unsafe { std::slice::from_raw_parts(dims, rank) };
    if dims.iter().any(|&d| d < 0) {
        rt.raise(ctx, FaultKind::Overflow, rbp, pc);
    }
    let sizes: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
    rt.alloc_raising(ctx, rbp, pc, || rt.heap.alloc_multi_array(td, &sizes))
        .addr()
}

extern "C" fn hp_box_value(
    ctx: *mut RuntimeContext,
    box_td: usize,
    src: *const u8,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    let box_td = unsafe { &*(box_td as *const TypeDesc) };
    let value_td = box_td.boxed_value().expect("box helper on non-box type");
    let obj = rt.alloc_raising(ctx, rbp, pc, || rt.heap.alloc_object(box_td));
    // Safety: payload starts after the header; src is the caller's slot
    unsafe {
        std::ptr::copy_nonoverlapping(
            src,
            obj.as_ptr().add(crate::types::HEADER_SIZE as usize),
            value_td.size as usize,
        );
    }
    obj.addr()
}

extern "C" fn hp_unbox_value(
    ctx: *mut RuntimeContext,
    obj: usize,
    td: usize,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    let td = unsafe { &*(td as *const TypeDesc) };
    let Some(obj) = (unsafe { GcRef::from_word(obj) }) else {
        rt.raise(ctx, FaultKind::NullReference, rbp, pc);
    };
    match obj.td().boxed_value() {
        Some(inner) if std::ptr::eq(inner, td) => {
            obj.addr() + crate::types::HEADER_SIZE as usize
        }
        _ => rt.raise(ctx, FaultKind::InvalidCast, rbp, pc),
    }
}

// ===== Type checks =====

extern "C" fn hp_cast_class(
    ctx: *mut RuntimeContext,
    obj: usize,
    td: usize,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    let td = unsafe { &*(td as *const TypeDesc) };
    let Some(obj_ref) = (unsafe { GcRef::from_word(obj) }) else {
        return 0; // casting null succeeds and stays null
    };
    if obj_ref.td().is_assignable_to(td) {
        obj
    } else {
        rt.raise(ctx, FaultKind::InvalidCast, rbp, pc)
    }
}

extern "C" fn hp_is_inst(_ctx: *mut RuntimeContext, obj: usize, td: usize) -> usize {
    let td = unsafe { &*(td as *const TypeDesc) };
    match unsafe { GcRef::from_word(obj) } {
        Some(obj_ref) if obj_ref.td().is_assignable_to(td) => obj,
        _ => 0,
    }
}

extern "C" fn hp_interface_entry(
    _ctx: *mut RuntimeContext,
    obj: usize,
    iface_td: usize,
    index: u32,
    _rbp: usize,
    _pc: usize,
) -> usize {
    let iface = unsafe { &*(iface_td as *const TypeDesc) };
    let obj = unsafe { GcRef::from_word(obj) }.expect("null receiver past the inline check");
    match obj.td().interface_slot(iface, index) {
        Some(md) => md.entry_point(),
        None => panic!(
            "interface dispatch failed: {} does not implement {}[{}]",
            obj.td().name,
            iface.name,
            index
        ),
    }
}

extern "C" fn hp_stelem_check(
    ctx: *mut RuntimeContext,
    array: usize,
    value: usize,
    rbp: usize,
    pc: usize,
) {
    if value == 0 {
        return; // storing null always succeeds
    }
    let rt = runtime();
    let array = unsafe { GcRef::from_word(array) }.expect("null array past the inline check");
    let value = unsafe { GcRef::from_word(value) }.unwrap();
    let element = array.td().element.expect("store check on non-array");
    if !value.td().is_assignable_to(element) {
        rt.raise(ctx, FaultKind::ArrayTypeMismatch, rbp, pc);
    }
}

// ===== Exceptions =====

extern "C" fn hp_raise_fault(
    ctx: *mut RuntimeContext,
    kind: u32,
    rbp: usize,
    pc: usize,
) -> ! {
    let rt = runtime();
    let kind = FaultKind::from_code(kind).expect("bad fault code from emitted code");
    rt.raise(ctx, kind, rbp, pc)
}

extern "C" fn hp_throw_exception(
    ctx: *mut RuntimeContext,
    exception: usize,
    rbp: usize,
    pc: usize,
) -> ! {
    let rt = runtime();
    let exception =
        unsafe { GcRef::from_word(exception) }.expect("null throw past the inline check");
    rt.dispatch_exception(ctx, exception, rbp, pc)
}

extern "C" fn hp_rethrow(ctx: *mut RuntimeContext, rbp: usize, pc: usize) -> ! {
    let rt = runtime();
    let thread = thread_of(ctx);
    let current = thread.current_exception.load(Ordering::Acquire);
    let exception = unsafe { GcRef::from_word(current) }
        .expect("rethrow with no exception in flight");
    rt.dispatch_exception(ctx, exception, rbp, pc)
}

// ===== Delegates =====

extern "C" fn hp_delegate_invoke(
    ctx: *mut RuntimeContext,
    delegate: usize,
    args: *const u64,
    argc: usize,
    rbp: usize,
    pc: usize,
) -> u64 {
    let rt = runtime();
    let head = unsafe { GcRef::from_word(delegate) }.expect("null delegate past the inline check");

    // Float-returning delegates need the thunk to read xmm0
    let ret_is_float = head
        .td()
        .methods()
        .iter()
        .find(|m| m.name == "Invoke")
        .map(|m| crate::jit::slot_kind_of(m.sig.ret).is_float())
        .unwrap_or(false);

    // The invocation list may allocate (and the GC may move things), so
    // the delegate chain is held through a handle and the argument words
    // are re-read from the caller's (stackmapped) slots per node.
    let chain = rt.handles.create(head, HandleKind::Strong);
    let nth_node = |index: usize| -> GcRef {
        let mut node = rt.handles.get(chain).expect("delegate handle dropped");
        for _ in 0..index {
            // Safety: delegate layout is fixed by the registry
            node = unsafe { node.read_ref(delegate_layout::NEXT_OFFSET) }
                .expect("multicast chain shrank");
        }
        node
    };

    let mut node_index = 0usize;
    let mut result;
    loop {
        let node = nth_node(node_index);
        // Safety: delegate layout is fixed by the registry; argument
        // words are re-read from the caller's stackmapped slots so a
        // collection during an earlier node cannot leave them stale.
        unsafe {
            let target = node.read_ref(delegate_layout::TARGET_OFFSET);
            let code = node.read::<u64>(delegate_layout::CODE_OFFSET) as usize;
            let mut call_args = Vec::with_capacity(argc + 1);
            if let Some(target) = target {
                call_args.push(target.addr() as u64);
            }
            for k in 0..argc {
                // arg k sits above the topmost slot by (argc-1-k) words
                call_args.push(args.add(argc - 1 - k).read());
            }
            result = rt.invoke_raw(code, &call_args, ctx, ret_is_float);
        }
        // Safety: as above
        if unsafe { nth_node(node_index).read_ref(delegate_layout::NEXT_OFFSET) }.is_none() {
            break;
        }
        node_index += 1;
    }
    rt.handles.drop_handle(chain);
    let _ = (rbp, pc);
    result
}

extern "C" fn hp_delegate_create(
    ctx: *mut RuntimeContext,
    td: usize,
    target: usize,
    code: usize,
    rbp: usize,
    pc: usize,
) -> usize {
    let rt = runtime();
    let td = unsafe { &*(td as *const TypeDesc) };
    let obj = rt.alloc_raising(ctx, rbp, pc, || rt.heap.alloc_object(td));
    // Safety: delegate layout is fixed by the registry
    unsafe {
        obj.write::<u64>(delegate_layout::TARGET_OFFSET, target as u64);
        obj.write::<u64>(delegate_layout::CODE_OFFSET, code as u64);
        obj.write::<u64>(delegate_layout::NEXT_OFFSET, 0);
    }
    obj.addr()
}

// ===== Float support =====

extern "C" fn hp_float_rem64(a: f64, b: f64) -> f64 {
    a % b
}

extern "C" fn hp_float_rem32(a: f32, b: f32) -> f32 {
    a % b
}

extern "C" fn hp_conv_float_to_int_ovf(
    ctx: *mut RuntimeContext,
    bits: u64,
    from_double: u32,
    target: u32,
    rbp: usize,
    pc: usize,
) -> i64 {
    let rt = runtime();
    let value = if from_double != 0 {
        f64::from_bits(bits)
    } else {
        f32::from_bits(bits as u32) as f64
    };
    let target = PrimKind::from_u8(target as u8).expect("bad conv target");
    let (lo, hi) = match target {
        PrimKind::I1 => (i8::MIN as f64, i8::MAX as f64),
        PrimKind::U1 => (0.0, u8::MAX as f64),
        PrimKind::I2 => (i16::MIN as f64, i16::MAX as f64),
        PrimKind::U2 => (0.0, u16::MAX as f64),
        PrimKind::I4 => (i32::MIN as f64, i32::MAX as f64),
        PrimKind::U4 => (0.0, u32::MAX as f64),
        PrimKind::I8 => (i64::MIN as f64, i64::MAX as f64),
        PrimKind::U8 => (0.0, u64::MAX as f64),
        _ => panic!("bad conv target"),
    };
    if value.is_nan() || value < lo || value > hi {
        rt.raise(ctx, FaultKind::Overflow, rbp, pc);
    }
    value.trunc() as i64
}

extern "C" fn hp_copy_bytes(dst: *mut u8, src: *const u8, len: usize) {
    // Safety: emitted code supplies in-bounds ranges
    unsafe { std::ptr::copy(src, dst, len) };
}

// ===== Thread control =====

extern "C" fn hp_thread_start(
    ctx: *mut RuntimeContext,
    delegate: usize,
    rbp: usize,
    pc: usize,
) -> i64 {
    let rt = runtime();
    let Some(delegate) = (unsafe { GcRef::from_word(delegate) }) else {
        rt.raise(ctx, FaultKind::NullReference, rbp, pc);
    };
    let handle = rt.handles.create(delegate, HandleKind::Strong);
    let spawned = rt.scheduler.spawn(Box::new(move || {
        let rt = runtime();
        let thread = rt.scheduler.current().expect("spawned thread not current");
        let dele = rt.handles.get(handle).expect("delegate handle dropped");
        // Safety: delegate layout is fixed; zero-argument invoke
        unsafe {
            let target = dele.read_ref(delegate_layout::TARGET_OFFSET);
            let code = dele.read::<u64>(delegate_layout::CODE_OFFSET) as usize;
            let args: Vec<u64> = target.map(|t| vec![t.addr() as u64]).unwrap_or_default();
            rt.invoke_raw(code, &args, thread.ctx_ptr(), false);
        }
        rt.handles.drop_handle(handle);
    }));
    match spawned {
        Ok(thread) => thread.id.0 as i64,
        Err(kind) => rt.raise(ctx, kind, rbp, pc),
    }
}

extern "C" fn hp_thread_join(
    _ctx: *mut RuntimeContext,
    id: i64,
    timeout_ms: i64,
    rbp: usize,
    pc: usize,
) -> i32 {
    let rt = runtime();
    let current = rt.scheduler.current().expect("join off a managed thread");
    let target = rt
        .scheduler
        .threads()
        .into_iter()
        .find(|t| t.id.0 as i64 == id);
    let Some(target) = target else {
        return 0; // already reaped
    };
    let deadline = (timeout_ms >= 0)
        .then(|| rt.services.timer.now_ns() + timeout_ms as u64 * 1_000_000);
    let _ = (rbp, pc);
    match rt.scheduler.join(&current, &target, deadline) {
        crate::sched::WakeReason::Signaled => 0,
        crate::sched::WakeReason::TimedOut => 1,
    }
}

extern "C" fn hp_thread_yield(ctx: *mut RuntimeContext, _rbp: usize, _pc: usize) {
    let rt = runtime();
    let thread = thread_of(ctx);
    if let Some(current) = rt.scheduler.current() {
        if std::ptr::eq(current.as_ref(), thread) {
            rt.scheduler.yield_current(&current);
        }
    }
}

extern "C" fn hp_thread_sleep(ctx: *mut RuntimeContext, ms: i64, _rbp: usize, _pc: usize) {
    let rt = runtime();
    let thread = thread_of(ctx);
    if ms <= 0 {
        hp_thread_yield(ctx, 0, 0);
        return;
    }
    if let Some(current) = rt.scheduler.current() {
        if std::ptr::eq(current.as_ref(), thread) {
            let deadline = rt.services.timer.now_ns() + ms as u64 * 1_000_000;
            rt.scheduler.block_current(&current, Some(deadline));
        }
    }
}
