//! Two-pass exception dispatch
//!
//! Pass 1 (search) walks from the throwing frame toward the thread root,
//! consulting each method's EH table innermost-first; catch clauses match
//! by assignability and filter funclets run during the search, before any
//! unwinding. Pass 2 (unwind) re-walks the same frames, running
//! finally/fault funclets for every region being exited in lexical
//! nesting order, then restores register state and resumes at the chosen
//! handler with the exception reference in the defined register.
//!
//! A filter that throws is swallowed and treated as not matching: the
//! dispatcher captures a resume point before invoking a filter, and a
//! nested dispatch that starts while a filter is on the stack restores
//! straight back into the capture with a no-match verdict.

pub mod frames;

pub use frames::{Frame, FrameWalker};

use crate::gc::{HandleKind, HandleTable};
use crate::jit::code_heap::CodeHeap;
use crate::jit::tables::HandlerKind;
use crate::jit::trampoline::{FuncletInvokerFn, RuntimeContext, EXCEPTION_REG};
use crate::object::GcRef;
use crate::sched::ThreadRecord;
use argon_hal::cpu::gpr;
use argon_hal::{CpuContext, CpuControl};
use std::sync::atomic::Ordering;

/// Everything dispatch needs from the runtime.
pub struct EhContext<'a> {
    /// Code heap (PC-to-method resolution).
    pub code_heap: &'a CodeHeap,
    /// Handle table (the in-flight exception is GC-visible through it).
    pub handles: &'a HandleTable,
    /// CPU control for capture/restore.
    pub cpu: &'static dyn CpuControl,
    /// The emitted funclet invoker.
    pub invoker: FuncletInvokerFn,
    /// The throwing thread's runtime context (funclets need it in `r14`).
    pub rt_ctx: *mut RuntimeContext,
    /// The throwing thread.
    pub thread: &'a ThreadRecord,
}

/// Result of a dispatch that did not transfer control.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No frame on this thread handles the exception.
    Unhandled,
}

/// The handler chosen by pass 1.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    /// Frame that owns the handler.
    pub rbp: usize,
    /// Absolute address of the handler.
    pub handler_abs: usize,
    /// Native offset of the handler within its method.
    pub handler_off: u32,
    /// The owning method's frame size (to rebuild `rsp`).
    pub frame_size: u32,
}

/// Dispatch an exception. Transfers control to the handler and never
/// returns when one is found; returns [`Outcome::Unhandled`] otherwise.
pub fn dispatch(eh: &EhContext<'_>, exception: GcRef, throw_pc: usize, throw_rbp: usize) -> Outcome {
    // A throw escaping a filter funclet resumes the dispatcher that
    // invoked the filter; the filter is treated as not matching.
    if eh.thread.filter_depth.load(Ordering::Acquire) > 0 {
        log::warn!("eh: exception thrown inside a filter; swallowed");
        // Safety: the capture below the filter invocation is still live
        unsafe { eh.cpu.restore(eh.thread.filter_resume.get()) };
    }

    eh.thread.set_eh_walk(throw_pc, throw_rbp);
    eh.thread
        .current_exception
        .store(exception.addr(), Ordering::Release);
    let handle = eh.handles.create(exception, HandleKind::Strong);

    let mut run_filter = |funclet_abs: usize, rbp: usize, exc: usize| -> u64 {
        // Capture a resume point so a throwing filter can be swallowed
        // Safety: the snapshot storage lives in the thread record and this
        // frame stays live across the funclet call.
        let captured = unsafe { eh.cpu.capture(eh.thread.filter_resume.get()) };
        if captured {
            eh.thread.filter_depth.fetch_add(1, Ordering::AcqRel);
            // Safety: funclet_abs points into published code
            let verdict = unsafe { (eh.invoker)(funclet_abs, rbp, exc, eh.rt_ctx) };
            eh.thread.filter_depth.fetch_sub(1, Ordering::AcqRel);
            verdict
        } else {
            // Resumed here because the filter threw
            eh.thread.filter_depth.fetch_sub(1, Ordering::AcqRel);
            0
        }
    };

    let target = search(
        eh.code_heap,
        throw_pc,
        throw_rbp,
        exception.td(),
        &mut |funclet, rbp| {
            let exc = eh.handles.get(handle).expect("exception handle dropped").addr();
            run_filter(funclet, rbp, exc)
        },
    );

    let Some(target) = target else {
        let name = exception.td().name.clone();
        *eh.thread.died_unhandled.lock() = Some(name);
        eh.thread.clear_eh_walk();
        eh.handles.drop_handle(handle);
        return Outcome::Unhandled;
    };

    // Pass 2: run finally/fault funclets for every exited region
    let mut run_finally = |funclet_abs: usize, rbp: usize| {
        let exc = eh.handles.get(handle).expect("exception handle dropped").addr();
        // Safety: funclet_abs points into published code
        unsafe { (eh.invoker)(funclet_abs, rbp, exc, eh.rt_ctx) };
    };
    unwind(eh.code_heap, throw_pc, throw_rbp, &target, &mut run_finally);

    // The exception may have moved while funclets allocated
    let exception = eh.handles.get(handle).expect("exception handle dropped");
    eh.thread
        .current_exception
        .store(exception.addr(), Ordering::Release);
    eh.thread.clear_eh_walk();
    eh.handles.drop_handle(handle);

    let mut resume = CpuContext::zeroed();
    resume.rip = target.handler_abs as u64;
    resume.rsp = (target.rbp - target.frame_size as usize) as u64;
    resume.gpr[gpr::RBP] = target.rbp as u64;
    resume.gpr[EXCEPTION_REG.number() as usize] = exception.addr() as u64;
    resume.gpr[gpr::R14] = eh.rt_ctx as u64;
    // Safety: the target frame is live; everything below it is abandoned
    unsafe { eh.cpu.restore(&resume) };
}

/// Pass 1: find the handling (frame, handler) pair.
///
/// `filter` invokes a filter funclet and returns its verdict.
pub(crate) fn search(
    code_heap: &CodeHeap,
    throw_pc: usize,
    throw_rbp: usize,
    thrown: &'static crate::types::TypeDesc,
    filter: &mut dyn FnMut(usize, usize) -> u64,
) -> Option<Target> {
    for frame in FrameWalker::new(code_heap, throw_pc, throw_rbp) {
        let Some(code) = frame.md.compiled() else {
            continue;
        };
        let off = code.offset_of(frame.pc);
        for entry in code.eh.enclosing(off) {
            match entry.kind {
                HandlerKind::Catch(catch_td) => {
                    if thrown.is_assignable_to(catch_td) {
                        return Some(Target {
                            rbp: frame.rbp,
                            handler_abs: code.code_ptr + entry.handler_pc as usize,
                            handler_off: entry.handler_pc,
                            frame_size: code.frame_size,
                        });
                    }
                }
                HandlerKind::Filter { filter_pc } => {
                    let verdict = filter(code.code_ptr + filter_pc as usize, frame.rbp);
                    if verdict != 0 {
                        return Some(Target {
                            rbp: frame.rbp,
                            handler_abs: code.code_ptr + entry.handler_pc as usize,
                            handler_off: entry.handler_pc,
                            frame_size: code.frame_size,
                        });
                    }
                }
                HandlerKind::Finally | HandlerKind::Fault => {}
            }
        }
    }
    None
}

/// Pass 2: run finally/fault funclets from the throw site up to (and
/// within) the target frame, in lexical nesting order.
pub(crate) fn unwind(
    code_heap: &CodeHeap,
    throw_pc: usize,
    throw_rbp: usize,
    target: &Target,
    run: &mut dyn FnMut(usize, usize),
) {
    for frame in FrameWalker::new(code_heap, throw_pc, throw_rbp) {
        let Some(code) = frame.md.compiled() else {
            continue;
        };
        let off = code.offset_of(frame.pc);
        let is_target = frame.rbp == target.rbp;
        for entry in code.eh.enclosing(off) {
            let cleanup = matches!(entry.kind, HandlerKind::Finally | HandlerKind::Fault);
            if !cleanup {
                continue;
            }
            // In the target frame, regions that also protect the chosen
            // handler are not being exited
            if is_target && entry.protects(target.handler_off) {
                continue;
            }
            run(code.code_ptr + entry.handler_pc as usize, frame.rbp);
        }
        if is_target {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::jit::tables::{CompiledCode, EhEntry, EhTable, StackMap};
    use crate::types::TypeRegistry;
    use once_cell::sync::Lazy;

    static REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::new);

    /// Publish a fake method whose EH table is handcrafted.
    fn method_with_eh(
        code_heap: &CodeHeap,
        name: &str,
        size: usize,
        eh: Vec<EhEntry>,
    ) -> (&'static crate::types::MethodDesc, usize) {
        let md = frames::tests::dummy_method(name);
        let addr = code_heap.publish(&vec![0x90u8; size], Some(md)).unwrap();
        md.compiled
            .set(CompiledCode {
                code_ptr: addr,
                code_size: size,
                entry_offset: 0,
                frame_size: 32,
                stackmap: StackMap::default(),
                eh: EhTable::new(eh),
            })
            .ok()
            .unwrap();
        (md, addr)
    }

    /// A single managed frame at (pc, rbp) with a sentinel caller.
    fn single_frame(stack: &mut [usize; 4]) -> usize {
        stack[0] = 0; // sentinel rbp
        stack[1] = 0xdead_0000;
        stack.as_ptr() as usize
    }

    #[test]
    fn test_search_matches_catch_by_assignability() {
        let code_heap = CodeHeap::new(*SERVICES);
        let string_td = REGISTRY.string();
        let object_td = REGISTRY.object();
        let (_md, addr) = method_with_eh(
            &code_heap,
            "m",
            64,
            vec![EhEntry {
                try_start: 0,
                try_end: 32,
                handler_pc: 40,
                kind: HandlerKind::Catch(object_td),
            }],
        );
        let mut stack = [0usize; 4];
        let rbp = single_frame(&mut stack);

        // Throwing a string inside the try: object catch matches
        let target = search(&code_heap, addr + 8, rbp, string_td, &mut |_, _| 0).unwrap();
        assert_eq!(target.handler_abs, addr + 40);
        assert_eq!(target.rbp, rbp);

        // Outside the protected range: no handler
        assert!(search(&code_heap, addr + 50, rbp, string_td, &mut |_, _| 0).is_none());
    }

    #[test]
    fn test_search_innermost_region_wins() {
        let code_heap = CodeHeap::new(*SERVICES);
        let object_td = REGISTRY.object();
        let (_md, addr) = method_with_eh(
            &code_heap,
            "m",
            128,
            vec![
                EhEntry {
                    try_start: 8,
                    try_end: 16,
                    handler_pc: 64,
                    kind: HandlerKind::Catch(object_td),
                },
                EhEntry {
                    try_start: 0,
                    try_end: 48,
                    handler_pc: 96,
                    kind: HandlerKind::Catch(object_td),
                },
            ],
        );
        let mut stack = [0usize; 4];
        let rbp = single_frame(&mut stack);
        let target = search(&code_heap, addr + 10, rbp, object_td, &mut |_, _| 0).unwrap();
        assert_eq!(target.handler_abs, addr + 64);
    }

    #[test]
    fn test_filter_runs_during_search_and_verdict_selects() {
        let code_heap = CodeHeap::new(*SERVICES);
        let object_td = REGISTRY.object();
        let (_md, addr) = method_with_eh(
            &code_heap,
            "m",
            128,
            vec![
                EhEntry {
                    try_start: 0,
                    try_end: 32,
                    handler_pc: 80,
                    kind: HandlerKind::Filter { filter_pc: 64 },
                },
                EhEntry {
                    try_start: 0,
                    try_end: 48,
                    handler_pc: 96,
                    kind: HandlerKind::Catch(object_td),
                },
            ],
        );
        let mut stack = [0usize; 4];
        let rbp = single_frame(&mut stack);

        // Filter rejects: outer catch is chosen
        let mut ran = Vec::new();
        let target = search(&code_heap, addr + 8, rbp, object_td, &mut |pc, _| {
            ran.push(pc);
            0
        })
        .unwrap();
        assert_eq!(ran, vec![addr + 64]);
        assert_eq!(target.handler_abs, addr + 96);

        // Filter accepts: its handler is chosen
        let target = search(&code_heap, addr + 8, rbp, object_td, &mut |_, _| 1).unwrap();
        assert_eq!(target.handler_abs, addr + 80);
    }

    #[test]
    fn test_unwind_runs_finallys_inside_out_and_stops_at_target() {
        let code_heap = CodeHeap::new(*SERVICES);
        let object_td = REGISTRY.object();
        // Inner frame: two nested finallys; outer frame: the catch target
        let (_inner, inner_addr) = method_with_eh(
            &code_heap,
            "inner",
            128,
            vec![
                EhEntry {
                    try_start: 8,
                    try_end: 16,
                    handler_pc: 64,
                    kind: HandlerKind::Finally,
                },
                EhEntry {
                    try_start: 0,
                    try_end: 32,
                    handler_pc: 96,
                    kind: HandlerKind::Finally,
                },
            ],
        );
        let (_outer, outer_addr) = method_with_eh(
            &code_heap,
            "outer",
            128,
            vec![
                EhEntry {
                    try_start: 0,
                    try_end: 64,
                    handler_pc: 80,
                    kind: HandlerKind::Catch(object_td),
                },
                EhEntry {
                    try_start: 0,
                    try_end: 100,
                    handler_pc: 112,
                    kind: HandlerKind::Finally,
                },
            ],
        );

        // inner frame -> outer frame -> sentinel
        let mut stack = vec![0usize; 6];
        let base = stack.as_mut_ptr() as usize;
        let outer_rbp = base + 16;
        let inner_rbp = base;
        stack[0] = outer_rbp;
        stack[1] = outer_addr + 8; // return pc inside outer's try
        stack[2] = 0; // sentinel
        stack[3] = 0xdead_0000;

        let throw_pc = inner_addr + 10;
        let target = search(&code_heap, throw_pc, inner_rbp, object_td, &mut |_, _| 0).unwrap();
        assert_eq!(target.rbp, outer_rbp);

        let mut ran = Vec::new();
        unwind(&code_heap, throw_pc, inner_rbp, &target, &mut |pc, rbp| {
            ran.push((pc, rbp));
        });
        // Inner finallys inside-out, then nothing in the target frame:
        // the outer finally at 112 also protects the handler (100 > 80)
        assert_eq!(
            ran,
            vec![(inner_addr + 64, inner_rbp), (inner_addr + 96, inner_rbp)]
        );
    }
}
