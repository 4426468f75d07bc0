//! Managed frame walking
//!
//! Walks the `rbp` chain from a (pc, rbp) origin toward the thread root,
//! yielding managed frames (PCs owned by the code heap) and skipping
//! native helper frames in between. The walk terminates at the sentinel
//! frame pointer (zero) every thread is bootstrapped with. Shared by the
//! GC's root scanner and the exception dispatcher.

use crate::jit::code_heap::CodeHeap;
use crate::types::MethodDesc;

/// One managed frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// PC inside the method's emitted code.
    pub pc: usize,
    /// The frame's base pointer.
    pub rbp: usize,
    /// The method owning `pc`.
    pub md: &'static MethodDesc,
}

/// Iterator over managed frames.
pub struct FrameWalker<'a> {
    code_heap: &'a CodeHeap,
    pc: usize,
    rbp: usize,
}

impl<'a> FrameWalker<'a> {
    /// Start a walk at a (pc, rbp) origin.
    pub fn new(code_heap: &'a CodeHeap, pc: usize, rbp: usize) -> Self {
        Self { code_heap, pc, rbp }
    }

    /// Advance to the caller of the current position.
    ///
    /// # Safety (internal)
    ///
    /// Relies on every frame in the chain being rbp-linked; the managed
    /// calling convention guarantees it for emitted code, and the kernel
    /// is built with frame pointers for its own frames.
    fn advance(&mut self) {
        // Safety: rbp was validated non-zero by the caller
        unsafe {
            let rbp = self.rbp as *const usize;
            self.pc = rbp.add(1).read();
            self.rbp = rbp.read();
        }
    }
}

impl<'a> Iterator for FrameWalker<'a> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if self.rbp == 0 || self.rbp % 8 != 0 {
                return None;
            }
            if let Some(md) = self.code_heap.find_method(self.pc) {
                let frame = Frame {
                    pc: self.pc,
                    rbp: self.rbp,
                    md,
                };
                self.advance();
                return Some(frame);
            }
            // Native frame between managed frames: skip it
            self.advance();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::types::registry::leak_method;
    use crate::types::{MethodDesc, ResolvedSig, TypeDesc, TypeKind, TypeRegistry};
    use argon_bytecode::module::MethodFlags;
    use once_cell::sync::OnceCell;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn dummy_method(name: &str) -> &'static MethodDesc {
        let registry = Box::leak(Box::new(TypeRegistry::new()));
        let td = crate::types::registry_leak_for_tests(TypeDesc::shell(
            "TestType".into(),
            TypeKind::Reference,
            16,
            8,
            None,
        ));
        let md = leak_method(MethodDesc {
            name: name.into(),
            declaring: OnceCell::new(),
            flags: MethodFlags::STATIC,
            sig: ResolvedSig {
                has_this: false,
                params: vec![],
                ret: registry.prim(crate::types::Prim::Void),
            },
            body: None,
            module: crate::loader::ModuleId(0),
            def_row: 0,
            entry: AtomicUsize::new(0),
            compiled: OnceCell::new(),
            vtable_slot: OnceCell::new(),
        });
        md.declaring.set(td).unwrap();
        md
    }

    #[test]
    fn test_walk_two_managed_frames_with_native_between() {
        let code_heap = CodeHeap::new(*SERVICES);
        let inner_md = dummy_method("inner");
        let outer_md = dummy_method("outer");
        let inner_pc = code_heap.publish(&[0x90; 16], Some(inner_md)).unwrap() + 4;
        let outer_pc = code_heap.publish(&[0x90; 16], Some(outer_md)).unwrap() + 8;

        // Build a fake rbp chain: inner -> native -> outer -> sentinel
        // Each frame: [rbp] = caller rbp, [rbp+8] = return pc
        let mut stack = vec![0usize; 8];
        let base = stack.as_mut_ptr() as usize;
        let outer_rbp = base + 32;
        let native_rbp = base + 16;
        let inner_rbp = base;
        stack[0] = native_rbp; // inner's saved rbp
        stack[1] = 0xdead_0000; // return into native code (not in heap)
        stack[2] = outer_rbp; // native's saved rbp
        stack[3] = outer_pc; // return into outer
        stack[4] = 0; // outer's saved rbp: sentinel
        stack[5] = 0xdead_0004; // outer's return (native bootstrap)

        let frames: Vec<Frame> =
            FrameWalker::new(&code_heap, inner_pc, inner_rbp).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].pc, inner_pc);
        assert_eq!(frames[0].md.name, "inner");
        assert_eq!(frames[1].pc, outer_pc);
        assert_eq!(frames[1].md.name, "outer");
        assert_eq!(frames[1].rbp, outer_rbp);
    }

    #[test]
    fn test_walk_stops_at_sentinel() {
        let code_heap = CodeHeap::new(*SERVICES);
        let frames: Vec<Frame> = FrameWalker::new(&code_heap, 0x1234, 0).collect();
        assert!(frames.is_empty());
    }
}
