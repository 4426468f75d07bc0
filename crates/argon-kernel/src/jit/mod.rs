//! Tier-0 JIT compiler
//!
//! Translates one stack-machine method body at a time into x86-64. Three
//! phases: flow analysis over basic blocks with a verified evaluation
//! stack model (`analysis`), single-pass per-block code generation
//! (`codegen`), and side-table emission (`tables`). Emitted bytes live in
//! the write-then-execute [`code_heap`]; the runtime ABI between emitted
//! code and the kernel is defined in [`trampoline`].

pub mod analysis;
pub mod code_heap;
pub mod codegen;
pub mod emit;
pub mod helpers;
pub mod tables;
pub mod trampoline;

use crate::types::{MethodDesc, Prim, ResolvedSig, TypeDesc, TypeKind};
use argon_bytecode::body::DecodeError;
use argon_bytecode::Token;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Compilation errors.
///
/// A method that fails to compile is attributed to the workload: the
/// trampoline converts the error into a `TypeLoadFailed` managed fault at
/// the call site.
#[derive(Debug, Error)]
pub enum JitError {
    /// The body's instruction bytes failed to decode.
    #[error("bad body: {0}")]
    Decode(#[from] DecodeError),

    /// The evaluation stack underflowed.
    #[error("stack underflow at offset {0}")]
    StackUnderflow(u32),

    /// Inconsistent stack shapes at a merge point.
    #[error("stack mismatch at merge offset {0}")]
    StackMismatch(u32),

    /// An operand type did not fit the instruction.
    #[error("type mismatch at offset {offset}: {what}")]
    TypeMismatch {
        /// Offset of the offending instruction.
        offset: u32,
        /// Short description.
        what: &'static str,
    },

    /// A token failed to resolve.
    #[error("unresolved token {0:#010x}")]
    Unresolved(u32),

    /// The method has no body (abstract or unfilled intrinsic).
    #[error("method has no body")]
    NoBody,

    /// The emitted code could not be published.
    #[error(transparent)]
    CodeHeap(#[from] code_heap::CodeHeapError),
}

/// Coarse kind of one evaluation-stack slot.
///
/// Small integers widen to `I32` on the stack; the precise element type
/// only matters again at stores, which narrow explicitly.
#[derive(Debug, Clone, Copy)]
pub enum SlotKind {
    /// 32-bit integer (and bool/char/small ints).
    I32,
    /// 64-bit integer (and native ints / function pointers).
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Object reference.
    Ref,
    /// Managed interior pointer.
    ByRef,
    /// Inline value type.
    Val(&'static TypeDesc),
}

impl SlotKind {
    /// Whether two slots merge to the same shape.
    pub fn merges_with(self, other: SlotKind) -> bool {
        match (self, other) {
            (SlotKind::I32, SlotKind::I32)
            | (SlotKind::I64, SlotKind::I64)
            | (SlotKind::F32, SlotKind::F32)
            | (SlotKind::F64, SlotKind::F64)
            | (SlotKind::Ref, SlotKind::Ref)
            | (SlotKind::ByRef, SlotKind::ByRef) => true,
            (SlotKind::Val(a), SlotKind::Val(b)) => std::ptr::eq(a, b),
            _ => false,
        }
    }

    /// Whether the slot is any integer.
    pub fn is_int(self) -> bool {
        matches!(self, SlotKind::I32 | SlotKind::I64)
    }

    /// Whether the slot is any float.
    pub fn is_float(self) -> bool {
        matches!(self, SlotKind::F32 | SlotKind::F64)
    }

    /// Bytes this slot occupies in a frame temp.
    pub fn frame_bytes(self) -> u32 {
        match self {
            SlotKind::Val(td) => (td.size.max(1) + 7) & !7,
            _ => 8,
        }
    }
}

/// Stack-slot kind for values of a given type.
pub fn slot_kind_of(td: &'static TypeDesc) -> SlotKind {
    match td.kind {
        TypeKind::Primitive(p) => match p {
            Prim::I8 | Prim::U8 => SlotKind::I64,
            Prim::R4 => SlotKind::F32,
            Prim::R8 => SlotKind::F64,
            Prim::Void => SlotKind::I32, // never pushed; placeholder
            _ => SlotKind::I32,
        },
        TypeKind::Value => SlotKind::Val(td),
        TypeKind::Reference | TypeKind::Array | TypeKind::Interface => SlotKind::Ref,
    }
}

/// A resolved field access for the code generator.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef {
    /// Instance fields: byte offset from the object start. Statics: byte
    /// offset within the module's static region.
    pub offset: u32,
    /// Field type.
    pub ty: &'static TypeDesc,
    /// Whether the field is static.
    pub is_static: bool,
    /// Statics: base address of the owning module's static region.
    pub static_base: usize,
}

/// Everything the JIT needs to know about the method being compiled.
///
/// Implemented by the loader, which resolves tokens against the declaring
/// module and has already ensured every referenced type is resolved.
pub trait BodyEnv {
    /// Kinds of the incoming arguments, receiver first when present.
    fn arg_kinds(&self) -> &[SlotKind];

    /// Kinds of the local variables.
    fn local_kinds(&self) -> &[SlotKind];

    /// Kind of the return value, None for void.
    fn ret_kind(&self) -> Option<SlotKind>;

    /// Resolve a method token.
    fn method(&self, token: Token) -> Result<&'static MethodDesc, JitError>;

    /// Resolve a standalone signature token (indirect calls).
    fn signature(&self, token: Token) -> Result<ResolvedSig, JitError>;

    /// Resolve a field token.
    fn field(&self, token: Token) -> Result<FieldRef, JitError>;

    /// Resolve a type token.
    fn type_desc(&self, token: Token) -> Result<&'static TypeDesc, JitError>;

    /// Address of the interned (pinned) string object for a literal.
    fn string_literal(&self, token: Token) -> Result<usize, JitError>;

    /// Canonical array descriptor for an element type.
    fn array_type(&self, element: &'static TypeDesc, rank: u8) -> &'static TypeDesc;

    /// Canonical box descriptor for a value type.
    fn box_type(&self, value: &'static TypeDesc) -> &'static TypeDesc;

    /// Whether a type derives from the runtime delegate type.
    fn is_delegate(&self, td: &'static TypeDesc) -> bool;
}

/// The tier-0 compiler driver.
///
/// One lock serializes all compilation (this is also the fused
/// type-initialization lock): a method compiles at most once, and the
/// entry point flips to the emitted code only after the code pages are
/// read-execute.
pub struct JitCompiler {
    code_heap: &'static code_heap::CodeHeap,
    lock: parking_lot::Mutex<()>,
    stats: JitStats,
}

impl JitCompiler {
    /// Create a compiler over the given code heap.
    pub fn new(code_heap: &'static code_heap::CodeHeap) -> Self {
        Self {
            code_heap,
            lock: parking_lot::Mutex::new(()),
            stats: JitStats::default(),
        }
    }

    /// The code heap this compiler publishes into.
    pub fn code_heap(&self) -> &'static code_heap::CodeHeap {
        self.code_heap
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    /// Compile `md` if it has not been compiled yet and return the
    /// native entry point.
    pub fn compile(
        &self,
        md: &'static MethodDesc,
        env: &dyn BodyEnv,
    ) -> Result<usize, JitError> {
        let _guard = self.lock.lock();
        if let Some(code) = md.compiled() {
            return Ok(code.entry());
        }
        let body = md.body.as_ref().ok_or(JitError::NoBody)?;
        let graph = analysis::analyze(body, env)?;
        let out = codegen::generate(body, &graph, env)?;
        let addr = self.code_heap.publish(&out.code, Some(md))?;
        let compiled = tables::CompiledCode {
            code_ptr: addr,
            code_size: out.code.len(),
            entry_offset: 0,
            frame_size: out.frame_size,
            stackmap: out.stackmap,
            eh: out.eh,
        };
        self.stats
            .record(body.code.len(), compiled.code_size, out.safepoints);
        md.compiled
            .set(compiled)
            .expect("method compiled twice under the JIT lock");
        md.publish_entry(addr);
        log::debug!(
            "jit: compiled {}::{} ({} -> {} bytes)",
            md.declaring().name,
            md.name,
            body.code.len(),
            md.compiled().unwrap().code_size
        );
        Ok(addr)
    }
}

/// Aggregate JIT statistics.
#[derive(Debug, Default)]
pub struct JitStats {
    /// Methods compiled.
    pub methods_compiled: AtomicU64,
    /// Bytecode bytes consumed.
    pub bytecode_bytes: AtomicU64,
    /// Machine-code bytes emitted.
    pub code_bytes: AtomicU64,
    /// Safepoints recorded.
    pub safepoints: AtomicU64,
}

impl JitStats {
    /// Record one compiled method.
    pub fn record(&self, bytecode: usize, code: usize, safepoints: usize) {
        self.methods_compiled.fetch_add(1, Ordering::Relaxed);
        self.bytecode_bytes.fetch_add(bytecode as u64, Ordering::Relaxed);
        self.code_bytes.fetch_add(code as u64, Ordering::Relaxed);
        self.safepoints.fetch_add(safepoints as u64, Ordering::Relaxed);
    }

    /// Methods compiled so far.
    pub fn compiled(&self) -> u64 {
        self.methods_compiled.load(Ordering::Relaxed)
    }
}
