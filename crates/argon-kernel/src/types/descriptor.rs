//! Type and method descriptors
//!
//! A [`TypeDesc`] is the canonical record for one loaded type; a
//! [`MethodDesc`] is the unit the JIT compiles. Both are allocated once,
//! filled during resolution under the type-system lock, and never mutated
//! after publication. The one exception is the method entry point, which
//! flips exactly once from the compile trampoline to the emitted code.

use crate::jit::tables::CompiledCode;
use argon_bytecode::module::MethodFlags;
use argon_bytecode::MethodBody;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Object header size: type word + forwarding word.
pub const HEADER_SIZE: u32 = 16;

/// Offset of the length word in arrays and strings.
pub const LENGTH_OFFSET: u32 = 16;

/// Offset of the first element in arrays and strings.
pub const ELEMENTS_OFFSET: u32 = 24;

/// Primitive type identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    /// No value.
    Void,
    /// 1-byte boolean.
    Bool,
    /// UTF-16 code unit.
    Char,
    /// Signed integers.
    I1,
    /// 16-bit signed.
    I2,
    /// 32-bit signed.
    I4,
    /// 64-bit signed.
    I8,
    /// Unsigned integers.
    U1,
    /// 16-bit unsigned.
    U2,
    /// 32-bit unsigned.
    U4,
    /// 64-bit unsigned.
    U8,
    /// 32-bit IEEE float.
    R4,
    /// 64-bit IEEE float.
    R8,
}

impl Prim {
    /// Size in bytes of an inline value of this primitive.
    pub fn size(self) -> u32 {
        match self {
            Prim::Void => 0,
            Prim::Bool | Prim::I1 | Prim::U1 => 1,
            Prim::Char | Prim::I2 | Prim::U2 => 2,
            Prim::I4 | Prim::U4 | Prim::R4 => 4,
            Prim::I8 | Prim::U8 | Prim::R8 => 8,
        }
    }

    /// Whether the primitive is a float.
    pub fn is_float(self) -> bool {
        matches!(self, Prim::R4 | Prim::R8)
    }
}

/// What sort of type a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Built-in primitive value.
    Primitive(Prim),
    /// User-defined value type: inline layout, no header when embedded.
    Value,
    /// Class: heap instances with header.
    Reference,
    /// Array (single- or multi-dimension).
    Array,
    /// Interface: no instances, dispatch through interface maps.
    Interface,
}

/// One entry of a type's interface map.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceEntry {
    /// The implemented interface.
    pub iface: &'static TypeDesc,
    /// Slot in the implementing type's vtable where this interface's
    /// methods begin, in interface declaration order.
    pub vtable_base: u32,
}

/// A field of a type.
#[derive(Debug)]
pub struct FieldDesc {
    /// Field name.
    pub name: String,
    /// For instance fields: byte offset from the object start (header
    /// included) or from the value start for value types. For statics:
    /// byte offset into the owning module's static region.
    pub offset: u32,
    /// Field type.
    pub ty: &'static TypeDesc,
    /// Whether the field is class-level.
    pub is_static: bool,
}

/// A resolved method signature.
#[derive(Debug, Clone)]
pub struct ResolvedSig {
    /// Whether the method takes a receiver (not included in `params`).
    pub has_this: bool,
    /// Parameter types.
    pub params: Vec<&'static TypeDesc>,
    /// Return type (`void` TD for none).
    pub ret: &'static TypeDesc,
}

impl ResolvedSig {
    /// Argument count at a call site, receiver included.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }
}

/// The canonical record for one loaded type.
///
/// 16-byte aligned so object headers can pack GC tag bits into the low
/// bits of the descriptor pointer.
#[repr(align(16))]
pub struct TypeDesc {
    /// Display name, e.g. `System.String` or `List<System.Int32>`.
    pub name: String,
    /// Kind of type.
    pub kind: TypeKind,
    /// Reference types and arrays: fixed instance size in bytes, header
    /// included (arrays: header + length word). Value types and
    /// primitives: inline size. Interfaces: 0.
    pub size: u32,
    /// Required alignment of instances or inline values.
    pub align: u32,
    /// Base type; None for Object, primitives and interfaces.
    pub base: Option<&'static TypeDesc>,
    /// Element type for arrays and strings.
    pub element: Option<&'static TypeDesc>,
    /// Array rank: 1 for single-dimension, >1 for multi-dimension, else 0.
    pub rank: u8,
    /// Generic arguments; empty for non-generic types.
    pub generic_args: Vec<&'static TypeDesc>,
    /// Definition identity for loader-defined types.
    pub definition: Option<crate::types::DefId>,
    /// For box descriptors: the wrapped value type.
    pub(crate) boxed_of: Option<&'static TypeDesc>,
    /// Instance fields (inherited fields come first, at their inherited
    /// offsets) and statics declared by this type.
    pub(crate) fields: OnceCell<Box<[FieldDesc]>>,
    /// Byte offsets (object-relative) of every reference-holding slot in
    /// an instance. Canonical for the GC.
    pub(crate) ref_offsets: OnceCell<Box<[u32]>>,
    /// All methods declared by this type, in definition order.
    pub(crate) methods: OnceCell<Box<[&'static MethodDesc]>>,
    /// Virtual dispatch table.
    pub(crate) vtable: OnceCell<Box<[&'static MethodDesc]>>,
    /// Raw pointer to the vtable's first slot, loaded by emitted dispatch
    /// sequences at a fixed offset. Set when the vtable is sealed.
    pub(crate) vtable_raw: AtomicUsize,
    /// Interface dispatch map, flattened over the base chain.
    pub(crate) iface_map: OnceCell<Box<[InterfaceEntry]>>,
    /// Finalizer, if any type in the base chain declares one.
    pub(crate) finalizer: OnceCell<Option<&'static MethodDesc>>,
}

impl TypeDesc {
    /// Create a descriptor shell. Late-bound parts are filled during
    /// resolution, before publication.
    pub(crate) fn shell(
        name: String,
        kind: TypeKind,
        size: u32,
        align: u32,
        base: Option<&'static TypeDesc>,
    ) -> Self {
        Self {
            name,
            kind,
            size,
            align,
            base,
            element: None,
            rank: 0,
            generic_args: Vec::new(),
            definition: None,
            boxed_of: None,
            fields: OnceCell::new(),
            ref_offsets: OnceCell::new(),
            methods: OnceCell::new(),
            vtable: OnceCell::new(),
            vtable_raw: AtomicUsize::new(0),
            iface_map: OnceCell::new(),
            finalizer: OnceCell::new(),
        }
    }

    /// Install the vtable, exposing its slot array to emitted code.
    pub(crate) fn seal_vtable(&self, vtable: Box<[&'static MethodDesc]>) {
        let raw = vtable.as_ptr() as usize;
        self.vtable.set(vtable).expect("vtable sealed twice");
        self.vtable_raw.store(raw, Ordering::Release);
    }

    /// Whether instances are heap references.
    pub fn is_reference_like(&self) -> bool {
        matches!(self.kind, TypeKind::Reference | TypeKind::Array)
    }

    /// Whether values are laid out inline (no header when embedded).
    pub fn is_value_like(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(_) | TypeKind::Value)
    }

    /// Inline size of a field or array element of this type.
    pub fn inline_size(&self) -> u32 {
        if self.is_value_like() {
            self.size
        } else {
            8
        }
    }

    /// The fields table.
    pub fn fields(&self) -> &[FieldDesc] {
        self.fields.get().map(|f| &f[..]).unwrap_or(&[])
    }

    /// Object-relative offsets of reference slots in an instance.
    pub fn ref_offsets(&self) -> &[u32] {
        self.ref_offsets.get().map(|r| &r[..]).unwrap_or(&[])
    }

    /// Methods declared by this type, in definition order.
    pub fn methods(&self) -> &[&'static MethodDesc] {
        self.methods.get().map(|m| &m[..]).unwrap_or(&[])
    }

    /// The vtable.
    pub fn vtable(&self) -> &[&'static MethodDesc] {
        self.vtable.get().map(|v| &v[..]).unwrap_or(&[])
    }

    /// The interface map.
    pub fn iface_map(&self) -> &[InterfaceEntry] {
        self.iface_map.get().map(|m| &m[..]).unwrap_or(&[])
    }

    /// The finalizer inherited or declared by this type.
    pub fn finalizer(&self) -> Option<&'static MethodDesc> {
        self.finalizer.get().copied().flatten()
    }

    /// Method in the given vtable slot.
    pub fn vtable_slot(&self, index: u32) -> Option<&'static MethodDesc> {
        self.vtable().get(index as usize).copied()
    }

    /// Method implementing slot `index` of `iface` on this type.
    ///
    /// Resolves through the interface map: the entry's base slot plus the
    /// method index addresses the implementing vtable slot.
    pub fn interface_slot(
        &self,
        iface: &'static TypeDesc,
        index: u32,
    ) -> Option<&'static MethodDesc> {
        let entry = self
            .iface_map()
            .iter()
            .find(|e| std::ptr::eq(e.iface, iface))?;
        self.vtable_slot(entry.vtable_base + index)
    }

    /// Whether a value of type `self` can stand where `dst` is expected.
    ///
    /// Walks the base chain, the interface map, and single-dimension
    /// reference-array covariance. Value types match only themselves.
    pub fn is_assignable_to(&'static self, dst: &'static TypeDesc) -> bool {
        if std::ptr::eq(self, dst) {
            return true;
        }
        if self.is_value_like() || dst.is_value_like() {
            return false;
        }
        if dst.kind == TypeKind::Interface {
            return self
                .iface_map()
                .iter()
                .any(|e| std::ptr::eq(e.iface, dst));
        }
        // Array covariance: T[] is assignable to U[] when T and U are
        // reference types and T is assignable to U.
        if self.kind == TypeKind::Array && dst.kind == TypeKind::Array {
            if self.rank == dst.rank {
                let (se, de) = (self.element.unwrap(), dst.element.unwrap());
                if se.is_reference_like() && de.is_reference_like() {
                    return se.is_assignable_to(de);
                }
                return std::ptr::eq(se, de);
            }
            return false;
        }
        // Base chain
        let mut cur = self.base;
        while let Some(b) = cur {
            if std::ptr::eq(b, dst) {
                return true;
            }
            cur = b.base;
        }
        false
    }

    /// For box descriptors, the wrapped value type.
    pub fn boxed_value(&self) -> Option<&'static TypeDesc> {
        self.boxed_of
    }

    /// Offset of the first element in an array instance. Multi-dimension
    /// arrays store per-dimension lengths between the total-length word
    /// and the elements.
    pub fn elements_offset(&self) -> u32 {
        if self.rank > 1 {
            ELEMENTS_OFFSET + 8 * self.rank as u32
        } else {
            ELEMENTS_OFFSET
        }
    }

    /// Whether instances of this type contain any references.
    pub fn has_references(&self) -> bool {
        !self.ref_offsets().is_empty()
            || matches!(self.kind, TypeKind::Array if self.element.unwrap().is_reference_like())
    }
}

/// The unit of compilation: one method of one (possibly instantiated) type.
pub struct MethodDesc {
    /// Method name.
    pub name: String,
    /// Declaring type; set right after the declaring shell is allocated.
    pub(crate) declaring: OnceCell<&'static TypeDesc>,
    /// Attribute flags from the definition row.
    pub flags: MethodFlags,
    /// Resolved signature.
    pub sig: ResolvedSig,
    /// Body with generic parameters substituted; None for abstract and
    /// intrinsic methods.
    pub body: Option<MethodBody>,
    /// Module the body's tokens resolve against.
    pub module: crate::loader::ModuleId,
    /// Definition row in that module (for diagnostics and code sharing).
    pub def_row: u32,
    /// Current native entry point. Starts at the compile trampoline and
    /// flips once, under the JIT lock, to the compiled code.
    pub(crate) entry: AtomicUsize,
    /// Emitted code and side tables, present once compiled.
    pub(crate) compiled: OnceCell<CompiledCode>,
    /// Slot in the declaring type's vtable, for virtual methods.
    pub(crate) vtable_slot: OnceCell<u32>,
}

// Shallow by hand: descriptors form cycles (a type's methods point back
// at their declaring type), so a derived Debug would never terminate.
impl std::fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDesc")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MethodDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDesc")
            .field("name", &self.name)
            .field("declaring", &self.declaring.get().map(|t| t.name.as_str()))
            .finish_non_exhaustive()
    }
}

impl MethodDesc {
    /// The declaring type.
    pub fn declaring(&self) -> &'static TypeDesc {
        self.declaring.get().expect("declaring type not bound")
    }

    /// Current native entry point.
    ///
    /// Reads with acquire ordering so a caller that observes the compiled
    /// entry also observes the emitted bytes.
    pub fn entry_point(&self) -> usize {
        self.entry.load(Ordering::Acquire)
    }

    /// Flip the entry point to the compiled code. Called exactly once,
    /// under the JIT lock, after the code pages are read-execute.
    pub(crate) fn publish_entry(&self, entry: usize) {
        self.entry.store(entry, Ordering::Release);
    }

    /// Compiled code and side tables, if this method has been compiled.
    pub fn compiled(&self) -> Option<&CompiledCode> {
        self.compiled.get()
    }

    /// Vtable slot for virtual methods.
    pub fn slot(&self) -> Option<u32> {
        self.vtable_slot.get().copied()
    }

    /// Whether this method has a receiver.
    pub fn has_this(&self) -> bool {
        self.sig.has_this
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_desc_is_16_aligned() {
        // Object headers steal the low 4 bits of the descriptor pointer.
        assert_eq!(std::mem::align_of::<TypeDesc>(), 16);
    }

    #[test]
    fn test_prim_sizes() {
        assert_eq!(Prim::Bool.size(), 1);
        assert_eq!(Prim::Char.size(), 2);
        assert_eq!(Prim::I4.size(), 4);
        assert_eq!(Prim::R8.size(), 8);
        assert!(Prim::R4.is_float());
        assert!(!Prim::I8.is_float());
    }

    #[test]
    fn test_inline_size_of_reference_is_pointer() {
        let td = TypeDesc::shell("T".into(), TypeKind::Reference, 32, 8, None);
        assert_eq!(td.inline_size(), 8);
    }
}
