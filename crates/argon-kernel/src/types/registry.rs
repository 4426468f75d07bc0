//! Canonical type table
//!
//! One descriptor per (definition, type-argument tuple), globally unique.
//! Readers are lock-free after publication: descriptors are inserted into
//! concurrent maps whose insert is the release point. The writer side
//! (layout and vtable construction) is serialized by the layout lock held
//! by the loader's resolver.

use super::descriptor::{
    MethodDesc, Prim, TypeDesc, TypeKind, ELEMENTS_OFFSET, HEADER_SIZE,
};
use crate::loader::ModuleId;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;

/// Identity of a type definition: its module and TypeDef row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefId {
    /// Defining module.
    pub module: ModuleId,
    /// TypeDef row index within that module.
    pub row: u32,
}

/// Key of the instantiation table. Type arguments participate by pointer
/// identity, which canonicalization already guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstKey {
    def: DefId,
    args: Vec<usize>,
}

/// Field offsets of the synthesized delegate type.
pub mod delegate_layout {
    /// Invocation target (receiver), null for static-method delegates.
    pub const TARGET_OFFSET: u32 = 16;
    /// Native entry point of the bound method.
    pub const CODE_OFFSET: u32 = 24;
    /// Next delegate in a multicast chain, null for the tail.
    pub const NEXT_OFFSET: u32 = 32;
    /// Instance size.
    pub const SIZE: u32 = 40;
}

/// The canonical type table.
pub struct TypeRegistry {
    prims: [&'static TypeDesc; 13],
    object: &'static TypeDesc,
    string: &'static TypeDesc,
    delegate: &'static TypeDesc,
    insts: DashMap<InstKey, &'static TypeDesc>,
    arrays: DashMap<(usize, u8), &'static TypeDesc>,
    boxes: DashMap<usize, &'static TypeDesc>,
    // Reentrant: resolving a type resolves its field types under the same
    // lock on the same thread.
    layout_lock: ReentrantMutex<()>,
}

impl TypeRegistry {
    /// Create a registry with the primitive and root types installed.
    pub fn new() -> Self {
        let object = leak(TypeDesc::shell(
            "System.Object".into(),
            TypeKind::Reference,
            HEADER_SIZE,
            8,
            None,
        ));
        seal_empty(object);

        let string = {
            let mut td = TypeDesc::shell(
                "System.String".into(),
                TypeKind::Reference,
                ELEMENTS_OFFSET,
                8,
                Some(object),
            );
            td.rank = 1;
            let td = leak(td);
            seal_empty(td);
            td
        };

        let prims = [
            prim_td("System.Void", Prim::Void),
            prim_td("System.Boolean", Prim::Bool),
            prim_td("System.Char", Prim::Char),
            prim_td("System.SByte", Prim::I1),
            prim_td("System.Int16", Prim::I2),
            prim_td("System.Int32", Prim::I4),
            prim_td("System.Int64", Prim::I8),
            prim_td("System.Byte", Prim::U1),
            prim_td("System.UInt16", Prim::U2),
            prim_td("System.UInt32", Prim::U4),
            prim_td("System.UInt64", Prim::U8),
            prim_td("System.Single", Prim::R4),
            prim_td("System.Double", Prim::R8),
        ];

        let delegate = {
            let td = leak(TypeDesc::shell(
                "System.Delegate".into(),
                TypeKind::Reference,
                delegate_layout::SIZE,
                8,
                Some(object),
            ));
            // target and next are references; code is a raw entry point
            td.ref_offsets
                .set(
                    vec![
                        delegate_layout::TARGET_OFFSET,
                        delegate_layout::NEXT_OFFSET,
                    ]
                    .into_boxed_slice(),
                )
                .unwrap();
            td.fields.set(Box::new([])).unwrap();
            td.methods.set(Box::new([])).unwrap();
            td.seal_vtable(Box::new([]));
            td.iface_map.set(Box::new([])).unwrap();
            td.finalizer.set(None).unwrap();
            td
        };

        // string element type is char; patch after prims exist
        let string_mut = string as *const TypeDesc as *mut TypeDesc;
        // Safety: the registry is under construction; nothing else can
        // observe the descriptor yet.
        unsafe {
            (*string_mut).element = Some(prims[2]);
        }

        Self {
            prims,
            object,
            string,
            delegate,
            insts: DashMap::new(),
            arrays: DashMap::new(),
            boxes: DashMap::new(),
            layout_lock: ReentrantMutex::new(()),
        }
    }

    /// The layout lock serializing all descriptor construction.
    pub fn layout_lock(&self) -> &ReentrantMutex<()> {
        &self.layout_lock
    }

    /// Descriptor of a primitive.
    pub fn prim(&self, prim: Prim) -> &'static TypeDesc {
        let index = match prim {
            Prim::Void => 0,
            Prim::Bool => 1,
            Prim::Char => 2,
            Prim::I1 => 3,
            Prim::I2 => 4,
            Prim::I4 => 5,
            Prim::I8 => 6,
            Prim::U1 => 7,
            Prim::U2 => 8,
            Prim::U4 => 9,
            Prim::U8 => 10,
            Prim::R4 => 11,
            Prim::R8 => 12,
        };
        self.prims[index]
    }

    /// The root reference type.
    pub fn object(&self) -> &'static TypeDesc {
        self.object
    }

    /// The string type.
    pub fn string(&self) -> &'static TypeDesc {
        self.string
    }

    /// The delegate type.
    pub fn delegate(&self) -> &'static TypeDesc {
        self.delegate
    }

    /// Canonical array descriptor for `element` with the given rank.
    pub fn array_of(&self, element: &'static TypeDesc, rank: u8) -> &'static TypeDesc {
        debug_assert!(rank >= 1);
        let key = (element as *const TypeDesc as usize, rank);
        if let Some(existing) = self.arrays.get(&key) {
            return *existing;
        }
        let _guard = self.layout_lock.lock();
        if let Some(existing) = self.arrays.get(&key) {
            return *existing;
        }
        let name = match rank {
            1 => format!("{}[]", element.name),
            r => format!("{}[{}]", element.name, ",".repeat(r as usize - 1)),
        };
        let mut shell = TypeDesc::shell(
            name,
            TypeKind::Array,
            ELEMENTS_OFFSET + if rank > 1 { 8 * rank as u32 } else { 0 },
            8,
            Some(self.object),
        );
        shell.element = Some(element);
        shell.rank = rank;
        let td = leak(shell);
        seal_empty(td);
        self.arrays.insert(key, td);
        td
    }

    /// Canonical box descriptor for a value type.
    pub fn box_of(&self, value: &'static TypeDesc) -> &'static TypeDesc {
        debug_assert!(value.is_value_like());
        let key = value as *const TypeDesc as usize;
        if let Some(existing) = self.boxes.get(&key) {
            return *existing;
        }
        let _guard = self.layout_lock.lock();
        if let Some(existing) = self.boxes.get(&key) {
            return *existing;
        }
        let size = HEADER_SIZE + value.size.max(1);
        let mut shell = TypeDesc::shell(
            format!("Boxed<{}>", value.name),
            TypeKind::Reference,
            (size + 7) & !7,
            8,
            Some(self.object),
        );
        shell.boxed_of = Some(value);
        let td = leak(shell);
        let shifted: Vec<u32> = value.ref_offsets().iter().map(|o| o + HEADER_SIZE).collect();
        td.ref_offsets.set(shifted.into_boxed_slice()).unwrap();
        td.fields.set(Box::new([])).unwrap();
        td.methods.set(Box::new([])).unwrap();
        td.seal_vtable(Box::new([]));
        td.iface_map.set(Box::new([])).unwrap();
        td.finalizer.set(None).unwrap();
        self.boxes.insert(key, td);
        td
    }

    /// Look up a published instantiation.
    pub fn lookup(&self, def: DefId, args: &[&'static TypeDesc]) -> Option<&'static TypeDesc> {
        let key = InstKey {
            def,
            args: args.iter().map(|a| *a as *const TypeDesc as usize).collect(),
        };
        self.insts.get(&key).map(|r| *r)
    }

    /// Publish a finished instantiation. Insertion is the release point:
    /// after this call the descriptor is visible to lock-free readers.
    ///
    /// Must be called with the layout lock held.
    pub fn publish(&self, def: DefId, args: &[&'static TypeDesc], td: &'static TypeDesc) {
        let key = InstKey {
            def,
            args: args.iter().map(|a| *a as *const TypeDesc as usize).collect(),
        };
        let previous = self.insts.insert(key, td);
        debug_assert!(previous.is_none(), "type published twice: {}", td.name);
    }

    /// Canonicalize generic arguments for code sharing: every reference
    /// type shares the Object-instantiated body, value types keep their
    /// own.
    pub fn canonical_args(&self, args: &[&'static TypeDesc]) -> Vec<&'static TypeDesc> {
        args.iter()
            .map(|a| if a.is_reference_like() { self.object } else { *a })
            .collect()
    }

    /// Number of published instantiations (diagnostics).
    pub fn instantiation_count(&self) -> usize {
        self.insts.len()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a descriptor for the kernel lifetime.
pub(crate) fn leak(td: TypeDesc) -> &'static TypeDesc {
    Box::leak(Box::new(td))
}

/// Allocate a method descriptor for the kernel lifetime.
pub(crate) fn leak_method(md: MethodDesc) -> &'static MethodDesc {
    Box::leak(Box::new(md))
}

fn prim_td(name: &str, prim: Prim) -> &'static TypeDesc {
    let size = prim.size();
    let td = leak(TypeDesc::shell(
        name.into(),
        TypeKind::Primitive(prim),
        size,
        size.max(1),
        None,
    ));
    seal_empty(td);
    td
}

/// Fill the late-bound parts of a descriptor that has none.
fn seal_empty(td: &'static TypeDesc) {
    td.fields.set(Box::new([])).unwrap();
    td.ref_offsets.set(Box::new([])).unwrap();
    td.methods.set(Box::new([])).unwrap();
    td.seal_vtable(Box::new([]));
    td.iface_map.set(Box::new([])).unwrap();
    td.finalizer.set(None).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_canonical() {
        let reg = TypeRegistry::new();
        assert!(std::ptr::eq(reg.prim(Prim::I4), reg.prim(Prim::I4)));
        assert_eq!(reg.prim(Prim::I4).size, 4);
        assert_eq!(reg.prim(Prim::Bool).size, 1);
    }

    #[test]
    fn test_array_descriptors_dedupe() {
        let reg = TypeRegistry::new();
        let a = reg.array_of(reg.prim(Prim::I4), 1);
        let b = reg.array_of(reg.prim(Prim::I4), 1);
        assert!(std::ptr::eq(a, b));
        let c = reg.array_of(reg.prim(Prim::I4), 2);
        assert!(!std::ptr::eq(a, c));
        assert_eq!(a.name, "System.Int32[]");
        assert_eq!(c.name, "System.Int32[,]");
    }

    #[test]
    fn test_multi_dim_elements_offset() {
        let reg = TypeRegistry::new();
        let a = reg.array_of(reg.prim(Prim::I4), 1);
        let c = reg.array_of(reg.prim(Prim::I4), 3);
        assert_eq!(a.elements_offset(), 24);
        assert_eq!(c.elements_offset(), 24 + 24);
    }

    #[test]
    fn test_box_descriptor_wraps_value() {
        let reg = TypeRegistry::new();
        let boxed = reg.box_of(reg.prim(Prim::I4));
        assert!(std::ptr::eq(
            boxed.boxed_value().unwrap(),
            reg.prim(Prim::I4)
        ));
        assert!(std::ptr::eq(reg.box_of(reg.prim(Prim::I4)), boxed));
        assert!(boxed.is_reference_like());
    }

    #[test]
    fn test_array_covariance() {
        let reg = TypeRegistry::new();
        let strings = reg.array_of(reg.string(), 1);
        let objects = reg.array_of(reg.object(), 1);
        assert!(strings.is_assignable_to(objects));
        assert!(!objects.is_assignable_to(strings));
        let ints = reg.array_of(reg.prim(Prim::I4), 1);
        let longs = reg.array_of(reg.prim(Prim::I8), 1);
        assert!(!ints.is_assignable_to(longs));
        assert!(ints.is_assignable_to(ints));
    }

    #[test]
    fn test_canonical_args_fold_references() {
        let reg = TypeRegistry::new();
        let canon = reg.canonical_args(&[reg.string(), reg.prim(Prim::I4)]);
        assert!(std::ptr::eq(canon[0], reg.object()));
        assert!(std::ptr::eq(canon[1], reg.prim(Prim::I4)));
    }

    #[test]
    fn test_string_is_assignable_to_object() {
        let reg = TypeRegistry::new();
        assert!(reg.string().is_assignable_to(reg.object()));
        assert!(!reg.object().is_assignable_to(reg.string()));
    }
}
