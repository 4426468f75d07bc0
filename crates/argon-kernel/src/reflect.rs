//! Reflection surface
//!
//! Kernel-side reflection over loaded modules: enumerate types, walk
//! members, and invoke a method by descriptor with boxed arguments.
//! Value-typed arguments and results travel as boxes; reference-typed
//! ones pass through directly.

use crate::fault::FaultKind;
use crate::loader::ModuleId;
use crate::object::GcRef;
use crate::runtime::Runtime;
use crate::types::{FieldDesc, MethodDesc, TypeDesc, TypeKind, HEADER_SIZE};
use argon_bytecode::module::MethodFlags;

impl Runtime {
    /// Resolve and return every non-generic type of a module.
    pub fn module_types(&'static self, id: ModuleId) -> Vec<&'static TypeDesc> {
        let module = self.loader.module(id);
        let mut out = Vec::new();
        for (row, rec) in module.parsed.types.iter().enumerate() {
            if rec.generic_params > 0 {
                continue; // open definitions have no canonical descriptor
            }
            if let Ok(crate::loader::Resolved::Type(td)) =
                self.loader.resolve_token(id, argon_bytecode::Token::type_def(row as u32))
            {
                out.push(td);
            }
        }
        out
    }

    /// Find a resolved type by namespace-qualified name.
    pub fn find_type(&'static self, id: ModuleId, full_name: &str) -> Option<&'static TypeDesc> {
        self.module_types(id)
            .into_iter()
            .find(|td| td.name == full_name)
    }

    /// Methods of a type, base chain excluded.
    pub fn type_methods(&self, td: &'static TypeDesc) -> &'static [&'static MethodDesc] {
        td.methods()
    }

    /// Constructors of a type.
    pub fn type_constructors(
        &self,
        td: &'static TypeDesc,
    ) -> Vec<&'static MethodDesc> {
        td.methods()
            .iter()
            .copied()
            .filter(|m| m.flags.contains(MethodFlags::CTOR))
            .collect()
    }

    /// Fields of a type, base chain excluded.
    pub fn type_fields(&self, td: &'static TypeDesc) -> &'static [FieldDesc] {
        td.fields()
    }

    /// Find a method by name on a type or its bases.
    pub fn find_method(
        &self,
        td: &'static TypeDesc,
        name: &str,
    ) -> Option<&'static MethodDesc> {
        let mut cur = Some(td);
        while let Some(t) = cur {
            if let Some(md) = t.methods().iter().find(|m| m.name == name) {
                return Some(md);
            }
            cur = t.base;
        }
        None
    }

    /// Invoke a method with boxed arguments on the calling thread.
    ///
    /// Reference parameters take the reference directly; value parameters
    /// take a box of exactly the parameter type. The result is boxed the
    /// same way; void returns None.
    pub fn reflective_invoke(
        &'static self,
        md: &'static MethodDesc,
        receiver: Option<GcRef>,
        args: &[Option<GcRef>],
    ) -> Result<Option<GcRef>, FaultKind> {
        if args.len() != md.sig.params.len() {
            return Err(FaultKind::MissingMember);
        }
        if md.sig.has_this != receiver.is_some() {
            return Err(FaultKind::MissingMember);
        }

        let mut raw: Vec<u64> = Vec::with_capacity(md.sig.arg_count());
        if let Some(receiver) = receiver {
            raw.push(receiver.addr() as u64);
        }
        for (param, arg) in md.sig.params.iter().zip(args) {
            raw.push(unbox_argument(param, *arg)?);
        }

        let thread = self
            .scheduler
            .current()
            .ok_or(FaultKind::ThreadInterrupted)?;
        // Safety: the raw words were built against the method's signature
        let bits = unsafe { self.invoke_method(md, &raw, thread.ctx_ptr()) };

        let ret = md.sig.ret;
        match ret.kind {
            TypeKind::Primitive(crate::types::Prim::Void) => Ok(None),
            _ if ret.is_reference_like() => {
                // Safety: managed code returned a reference or null
                Ok(unsafe { GcRef::from_word(bits as usize) })
            }
            _ => {
                let box_td = self.registry.box_of(ret);
                let boxed = self.heap.alloc_object(box_td)?;
                // Safety: the payload starts after the header
                unsafe {
                    let dst = boxed.as_ptr().add(HEADER_SIZE as usize);
                    std::ptr::copy_nonoverlapping(
                        bits.to_le_bytes().as_ptr(),
                        dst,
                        (ret.size as usize).min(8),
                    );
                }
                Ok(Some(boxed))
            }
        }
    }
}

fn unbox_argument(
    param: &'static TypeDesc,
    arg: Option<GcRef>,
) -> Result<u64, FaultKind> {
    if param.is_reference_like() {
        return Ok(arg.map_or(0, |a| a.addr() as u64));
    }
    let Some(arg) = arg else {
        return Err(FaultKind::NullReference);
    };
    match arg.td().boxed_value() {
        Some(inner) if std::ptr::eq(inner, param) => {
            let size = (param.size as usize).min(8);
            let mut bytes = [0u8; 8];
            // Safety: boxes carry at least `size` payload bytes
            unsafe {
                std::ptr::copy_nonoverlapping(
                    arg.as_ptr().add(HEADER_SIZE as usize),
                    bytes.as_mut_ptr(),
                    size,
                );
            }
            Ok(u64::from_le_bytes(bytes))
        }
        _ => Err(FaultKind::InvalidCast),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::gc::Heap;
    use crate::types::{Prim, TypeRegistry};
    use crate::types::HEADER_SIZE;

    #[test]
    fn test_unbox_argument_reads_value_bits() {
        let reg = TypeRegistry::new();
        let heap = Heap::new(*SERVICES);
        let i4 = reg.prim(Prim::I4);
        let boxed = heap.alloc_object(reg.box_of(i4)).unwrap();
        unsafe { boxed.write::<i32>(HEADER_SIZE, -7) };

        let bits = unbox_argument(i4, Some(boxed)).unwrap();
        assert_eq!(bits as u32, (-7i32) as u32);
    }

    #[test]
    fn test_unbox_argument_rejects_wrong_box() {
        let reg = TypeRegistry::new();
        let heap = Heap::new(*SERVICES);
        let boxed_i8 = heap.alloc_object(reg.box_of(reg.prim(Prim::I8))).unwrap();
        assert!(matches!(
            unbox_argument(reg.prim(Prim::I4), Some(boxed_i8)),
            Err(FaultKind::InvalidCast)
        ));
        assert!(matches!(
            unbox_argument(reg.prim(Prim::I4), None),
            Err(FaultKind::NullReference)
        ));
    }

    #[test]
    fn test_reference_argument_passes_through() {
        let reg = TypeRegistry::new();
        let heap = Heap::new(*SERVICES);
        let obj = heap.alloc_object(reg.object()).unwrap();
        assert_eq!(
            unbox_argument(reg.object(), Some(obj)).unwrap(),
            obj.addr() as u64
        );
        assert_eq!(unbox_argument(reg.object(), None).unwrap(), 0);
    }
}
