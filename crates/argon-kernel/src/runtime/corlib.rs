//! The synthesized system module
//!
//! The runtime's own managed surface: the exception hierarchy the fault
//! paths instantiate, and the intrinsic classes (interlocked operations
//! and thread control) whose bodies the JIT supplies. Built as an
//! ordinary [`ParsedModule`] and pushed through the loader like any
//! workload assembly.

use crate::fault::FaultKind;
use argon_bytecode::body::{InstrWriter, MethodBody};
use argon_bytecode::module::{
    FieldFlags, FieldRec, MethodFlags, MethodRec, TypeDefRec, TypeFlags,
};
use argon_bytecode::sig::{MethodSig, TypeSig};
use argon_bytecode::{Opcode, ParsedModule};

/// Name of the system module.
pub const SYSTEM_MODULE: &str = "System";

/// An empty, immediately returning constructor body.
fn trivial_ctor_body() -> MethodBody {
    let mut w = InstrWriter::new();
    w.op(Opcode::Ret);
    MethodBody {
        max_stack: 1,
        locals: vec![],
        code: w.finish(),
        eh: vec![],
    }
}

fn ctor() -> MethodRec {
    MethodRec {
        name: ".ctor".into(),
        flags: MethodFlags::CTOR,
        sig: MethodSig::instance(vec![], TypeSig::Void),
        body: Some(trivial_ctor_body()),
    }
}

fn intrinsic(name: &str, flags: MethodFlags, sig: MethodSig) -> MethodRec {
    MethodRec {
        name: name.into(),
        flags: flags | MethodFlags::INTRINSIC,
        sig,
        body: None,
    }
}

/// Build the system module.
pub fn build() -> ParsedModule {
    let mut module = ParsedModule::new(SYSTEM_MODULE);

    // Exception: message field + trivial ctor. Fault-specific types
    // derive from it without adding state.
    module.fields.push(FieldRec {
        name: "message".into(),
        flags: FieldFlags::empty(),
        sig: TypeSig::String,
    });
    module.methods.push(ctor());
    module.types.push(TypeDefRec {
        namespace: "System".into(),
        name: "Exception".into(),
        flags: TypeFlags::empty(),
        base: None,
        interfaces: vec![],
        fields: 0..1,
        methods: 0..1,
        generic_params: 0,
        finalizer: None,
    });
    let exception_row = 0u32;

    for kind in FaultKind::all() {
        let method_row = module.methods.len() as u32;
        module.methods.push(ctor());
        module.types.push(TypeDefRec {
            namespace: "System".into(),
            name: kind.type_name().into(),
            flags: TypeFlags::SEALED,
            base: Some(argon_bytecode::Token::type_def(exception_row)),
            interfaces: vec![],
            fields: 0..0,
            methods: method_row..method_row + 1,
            generic_params: 0,
            finalizer: None,
        });
    }

    // Interlocked: compiled inline by the JIT
    let start = module.methods.len() as u32;
    module.methods.push(intrinsic(
        "CompareExchange",
        MethodFlags::STATIC,
        MethodSig::stat(
            vec![TypeSig::ByRef(Box::new(TypeSig::I8)), TypeSig::I8, TypeSig::I8],
            TypeSig::I8,
        ),
    ));
    module.methods.push(intrinsic(
        "InterlockedAdd",
        MethodFlags::STATIC,
        MethodSig::stat(
            vec![TypeSig::ByRef(Box::new(TypeSig::I8)), TypeSig::I8],
            TypeSig::I8,
        ),
    ));
    module.methods.push(intrinsic(
        "MemoryBarrier",
        MethodFlags::STATIC,
        MethodSig::stat(vec![], TypeSig::Void),
    ));
    module.types.push(TypeDefRec {
        namespace: "System.Threading".into(),
        name: "Interlocked".into(),
        flags: TypeFlags::ABSTRACT | TypeFlags::SEALED,
        base: None,
        interfaces: vec![],
        fields: 0..0,
        methods: start..start + 3,
        generic_params: 0,
        finalizer: None,
    });

    // Thread control: compiled as runtime helper calls
    let start = module.methods.len() as u32;
    module.methods.push(intrinsic(
        "StartThread",
        MethodFlags::STATIC,
        MethodSig::stat(vec![TypeSig::Object], TypeSig::I8),
    ));
    module.methods.push(intrinsic(
        "JoinThread",
        MethodFlags::STATIC,
        MethodSig::stat(vec![TypeSig::I8, TypeSig::I8], TypeSig::I4),
    ));
    module.methods.push(intrinsic(
        "YieldThread",
        MethodFlags::STATIC,
        MethodSig::stat(vec![], TypeSig::Void),
    ));
    module.methods.push(intrinsic(
        "Sleep",
        MethodFlags::STATIC,
        MethodSig::stat(vec![TypeSig::I8], TypeSig::Void),
    ));
    module.types.push(TypeDefRec {
        namespace: "System.Threading".into(),
        name: "Thread".into(),
        flags: TypeFlags::ABSTRACT | TypeFlags::SEALED,
        base: None,
        interfaces: vec![],
        fields: 0..0,
        methods: start..start + 4,
        generic_params: 0,
        finalizer: None,
    });

    module
}

/// Offset of `Exception.message` within instances (header + first slot).
pub const EXCEPTION_MESSAGE_OFFSET: u32 = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use argon_bytecode::verify_module;

    #[test]
    fn test_system_module_verifies() {
        let module = build();
        verify_module(&module).unwrap();
        assert_eq!(module.name, SYSTEM_MODULE);
        // Exception + one type per fault kind + Interlocked + Thread
        assert_eq!(module.types.len(), 1 + FaultKind::all().len() + 2);
    }

    #[test]
    fn test_every_fault_kind_has_a_type() {
        let module = build();
        for kind in FaultKind::all() {
            assert!(
                module.types.iter().any(|t| t.name == kind.type_name()),
                "missing {}",
                kind.type_name()
            );
        }
    }
}
