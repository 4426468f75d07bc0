//! Argon bytecode definitions
//!
//! This crate is the boundary between the external bytecode reader (which
//! parses the on-disk assembly format) and the managed core. The reader
//! hands the core a [`ParsedModule`]: flat tables of type, method and field
//! definitions, signatures, cross-module references and method bodies in
//! the stack-based instruction set defined here. The core never sees file
//! offsets or metadata heaps.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod body;
pub mod module;
pub mod opcode;
pub mod sig;
pub mod verify;

pub use body::{EhKind, EhRegion, Instr, InstrReader, InstrWriter, MethodBody, Operand};
pub use module::{
    FieldRec, MemberRefRec, MemberSig, MethodRec, ModuleError, ParsedModule, Token, TokenKind,
    TypeDefRec, TypeRefRec,
};
pub use opcode::{Opcode, PrimKind};
pub use sig::{MethodSig, TypeSig};
pub use verify::{verify_module, VerifyError};
