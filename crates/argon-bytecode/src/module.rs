//! Resolved module tables
//!
//! A [`ParsedModule`] is what the external bytecode reader produces from an
//! assembly: flat definition tables plus reference tables for symbols that
//! live in other modules. Rows are addressed by [`Token`].

use crate::body::MethodBody;
use crate::sig::{MethodSig, TypeSig};
use bitflags::bitflags;
use std::ops::Range;
use thiserror::Error;

/// Which table a token points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    /// Type definition in this module
    TypeDef = 0x01,
    /// Reference to a type in another module
    TypeRef = 0x02,
    /// Method definition in this module
    MethodDef = 0x03,
    /// Field definition in this module
    FieldDef = 0x04,
    /// Reference to a member of a (possibly foreign) type
    MemberRef = 0x05,
    /// Constructed type signature (arrays, generic instances)
    TypeSpec = 0x06,
    /// String literal
    String = 0x07,
    /// Standalone method signature (for `CallI`)
    Signature = 0x08,
}

/// A metadata token: table kind in the top byte, row index below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Token(pub u32);

impl Token {
    /// Build a token from kind and row index.
    pub fn new(kind: TokenKind, index: u32) -> Self {
        debug_assert!(index < (1 << 24));
        Token(((kind as u32) << 24) | index)
    }

    /// Shorthand for a TypeDef token.
    pub fn type_def(index: u32) -> Self {
        Self::new(TokenKind::TypeDef, index)
    }

    /// Shorthand for a MethodDef token.
    pub fn method_def(index: u32) -> Self {
        Self::new(TokenKind::MethodDef, index)
    }

    /// Shorthand for a FieldDef token.
    pub fn field_def(index: u32) -> Self {
        Self::new(TokenKind::FieldDef, index)
    }

    /// The table this token addresses, if the tag byte is valid.
    pub fn kind(self) -> Option<TokenKind> {
        use TokenKind::*;
        Some(match self.0 >> 24 {
            0x01 => TypeDef,
            0x02 => TypeRef,
            0x03 => MethodDef,
            0x04 => FieldDef,
            0x05 => MemberRef,
            0x06 => TypeSpec,
            0x07 => String,
            0x08 => Signature,
            _ => return None,
        })
    }

    /// Row index within the table.
    pub fn index(self) -> usize {
        (self.0 & 0x00FF_FFFF) as usize
    }
}

bitflags! {
    /// Attributes of a type definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u16 {
        /// Interface (no instances, no layout)
        const INTERFACE = 1 << 0;
        /// Value type (inline layout, no header when embedded)
        const VALUE_TYPE = 1 << 1;
        /// Cannot be instantiated
        const ABSTRACT = 1 << 2;
        /// Cannot be derived from
        const SEALED = 1 << 3;
    }
}

bitflags! {
    /// Attributes of a method definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        /// No receiver
        const STATIC = 1 << 0;
        /// Dispatched through the vtable
        const VIRTUAL = 1 << 1;
        /// Introduces a fresh vtable slot rather than overriding
        const NEW_SLOT = 1 << 2;
        /// No body; must be overridden
        const ABSTRACT = 1 << 3;
        /// Instance constructor
        const CTOR = 1 << 4;
        /// Body is supplied by the runtime (interlocked ops, delegate glue)
        const INTRINSIC = 1 << 5;
    }
}

bitflags! {
    /// Attributes of a field definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u16 {
        /// Class-level storage
        const STATIC = 1 << 0;
        /// Writable only inside a constructor
        const INIT_ONLY = 1 << 1;
    }
}

/// A type definition row.
#[derive(Debug, Clone)]
pub struct TypeDefRec {
    /// Namespace, empty for the global namespace.
    pub namespace: String,
    /// Simple name.
    pub name: String,
    /// Attributes.
    pub flags: TypeFlags,
    /// Base type (TypeDef/TypeRef/TypeSpec), None for Object and interfaces.
    pub base: Option<Token>,
    /// Implemented interfaces (TypeDef/TypeRef/TypeSpec tokens).
    pub interfaces: Vec<Token>,
    /// Rows of [`ParsedModule::fields`] belonging to this type.
    pub fields: Range<u32>,
    /// Rows of [`ParsedModule::methods`] belonging to this type.
    pub methods: Range<u32>,
    /// Number of generic type parameters, 0 for non-generic types.
    pub generic_params: u16,
    /// Finalizer method (row in `methods`), if the type declares one.
    pub finalizer: Option<u32>,
}

/// A field definition row.
#[derive(Debug, Clone)]
pub struct FieldRec {
    /// Field name.
    pub name: String,
    /// Attributes.
    pub flags: FieldFlags,
    /// Field type.
    pub sig: TypeSig,
}

/// A method definition row.
#[derive(Debug, Clone)]
pub struct MethodRec {
    /// Method name.
    pub name: String,
    /// Attributes.
    pub flags: MethodFlags,
    /// Signature.
    pub sig: MethodSig,
    /// Body; None for abstract and intrinsic methods.
    pub body: Option<MethodBody>,
}

/// A reference to a type defined in another module.
#[derive(Debug, Clone)]
pub struct TypeRefRec {
    /// Name of the module that defines the type.
    pub module: String,
    /// Namespace of the target type.
    pub namespace: String,
    /// Simple name of the target type.
    pub name: String,
}

/// The signature half of a member reference.
#[derive(Debug, Clone)]
pub enum MemberSig {
    /// A field with the given type.
    Field(TypeSig),
    /// A method with the given signature.
    Method(MethodSig),
}

/// A reference to a member of some type.
#[derive(Debug, Clone)]
pub struct MemberRefRec {
    /// Declaring type (TypeDef/TypeRef/TypeSpec).
    pub parent: Token,
    /// Member name.
    pub name: String,
    /// Member signature, used to pick among overloads.
    pub sig: MemberSig,
}

/// Errors raised while building or addressing a module.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A token's tag byte does not name a table.
    #[error("invalid token {0:#010x}")]
    InvalidToken(u32),

    /// A token indexes past the end of its table.
    #[error("token {token:#010x} out of range for table of {len} rows")]
    TokenOutOfRange {
        /// The offending token.
        token: u32,
        /// Rows in the addressed table.
        len: usize,
    },
}

/// A fully parsed module: the resolved-symbol API consumed by the loader.
#[derive(Debug, Clone, Default)]
pub struct ParsedModule {
    /// Module name (assembly simple name).
    pub name: String,
    /// Type definitions.
    pub types: Vec<TypeDefRec>,
    /// Field definitions, grouped by declaring type.
    pub fields: Vec<FieldRec>,
    /// Method definitions, grouped by declaring type.
    pub methods: Vec<MethodRec>,
    /// References to types in other modules.
    pub type_refs: Vec<TypeRefRec>,
    /// References to members of (possibly foreign) types.
    pub member_refs: Vec<MemberRefRec>,
    /// Constructed type signatures.
    pub type_specs: Vec<TypeSig>,
    /// Standalone signatures for indirect calls.
    pub signatures: Vec<MethodSig>,
    /// String literal pool.
    pub strings: Vec<String>,
    /// Entry point (MethodDef), if this module is executable.
    pub entry_point: Option<Token>,
}

impl ParsedModule {
    /// Create an empty module with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Look up a type definition row.
    pub fn type_def(&self, token: Token) -> Result<&TypeDefRec, ModuleError> {
        self.row(token, TokenKind::TypeDef, &self.types)
    }

    /// Look up a method definition row.
    pub fn method_def(&self, token: Token) -> Result<&MethodRec, ModuleError> {
        self.row(token, TokenKind::MethodDef, &self.methods)
    }

    /// Look up a field definition row.
    pub fn field_def(&self, token: Token) -> Result<&FieldRec, ModuleError> {
        self.row(token, TokenKind::FieldDef, &self.fields)
    }

    /// Look up a string literal.
    pub fn string(&self, token: Token) -> Result<&str, ModuleError> {
        self.row(token, TokenKind::String, &self.strings)
            .map(|s| s.as_str())
    }

    /// Find the type that declares the given method row.
    pub fn declaring_type_of_method(&self, method_row: u32) -> Option<u32> {
        self.types
            .iter()
            .position(|t| t.methods.contains(&method_row))
            .map(|i| i as u32)
    }

    /// Find the type that declares the given field row.
    pub fn declaring_type_of_field(&self, field_row: u32) -> Option<u32> {
        self.types
            .iter()
            .position(|t| t.fields.contains(&field_row))
            .map(|i| i as u32)
    }

    fn row<'a, T>(
        &self,
        token: Token,
        want: TokenKind,
        table: &'a [T],
    ) -> Result<&'a T, ModuleError> {
        if token.kind() != Some(want) {
            return Err(ModuleError::InvalidToken(token.0));
        }
        table.get(token.index()).ok_or(ModuleError::TokenOutOfRange {
            token: token.0,
            len: table.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_pack_unpack() {
        let t = Token::new(TokenKind::MethodDef, 42);
        assert_eq!(t.kind(), Some(TokenKind::MethodDef));
        assert_eq!(t.index(), 42);
    }

    #[test]
    fn test_invalid_token_tag() {
        let t = Token(0xAB00_0001);
        assert_eq!(t.kind(), None);
    }

    #[test]
    fn test_row_lookup_errors() {
        let module = ParsedModule::new("m");
        let err = module.type_def(Token::method_def(0)).unwrap_err();
        assert!(matches!(err, ModuleError::InvalidToken(_)));
        let err = module.type_def(Token::type_def(3)).unwrap_err();
        assert!(matches!(err, ModuleError::TokenOutOfRange { len: 0, .. }));
    }
}
