//! Type system and object model
//!
//! Canonical runtime representation of types, methods and fields: layout,
//! vtables, interface maps, assignability, generic instantiation. Type
//! descriptors are created once, published with release semantics, and
//! live for the kernel lifetime.

mod descriptor;
mod layout;
pub(crate) mod registry;

pub use descriptor::{
    FieldDesc, InterfaceEntry, MethodDesc, Prim, ResolvedSig, TypeDesc, TypeKind,
    ELEMENTS_OFFSET, HEADER_SIZE, LENGTH_OFFSET,
};
pub use layout::{layout_instance, layout_statics, LayoutError, PendingField, TypeLayout};
pub use registry::{DefId, TypeRegistry};

use thiserror::Error;

#[cfg(test)]
pub(crate) fn registry_leak_for_tests(td: TypeDesc) -> &'static TypeDesc {
    registry::leak(td)
}

/// Errors from type resolution and layout.
///
/// All of these are attributable to the workload and surface as
/// `TypeLoadFailed` / `MissingMember` managed faults on first touch.
#[derive(Debug, Error)]
pub enum TypeError {
    /// A referenced type could not be found.
    #[error("type not found: {0}")]
    NotFound(String),

    /// A member reference matched nothing on the resolved type.
    #[error("member not found: {type_name}::{member}")]
    MemberNotFound {
        /// The resolved declaring type.
        type_name: String,
        /// The missing member's name.
        member: String,
    },

    /// Layout failed (cyclic value types, oversized type).
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// A generic instantiation had the wrong number of arguments.
    #[error("{type_name} expects {expected} type arguments, got {got}")]
    ArityMismatch {
        /// The generic definition.
        type_name: String,
        /// Declared parameter count.
        expected: u16,
        /// Supplied argument count.
        got: usize,
    },

    /// A token was malformed or addressed the wrong table.
    #[error("bad token: {0}")]
    BadToken(String),
}
