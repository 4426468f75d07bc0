//! Managed fault kinds
//!
//! Every failure attributable to the workload surfaces as a managed
//! exception dispatched through the two-pass handler. Failures of the
//! runtime's own invariants panic instead; the boundary is fixed by policy
//! and not configurable.

use thiserror::Error;

/// The kinds of fault the runtime itself can raise into managed code.
///
/// Each kind maps to a well-known exception type in the system module; the
/// JIT's inline checks and the runtime helpers raise by kind, and the
/// dispatcher allocates (or reuses, for `OutOfMemory`) the matching
/// exception object.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Null dereference, or a call through a null receiver.
    #[error("null reference")]
    NullReference,

    /// Array index outside `0..len`.
    #[error("index out of range")]
    IndexOutOfRange,

    /// `castclass`/`unbox` target does not match the runtime type.
    #[error("invalid cast")]
    InvalidCast,

    /// Store of an incompatible element into a covariant reference array.
    #[error("array type mismatch")]
    ArrayTypeMismatch,

    /// Checked arithmetic or conversion overflowed.
    #[error("arithmetic overflow")]
    Overflow,

    /// Integer division or remainder by zero.
    #[error("division by zero")]
    DivideByZero,

    /// The collector could not free enough memory to satisfy an allocation.
    #[error("out of memory")]
    OutOfMemory,

    /// A thread overran its guard page.
    #[error("stack overflow")]
    StackOverflow,

    /// A type, its base, an interface, or a field type failed to resolve.
    #[error("type load failed")]
    TypeLoadFailed,

    /// A member reference matched no member of the resolved type.
    #[error("missing member")]
    MissingMember,

    /// Cooperative cancellation observed at a safepoint.
    #[error("thread interrupted")]
    ThreadInterrupted,
}

impl FaultKind {
    /// Name of the exception type in the system module for this kind.
    pub fn type_name(self) -> &'static str {
        match self {
            FaultKind::NullReference => "NullReferenceException",
            FaultKind::IndexOutOfRange => "IndexOutOfRangeException",
            FaultKind::InvalidCast => "InvalidCastException",
            FaultKind::ArrayTypeMismatch => "ArrayTypeMismatchException",
            FaultKind::Overflow => "OverflowException",
            FaultKind::DivideByZero => "DivideByZeroException",
            FaultKind::OutOfMemory => "OutOfMemoryException",
            FaultKind::StackOverflow => "StackOverflowException",
            FaultKind::TypeLoadFailed => "TypeLoadException",
            FaultKind::MissingMember => "MissingMemberException",
            FaultKind::ThreadInterrupted => "ThreadInterruptedException",
        }
    }

    /// Numeric code for embedding in emitted fault checks.
    pub fn code(self) -> u32 {
        FaultKind::all()
            .iter()
            .position(|k| *k == self)
            .expect("kind in table") as u32
    }

    /// Decode a fault code from emitted code.
    pub fn from_code(code: u32) -> Option<FaultKind> {
        FaultKind::all().get(code as usize).copied()
    }

    /// All kinds, in stable order. The boot sequence resolves each kind's
    /// exception type up front so raising can never itself fail to resolve.
    pub fn all() -> &'static [FaultKind] {
        &[
            FaultKind::NullReference,
            FaultKind::IndexOutOfRange,
            FaultKind::InvalidCast,
            FaultKind::ArrayTypeMismatch,
            FaultKind::Overflow,
            FaultKind::DivideByZero,
            FaultKind::OutOfMemory,
            FaultKind::StackOverflow,
            FaultKind::TypeLoadFailed,
            FaultKind::MissingMember,
            FaultKind::ThreadInterrupted,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_type_names_are_distinct() {
        let mut names: Vec<_> = FaultKind::all().iter().map(|k| k.type_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), FaultKind::all().len());
    }
}
