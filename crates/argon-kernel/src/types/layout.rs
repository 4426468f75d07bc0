//! Instance and static layout
//!
//! Fields are packed in declaration order honoring their natural
//! alignment. Value types nest inline; reference fields are pointer-sized
//! slots and their offsets feed the canonical reference map.

use super::descriptor::{FieldDesc, TypeDesc, TypeKind, HEADER_SIZE};
use thiserror::Error;

/// Largest permitted instance or value size.
const MAX_TYPE_SIZE: u64 = 1 << 30;

/// Layout failures.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// An instance or value exceeded the size limit.
    #[error("type {0} exceeds the maximum size")]
    TooLarge(String),
}

/// Result of laying out a type's instance fields.
#[derive(Debug)]
pub struct TypeLayout {
    /// Total size: object size (header included) for reference types,
    /// inline size for value types.
    pub size: u32,
    /// Required alignment.
    pub align: u32,
    /// Field descriptors with assigned offsets.
    pub fields: Vec<FieldDesc>,
    /// Offsets of every reference slot, base-chain slots included.
    pub ref_offsets: Vec<u32>,
}

/// One unplaced field.
pub struct PendingField {
    /// Field name.
    pub name: String,
    /// Resolved field type.
    pub ty: &'static TypeDesc,
    /// Whether the field is static (placed in the module region instead).
    pub is_static: bool,
}

/// Lay out the instance fields of a type.
///
/// `base` supplies the starting offset and inherited reference map.
/// Static fields receive offsets from `layout_statics` and are carried
/// through with offset `u32::MAX` here; the loader patches them.
pub fn layout_instance(
    type_name: &str,
    kind: TypeKind,
    base: Option<&'static TypeDesc>,
    pending: Vec<PendingField>,
) -> Result<TypeLayout, LayoutError> {
    let mut offset: u64 = match (kind, base) {
        (TypeKind::Value, _) => 0,
        (_, Some(b)) => b.size as u64,
        (_, None) => HEADER_SIZE as u64,
    };
    let mut align: u32 = match kind {
        TypeKind::Value => 1,
        _ => 8,
    };
    let mut ref_offsets: Vec<u32> = base.map(|b| b.ref_offsets().to_vec()).unwrap_or_default();
    let mut fields = Vec::with_capacity(pending.len());

    for field in pending {
        if field.is_static {
            fields.push(FieldDesc {
                name: field.name,
                offset: u32::MAX,
                ty: field.ty,
                is_static: true,
            });
            continue;
        }
        let field_align = field.ty.inline_align();
        let field_size = field.ty.inline_size() as u64;
        offset = align_up(offset, field_align as u64);
        if offset + field_size > MAX_TYPE_SIZE {
            return Err(LayoutError::TooLarge(type_name.to_string()));
        }
        let placed = offset as u32;

        if field.ty.is_reference_like() {
            ref_offsets.push(placed);
        } else if field.ty.kind == TypeKind::Value {
            // Inline value type: its reference slots land at nested offsets
            for &nested in field.ty.ref_offsets() {
                ref_offsets.push(placed + nested);
            }
        }

        align = align.max(field_align);
        offset += field_size;
        fields.push(FieldDesc {
            name: field.name,
            offset: placed,
            ty: field.ty,
            is_static: false,
        });
    }

    let size = align_up(offset, align as u64) as u32;
    Ok(TypeLayout {
        size,
        align,
        fields,
        ref_offsets,
    })
}

/// Assign offsets within a module's static region.
///
/// Returns `(region_size, per-field offsets, reference offsets)` for the
/// given static fields, packed in order.
pub fn layout_statics(
    fields: &[(&str, &'static TypeDesc)],
) -> (u32, Vec<u32>, Vec<u32>) {
    let mut offset: u64 = 0;
    let mut offsets = Vec::with_capacity(fields.len());
    let mut ref_offsets = Vec::new();
    for (_, ty) in fields {
        let a = ty.inline_align() as u64;
        offset = align_up(offset, a);
        let placed = offset as u32;
        if ty.is_reference_like() {
            ref_offsets.push(placed);
        } else if ty.kind == TypeKind::Value {
            for &nested in ty.ref_offsets() {
                ref_offsets.push(placed + nested);
            }
        }
        offsets.push(placed);
        offset += ty.inline_size() as u64;
    }
    (align_up(offset, 8) as u32, offsets, ref_offsets)
}

impl TypeDesc {
    /// Alignment of this type when embedded as a field or element.
    pub fn inline_align(&self) -> u32 {
        if self.is_value_like() {
            self.align.max(1)
        } else {
            8
        }
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    #[test]
    fn test_primitive_packing_honors_alignment() {
        let reg = TypeRegistry::new();
        let pending = vec![
            PendingField {
                name: "a".into(),
                ty: reg.prim(crate::types::Prim::I1),
                is_static: false,
            },
            PendingField {
                name: "b".into(),
                ty: reg.prim(crate::types::Prim::I4),
                is_static: false,
            },
            PendingField {
                name: "c".into(),
                ty: reg.prim(crate::types::Prim::I1),
                is_static: false,
            },
        ];
        let layout =
            layout_instance("T", TypeKind::Reference, Some(reg.object()), pending).unwrap();
        // header=16, a at 16, b aligned to 20, c at 24
        assert_eq!(layout.fields[0].offset, 16);
        assert_eq!(layout.fields[1].offset, 20);
        assert_eq!(layout.fields[2].offset, 24);
        assert!(layout.ref_offsets.is_empty());
    }

    #[test]
    fn test_reference_fields_recorded() {
        let reg = TypeRegistry::new();
        let pending = vec![
            PendingField {
                name: "x".into(),
                ty: reg.prim(crate::types::Prim::I8),
                is_static: false,
            },
            PendingField {
                name: "o".into(),
                ty: reg.object(),
                is_static: false,
            },
        ];
        let layout =
            layout_instance("T", TypeKind::Reference, Some(reg.object()), pending).unwrap();
        assert_eq!(layout.ref_offsets, vec![24]);
        assert_eq!(layout.size, 32);
    }

    #[test]
    fn test_value_type_layout_starts_at_zero() {
        let reg = TypeRegistry::new();
        let pending = vec![PendingField {
            name: "v".into(),
            ty: reg.prim(crate::types::Prim::I4),
            is_static: false,
        }];
        let layout = layout_instance("V", TypeKind::Value, None, pending).unwrap();
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.size, 4);
        assert_eq!(layout.align, 4);
    }

    #[test]
    fn test_static_region_layout() {
        let reg = TypeRegistry::new();
        let fields: Vec<(&str, &'static crate::types::TypeDesc)> = vec![
            ("s", reg.string()),
            ("n", reg.prim(crate::types::Prim::I4)),
            ("o", reg.object()),
        ];
        let (size, offsets, refs) = layout_statics(&fields);
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(refs, vec![0, 16]);
        assert_eq!(size, 24);
    }
}
