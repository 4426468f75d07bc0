//! Loaded-module state
//!
//! A [`LoadedModule`] wraps the parsed tables with the loader's lazily
//! filled resolution caches: one descriptor cell per TypeDef/MethodDef
//! row, the module's static-field region, and the interned string
//! literals.

use super::ModuleId;
use crate::types::{MethodDesc, TypeDesc};
use argon_bytecode::ParsedModule;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

/// A module's static-field storage, registered as a GC root.
pub struct StaticRegion {
    storage: Box<[u64]>,
    /// Byte offsets of reference slots within the region.
    pub ref_offsets: Vec<u32>,
    /// Byte offset of each static field, keyed by FieldDef row.
    pub field_offsets: FxHashMap<u32, u32>,
}

impl StaticRegion {
    pub(crate) fn new(
        size: u32,
        ref_offsets: Vec<u32>,
        field_offsets: FxHashMap<u32, u32>,
    ) -> Self {
        let words = (size as usize).div_ceil(8).max(1);
        Self {
            storage: vec![0u64; words].into_boxed_slice(),
            ref_offsets,
            field_offsets,
        }
    }

    /// Base address of the region.
    pub fn base(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.storage.len() * 8
    }

    /// Read a reference slot (GC marking).
    ///
    /// # Safety
    ///
    /// `offset` must be one of `ref_offsets`.
    pub unsafe fn read_ref_slot(&self, offset: u32) -> usize {
        *(self.base() as *const u8).add(offset as usize).cast::<usize>()
    }

    /// Write a reference slot (GC adjust).
    ///
    /// # Safety
    ///
    /// As for [`StaticRegion::read_ref_slot`].
    pub unsafe fn write_ref_slot(&self, offset: u32, value: usize) {
        *(self.base() as *mut u8).add(offset as usize).cast::<usize>() = value;
    }
}

/// A module the loader has accepted.
pub struct LoadedModule {
    /// Module id.
    pub id: ModuleId,
    /// Module name.
    pub name: String,
    /// SHA-256 identity of the module contents.
    pub checksum: [u8; 32],
    /// The parsed tables.
    pub parsed: ParsedModule,
    /// Resolved TypeDef rows (non-generic binding).
    pub(super) tds: Vec<OnceCell<&'static TypeDesc>>,
    /// Resolved MethodDef rows (non-generic declaring type).
    pub(super) mds: Vec<OnceCell<&'static MethodDesc>>,
    /// Static-field region, built on first static access.
    pub(super) statics: OnceCell<StaticRegion>,
    /// Interned string literals: row index to pinned object address.
    pub(super) strings: Mutex<FxHashMap<u32, usize>>,
}

impl LoadedModule {
    pub(super) fn new(
        id: ModuleId,
        parsed: ParsedModule,
        checksum: [u8; 32],
    ) -> &'static LoadedModule {
        let tds = (0..parsed.types.len()).map(|_| OnceCell::new()).collect();
        let mds = (0..parsed.methods.len()).map(|_| OnceCell::new()).collect();
        Box::leak(Box::new(LoadedModule {
            id,
            name: parsed.name.clone(),
            checksum,
            parsed,
            tds,
            mds,
            statics: OnceCell::new(),
            strings: Mutex::new(FxHashMap::default()),
        }))
    }

    /// The static region, if it has been built.
    pub fn statics(&self) -> Option<&StaticRegion> {
        self.statics.get()
    }
}

/// Identity checksum over the resolved tables.
///
/// The external reader owns the raw bytes; this digests the parts that
/// determine behavior (names, signatures shape, bodies).
pub(crate) fn checksum_of(parsed: &ParsedModule) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(parsed.name.as_bytes());
    hasher.update((parsed.types.len() as u64).to_le_bytes());
    for ty in &parsed.types {
        hasher.update(ty.namespace.as_bytes());
        hasher.update(ty.name.as_bytes());
        hasher.update(ty.flags.bits().to_le_bytes());
    }
    hasher.update((parsed.methods.len() as u64).to_le_bytes());
    for method in &parsed.methods {
        hasher.update(method.name.as_bytes());
        hasher.update((method.sig.params.len() as u32).to_le_bytes());
        if let Some(body) = &method.body {
            hasher.update(&body.code);
        }
    }
    for s in &parsed.strings {
        hasher.update(s.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_region_round_trip() {
        let mut offsets = FxHashMap::default();
        offsets.insert(0u32, 0u32);
        offsets.insert(1, 8);
        let region = StaticRegion::new(16, vec![8], offsets);
        assert_eq!(region.size(), 16);
        unsafe {
            region.write_ref_slot(8, 0xDEAD_B000);
            assert_eq!(region.read_ref_slot(8), 0xDEAD_B000);
        }
    }

    #[test]
    fn test_static_region_zeroed() {
        let region = StaticRegion::new(32, vec![0, 8, 16, 24], FxHashMap::default());
        for off in [0u32, 8, 16, 24] {
            assert_eq!(unsafe { region.read_ref_slot(off) }, 0);
        }
    }
}
