//! Object model accessors
//!
//! [`GcRef`] is a raw managed reference: a non-null pointer to an object
//! header. All field, array and string access in the runtime's own code
//! goes through these helpers; emitted code computes the same offsets
//! directly.

use crate::gc::header::ObjHeader;
use crate::types::{TypeDesc, TypeKind, ELEMENTS_OFFSET, LENGTH_OFFSET};
use std::ptr::NonNull;

/// A non-null managed reference.
///
/// `GcRef` is `Copy` and carries no lifetime: it is only valid while the
/// referent is reachable and the GC has not moved it. Runtime code holds
/// `GcRef`s across safepoints only via handles or scanned roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcRef(NonNull<u8>);

// SAFETY: `GcRef` is an opaque address into the managed heap. It carries no
// thread-local state and all access to the referent is synchronized by the
// collector; the pointer itself is safe to share and move across threads.
unsafe impl Send for GcRef {}
unsafe impl Sync for GcRef {}

impl GcRef {
    /// Wrap a raw object address.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a valid object header.
    pub unsafe fn from_ptr(ptr: *mut u8) -> Option<GcRef> {
        NonNull::new(ptr).map(GcRef)
    }

    /// Wrap a raw word, treating zero as null.
    ///
    /// # Safety
    ///
    /// Non-zero values must be valid object addresses.
    pub unsafe fn from_word(word: usize) -> Option<GcRef> {
        Self::from_ptr(word as *mut u8)
    }

    /// The object address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The object address as a pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The object header.
    #[inline]
    pub fn header(self) -> &'static ObjHeader {
        // Safety: a GcRef always points at a header
        unsafe { ObjHeader::at(self.0.as_ptr()) }
    }

    /// The object's type descriptor.
    #[inline]
    pub fn td(self) -> &'static TypeDesc {
        self.header().td()
    }

    /// Read a reference slot at `offset` bytes from the object start.
    ///
    /// # Safety
    ///
    /// `offset` must be a reference slot of this object's type.
    pub unsafe fn read_ref(self, offset: u32) -> Option<GcRef> {
        let slot = self.0.as_ptr().add(offset as usize) as *const usize;
        GcRef::from_word(slot.read())
    }

    /// Write a reference slot at `offset` bytes from the object start.
    ///
    /// # Safety
    ///
    /// As for [`GcRef::read_ref`].
    pub unsafe fn write_ref(self, offset: u32, value: Option<GcRef>) {
        let slot = self.0.as_ptr().add(offset as usize) as *mut usize;
        slot.write(value.map_or(0, |r| r.addr()));
    }

    /// Read a primitive/value slot.
    ///
    /// # Safety
    ///
    /// `offset` must be a field of the right width within the object.
    pub unsafe fn read<T: Copy>(self, offset: u32) -> T {
        (self.0.as_ptr().add(offset as usize) as *const T).read_unaligned()
    }

    /// Write a primitive/value slot.
    ///
    /// # Safety
    ///
    /// As for [`GcRef::read`].
    pub unsafe fn write<T: Copy>(self, offset: u32, value: T) {
        (self.0.as_ptr().add(offset as usize) as *mut T).write_unaligned(value)
    }

    /// Array or string length.
    ///
    /// # Safety
    ///
    /// The object must be an array or string.
    pub unsafe fn length(self) -> usize {
        self.read::<u64>(LENGTH_OFFSET) as usize
    }

    /// Address of array element `index`.
    ///
    /// # Safety
    ///
    /// The object must be an array and `index` in bounds.
    pub unsafe fn element_ptr(self, index: usize) -> *mut u8 {
        let td = self.td();
        let elem_size = td.element.expect("not an array").inline_size() as usize;
        self.0
            .as_ptr()
            .add(td.elements_offset() as usize + index * elem_size)
    }

    /// The code units of a string.
    ///
    /// # Safety
    ///
    /// The object must be a string.
    pub unsafe fn string_chars(self) -> &'static [u16] {
        let len = self.length();
        let data = self.0.as_ptr().add(ELEMENTS_OFFSET as usize) as *const u16;
        std::slice::from_raw_parts(data, len)
    }

    /// Decode a string object to host UTF-8.
    ///
    /// # Safety
    ///
    /// The object must be a string.
    pub unsafe fn string_to_host(self) -> String {
        String::from_utf16_lossy(self.string_chars())
    }

    /// Total size in bytes of this object, header included, 8-aligned.
    pub fn object_size(self) -> usize {
        let td = self.td();
        let raw = match td.kind {
            TypeKind::Array | TypeKind::Reference if td.element.is_some() && td.rank >= 1 => {
                // Arrays and strings: fixed part plus elements
                let elem = td.element.unwrap().inline_size() as usize;
                // Safety: rank>=1 with element implies a length word
                let len = unsafe { self.length() };
                td.elements_offset() as usize + elem * len
            }
            _ => td.size as usize,
        };
        (raw + 7) & !7
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::header::ObjHeader;
    use crate::types::{Prim, TypeRegistry};

    #[test]
    fn test_array_object_size() {
        let reg = TypeRegistry::new();
        let int_array = reg.array_of(reg.prim(Prim::I4), 1);

        // Backing for header(16) + length(8) + 4 elements * 4 bytes
        let mut backing = vec![0u64; 8];
        let ptr = backing.as_mut_ptr() as *mut u8;
        unsafe {
            ObjHeader::init(ptr, int_array);
            let obj = GcRef::from_ptr(ptr).unwrap();
            obj.write::<u64>(LENGTH_OFFSET, 4);
            assert_eq!(obj.length(), 4);
            // 24 fixed + 16 elements = 40
            assert_eq!(obj.object_size(), 40);
        }
    }

    #[test]
    fn test_element_access() {
        let reg = TypeRegistry::new();
        let int_array = reg.array_of(reg.prim(Prim::I4), 1);
        let mut backing = vec![0u64; 8];
        let ptr = backing.as_mut_ptr() as *mut u8;
        unsafe {
            ObjHeader::init(ptr, int_array);
            let obj = GcRef::from_ptr(ptr).unwrap();
            obj.write::<u64>(LENGTH_OFFSET, 4);
            for i in 0..4u32 {
                (obj.element_ptr(i as usize) as *mut i32).write(i as i32 * 10);
            }
            assert_eq!((obj.element_ptr(3) as *const i32).read(), 30);
        }
    }

    #[test]
    fn test_plain_object_size_is_td_size() {
        let reg = TypeRegistry::new();
        let mut backing = vec![0u64; 4];
        let ptr = backing.as_mut_ptr() as *mut u8;
        unsafe {
            ObjHeader::init(ptr, reg.object());
            let obj = GcRef::from_ptr(ptr).unwrap();
            assert_eq!(obj.object_size(), 16);
        }
    }

    #[test]
    fn test_ref_slot_round_trip() {
        let reg = TypeRegistry::new();
        let mut a = vec![0u64; 4];
        let mut b = vec![0u64; 4];
        let pa = a.as_mut_ptr() as *mut u8;
        let pb = b.as_mut_ptr() as *mut u8;
        unsafe {
            ObjHeader::init(pa, reg.object());
            ObjHeader::init(pb, reg.object());
            let oa = GcRef::from_ptr(pa).unwrap();
            let ob = GcRef::from_ptr(pb).unwrap();
            // Use the reserved word area of a fake 24-byte object
            oa.write_ref(16, Some(ob));
            assert_eq!(oa.read_ref(16), Some(ob));
            oa.write_ref(16, None);
            assert_eq!(oa.read_ref(16), None);
        }
    }
}
