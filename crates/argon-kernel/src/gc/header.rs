//! GC object header
//!
//! Every heap object begins with two words. The first holds the type
//! descriptor pointer with GC tag bits packed into its low bits (the
//! descriptor is 16-byte aligned). The second is the Lisp-2 reserved word:
//! the forwarding address during collection, the identity hash seed
//! otherwise.
//!
//! Layout in memory:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ word 0: TypeDesc pointer | mark|pin|hash|fwd │
//! │ word 1: forwarding address / hash seed       │
//! ├──────────────────────────────────────────────┤
//! │ (arrays/strings) word 2: length              │
//! │ payload …                                    │
//! └──────────────────────────────────────────────┘
//! ```

use crate::types::TypeDesc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reachability mark, set during the mark phase.
pub const MARK_BIT: usize = 1 << 0;
/// Pinned: the compactor must not move this object.
pub const PIN_BIT: usize = 1 << 1;
/// The hash seed in word 1 has been assigned.
pub const HASH_BIT: usize = 1 << 2;
/// Word 1 currently holds a forwarding address.
pub const FORWARD_BIT: usize = 1 << 3;

const TAG_MASK: usize = 0xF;

/// The two-word object header.
#[repr(C, align(8))]
pub struct ObjHeader {
    type_word: AtomicUsize,
    reserved: AtomicUsize,
}

impl ObjHeader {
    /// Initialize a header for a fresh object of the given type.
    ///
    /// # Safety
    ///
    /// `at` must point to `HEADER_SIZE` writable bytes.
    pub unsafe fn init(at: *mut u8, td: &'static TypeDesc) {
        let header = at as *mut ObjHeader;
        (*header).type_word.store(td as *const TypeDesc as usize, Ordering::Relaxed);
        (*header).reserved.store(0, Ordering::Relaxed);
    }

    /// View the header at an object address.
    ///
    /// # Safety
    ///
    /// `at` must point to a live object header.
    pub unsafe fn at<'a>(at: *mut u8) -> &'a ObjHeader {
        &*(at as *const ObjHeader)
    }

    /// The object's type descriptor.
    pub fn td(&self) -> &'static TypeDesc {
        let word = self.type_word.load(Ordering::Relaxed);
        // Safety: the word was stored from a &'static TypeDesc at init
        unsafe { &*((word & !TAG_MASK) as *const TypeDesc) }
    }

    /// Whether the mark bit is set.
    pub fn is_marked(&self) -> bool {
        self.type_word.load(Ordering::Relaxed) & MARK_BIT != 0
    }

    /// Set the mark bit. Returns whether it was newly set.
    pub fn mark(&self) -> bool {
        let prev = self.type_word.fetch_or(MARK_BIT, Ordering::Relaxed);
        prev & MARK_BIT == 0
    }

    /// Clear the mark bit (end of compaction).
    pub fn unmark(&self) {
        self.type_word.fetch_and(!MARK_BIT, Ordering::Relaxed);
    }

    /// Whether the object is pinned.
    pub fn is_pinned(&self) -> bool {
        self.type_word.load(Ordering::Relaxed) & PIN_BIT != 0
    }

    /// Pin or unpin the object.
    pub fn set_pinned(&self, pinned: bool) {
        if pinned {
            self.type_word.fetch_or(PIN_BIT, Ordering::Relaxed);
        } else {
            self.type_word.fetch_and(!PIN_BIT, Ordering::Relaxed);
        }
    }

    /// The forwarding address, if one has been recorded this cycle.
    pub fn forwarding(&self) -> Option<usize> {
        if self.type_word.load(Ordering::Relaxed) & FORWARD_BIT != 0 {
            Some(self.reserved.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Record the forwarding address for the plan phase.
    ///
    /// Clobbers the hash seed word; [`ObjHeader::restore_after_move`]
    /// writes it back at the destination.
    pub fn set_forwarding(&self, to: usize, saved_seed: &mut usize) {
        *saved_seed = self.reserved.load(Ordering::Relaxed);
        self.reserved.store(to, Ordering::Relaxed);
        self.type_word.fetch_or(FORWARD_BIT, Ordering::Relaxed);
    }

    /// Clear forwarding state and restore the hash seed after the object
    /// has been slid to its new address.
    pub fn restore_after_move(&self, seed: usize) {
        self.reserved.store(seed, Ordering::Relaxed);
        self.type_word
            .fetch_and(!(FORWARD_BIT | MARK_BIT), Ordering::Relaxed);
    }

    /// The identity hash, seeding it on first request.
    pub fn identity_hash(&self, next_seed: impl FnOnce() -> usize) -> usize {
        if self.type_word.load(Ordering::Relaxed) & HASH_BIT == 0 {
            let seed = next_seed() | 1; // never zero
            self.reserved.store(seed, Ordering::Relaxed);
            self.type_word.fetch_or(HASH_BIT, Ordering::Relaxed);
        }
        self.reserved.load(Ordering::Relaxed)
    }

    /// Whether a hash seed has been assigned.
    pub fn has_hash(&self) -> bool {
        self.type_word.load(Ordering::Relaxed) & HASH_BIT != 0
    }

    /// Raw reserved word (seed save/restore during compaction).
    pub fn reserved_word(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }
}
