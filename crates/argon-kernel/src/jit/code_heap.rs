//! Executable code heap
//!
//! Owns every byte of emitted machine code. Pages are mapped writable,
//! filled, and re-protected read-execute before any entry point escapes;
//! no page is ever writable and executable at once. The heap also keeps a
//! sorted method range index so an arbitrary PC resolves to the method
//! that owns it (GC root walking, exception dispatch).

use crate::types::MethodDesc;
use argon_hal::{AllocFlags, KernelServices, MemoryError, PageProt, PAGE_SIZE};
use parking_lot::Mutex;
use thiserror::Error;

/// Code heap errors.
#[derive(Debug, Error)]
pub enum CodeHeapError {
    /// The backing allocator or mapper failed.
    #[error("code heap mapping failed: {0}")]
    Mapping(#[from] MemoryError),

    /// An empty code buffer was published.
    #[error("refusing to publish empty code")]
    Empty,
}

struct Published {
    start: usize,
    size: usize,
    method: Option<&'static MethodDesc>,
}

/// The executable code heap.
pub struct CodeHeap {
    services: KernelServices,
    // Sorted by start address
    published: Mutex<Vec<Published>>,
}

impl CodeHeap {
    /// Create an empty code heap.
    pub fn new(services: KernelServices) -> Self {
        Self {
            services,
            published: Mutex::new(Vec::new()),
        }
    }

    /// Map `bytes` into fresh read-execute pages and return the address of
    /// the first byte.
    ///
    /// The mapping is created writable, filled, then re-protected; the
    /// returned address is only handed out after the transition.
    pub fn publish(
        &self,
        bytes: &[u8],
        method: Option<&'static MethodDesc>,
    ) -> Result<usize, CodeHeapError> {
        if bytes.is_empty() {
            return Err(CodeHeapError::Empty);
        }
        let pages = bytes.len().div_ceil(PAGE_SIZE);
        let phys = self
            .services
            .pages
            .alloc_contiguous(pages, AllocFlags::ZEROED)?;
        let va = self
            .services
            .memory
            .map(phys, pages * PAGE_SIZE, PageProt::READ | PageProt::WRITE)?;

        // Safety: the mapping is fresh and writable
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), va.as_ptr::<u8>(), bytes.len());
        }

        self.services.memory.protect(
            va,
            pages * PAGE_SIZE,
            PageProt::READ | PageProt::EXECUTE,
        )?;

        let start = va.as_usize();
        let mut published = self.published.lock();
        let insert_at = published.partition_point(|p| p.start < start);
        published.insert(
            insert_at,
            Published {
                start,
                size: bytes.len(),
                method,
            },
        );
        Ok(start)
    }

    /// Resolve a PC to the method whose emitted code contains it.
    ///
    /// Returns None for PCs outside the heap and for anonymous thunks.
    pub fn find_method(&self, pc: usize) -> Option<&'static MethodDesc> {
        let published = self.published.lock();
        let index = published.partition_point(|p| p.start <= pc);
        if index == 0 {
            return None;
        }
        let candidate = &published[index - 1];
        if pc < candidate.start + candidate.size {
            candidate.method
        } else {
            None
        }
    }

    /// Whether a PC lies anywhere in the heap (thunks included).
    pub fn contains(&self, pc: usize) -> bool {
        let published = self.published.lock();
        let index = published.partition_point(|p| p.start <= pc);
        index > 0 && pc < published[index - 1].start + published[index - 1].size
    }

    /// Total published bytes.
    pub fn total_size(&self) -> usize {
        self.published.lock().iter().map(|p| p.size).sum()
    }

    /// Number of published entries.
    pub fn entry_count(&self) -> usize {
        self.published.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use argon_hal::mock::HostMemory;

    #[test]
    fn test_publish_copies_bytes() {
        let heap = CodeHeap::new(*SERVICES);
        let code = vec![0x55, 0xC3];
        let addr = heap.publish(&code, None).unwrap();
        let copied = unsafe { std::slice::from_raw_parts(addr as *const u8, 2) };
        assert_eq!(copied, &code[..]);
        assert_eq!(heap.total_size(), 2);
    }

    #[test]
    fn test_publish_transitions_to_read_execute() {
        let memory = Box::leak(Box::new(HostMemory::new()));
        let mut services = *SERVICES;
        services.memory = memory;
        let heap = CodeHeap::new(services);
        heap.publish(&[0xC3], None).unwrap();

        let log = memory.protect_log();
        assert_eq!(log.len(), 1);
        let (_, _, prot) = log[0];
        assert_eq!(prot, PageProt::READ | PageProt::EXECUTE);
    }

    #[test]
    fn test_pc_lookup() {
        let heap = CodeHeap::new(*SERVICES);
        let a = heap.publish(&[0x90; 64], None).unwrap();
        let b = heap.publish(&[0x90; 32], None).unwrap();
        assert!(heap.contains(a));
        assert!(heap.contains(a + 63));
        assert!(!heap.contains(a + 64) || a + 64 == b);
        assert!(heap.contains(b + 31));
        assert!(!heap.contains(0));
    }

    #[test]
    fn test_empty_publish_rejected() {
        let heap = CodeHeap::new(*SERVICES);
        assert!(matches!(
            heap.publish(&[], None),
            Err(CodeHeapError::Empty)
        ));
    }
}
