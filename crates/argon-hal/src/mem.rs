//! Physical pages and virtual mappings

use bitflags::bitflags;
use thiserror::Error;

/// Architectural page size. Argon only maps 4 KiB pages.
pub const PAGE_SIZE: usize = 4096;

/// A physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Numeric value of the address.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A virtual address in the kernel address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Numeric value of the address.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Interpret the address as a raw pointer.
    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

bitflags! {
    /// Protection bits for a virtual mapping.
    ///
    /// The core never requests `WRITE | EXECUTE` together; the JIT maps
    /// code pages writable, fills them, then re-protects to `READ | EXECUTE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProt: u8 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Allocation hints for the physical allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u8 {
        /// Zero the pages before returning them.
        const ZEROED = 1 << 0;
        /// Prefer memory local to the calling CPU's NUMA node.
        const NODE_LOCAL = 1 << 1;
    }
}

/// Errors from the memory collaborators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The physical allocator has no run of the requested length.
    #[error("out of physical memory ({pages} contiguous pages requested)")]
    OutOfPhysicalMemory {
        /// Number of pages that was requested.
        pages: usize,
    },

    /// No free virtual range of the requested size.
    #[error("out of kernel virtual address space")]
    OutOfVirtualSpace,

    /// The given range is not a mapping this collaborator handed out.
    #[error("address range is not mapped")]
    NotMapped,
}

/// Physical page allocator.
pub trait PageAllocator: Sync {
    /// Allocate `pages` physically contiguous pages.
    fn alloc_contiguous(&self, pages: usize, flags: AllocFlags) -> Result<PhysAddr, MemoryError>;

    /// Return pages obtained from [`PageAllocator::alloc_contiguous`].
    fn free_contiguous(&self, phys: PhysAddr, pages: usize);
}

/// Kernel virtual memory primitives.
pub trait VirtualMemory: Sync {
    /// Map `size` bytes of physical memory at a fresh virtual range.
    fn map(&self, phys: PhysAddr, size: usize, prot: PageProt) -> Result<VirtAddr, MemoryError>;

    /// Change the protection of an existing mapping.
    fn protect(&self, va: VirtAddr, size: usize, prot: PageProt) -> Result<(), MemoryError>;

    /// Remove a mapping. The physical pages are not freed.
    fn unmap(&self, va: VirtAddr, size: usize) -> Result<(), MemoryError>;
}
