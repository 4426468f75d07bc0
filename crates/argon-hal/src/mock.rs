//! Host-backed collaborators for tests
//!
//! These run the managed core on a host OS: pages come from `std::alloc`,
//! mappings are identity, the timer is ticked manually. Context switching
//! is not supported; scheduler tests drive queue state directly.

use crate::cpu::{CpuContext, CpuControl, CpuId, CpuInfo, CpuTopology};
use crate::intr::{Interrupt, IrqHandler, Timer};
use crate::mem::{
    AllocFlags, MemoryError, PageAllocator, PageProt, PhysAddr, VirtAddr, PAGE_SIZE,
};
use crate::Console;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Page allocator over the host heap. Physical addresses are host pointers.
#[derive(Default)]
pub struct HostPageAllocator {
    outstanding: Mutex<HashMap<u64, usize>>,
}

impl HostPageAllocator {
    /// Create a host page allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding allocations (leak checking in tests).
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

impl PageAllocator for HostPageAllocator {
    fn alloc_contiguous(&self, pages: usize, _flags: AllocFlags) -> Result<PhysAddr, MemoryError> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // Always zeroed on the host; AllocFlags::ZEROED is a hint for the real allocator
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::OutOfPhysicalMemory { pages });
        }
        self.outstanding.lock().unwrap().insert(ptr as u64, pages);
        Ok(PhysAddr(ptr as u64))
    }

    fn free_contiguous(&self, phys: PhysAddr, pages: usize) {
        let tracked = self.outstanding.lock().unwrap().remove(&phys.0);
        assert_eq!(tracked, Some(pages), "free of untracked physical range");
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(phys.0 as *mut u8, layout) };
    }
}

/// Identity virtual memory: `map` returns the physical address unchanged and
/// records every `protect` call so tests can assert the W^X discipline.
#[derive(Default)]
pub struct HostMemory {
    protects: Mutex<Vec<(VirtAddr, usize, PageProt)>>,
}

impl HostMemory {
    /// Create an identity memory mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(va, size, prot)` triple passed to [`VirtualMemory::protect`].
    pub fn protect_log(&self) -> Vec<(VirtAddr, usize, PageProt)> {
        self.protects.lock().unwrap().clone()
    }
}

impl crate::mem::VirtualMemory for HostMemory {
    fn map(&self, phys: PhysAddr, _size: usize, prot: PageProt) -> Result<VirtAddr, MemoryError> {
        assert!(
            !prot.contains(PageProt::WRITE | PageProt::EXECUTE),
            "mapping requested writable and executable"
        );
        Ok(VirtAddr(phys.0 as usize))
    }

    fn protect(&self, va: VirtAddr, size: usize, prot: PageProt) -> Result<(), MemoryError> {
        assert!(
            !prot.contains(PageProt::WRITE | PageProt::EXECUTE),
            "protect requested writable and executable"
        );
        self.protects.lock().unwrap().push((va, size, prot));
        Ok(())
    }

    fn unmap(&self, _va: VirtAddr, _size: usize) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// Interrupt controller that records registrations and never fires.
#[derive(Default)]
pub struct NullInterrupts {
    handlers: Mutex<HashMap<u8, IrqHandler>>,
}

impl NullInterrupts {
    /// Create an inert interrupt controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke the handler registered for `vector`, as the hardware would.
    pub fn fire(&self, vector: u8) {
        let handler = self.handlers.lock().unwrap().get(&vector).copied();
        if let Some(handler) = handler {
            handler(vector);
        }
    }
}

impl Interrupt for NullInterrupts {
    fn register(&self, vector: u8, handler: IrqHandler) {
        self.handlers.lock().unwrap().insert(vector, handler);
    }

    fn eoi(&self, _vector: u8) {}
}

/// Manually advanced timer.
pub struct ManualTimer {
    now: AtomicU64,
    period: AtomicU64,
}

impl ManualTimer {
    /// Create a timer at t=0.
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            period: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `ns`.
    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    /// The armed periodic interval, if any.
    pub fn armed_period(&self) -> Option<u64> {
        match self.period.load(Ordering::SeqCst) {
            0 => None,
            ns => Some(ns),
        }
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for ManualTimer {
    fn vector(&self) -> u8 {
        0x20
    }

    fn arm_oneshot(&self, _ns: u64) {}

    fn arm_periodic(&self, ns: u64) {
        self.period.store(ns, Ordering::SeqCst);
    }

    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Fixed topology of `n` CPUs on one NUMA node.
pub struct FixedTopology {
    cpus: Vec<CpuInfo>,
}

impl FixedTopology {
    /// Create a topology with `n` CPUs.
    pub fn new(n: u32) -> Self {
        let cpus = (0..n)
            .map(|i| CpuInfo {
                id: CpuId(i),
                numa_node: 0,
                apic_id: i,
            })
            .collect();
        Self { cpus }
    }
}

impl CpuTopology for FixedTopology {
    fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }
}

/// CPU control for tests. Always reports CPU 0; switching is unsupported.
pub struct SingleCpu;

impl CpuControl for SingleCpu {
    fn current_cpu(&self) -> CpuId {
        CpuId(0)
    }

    unsafe fn context_switch(&self, _save: *mut CpuContext, _restore: *const CpuContext) {
        unimplemented!("context switching is not available on the host");
    }

    unsafe fn restore(&self, _restore: *const CpuContext) -> ! {
        unimplemented!("context restore is not available on the host");
    }

    unsafe fn capture(&self, _save: *mut CpuContext) -> bool {
        unimplemented!("context capture is not available on the host");
    }

    fn idle(&self) {
        std::thread::yield_now();
    }

    fn halt(&self) -> ! {
        panic!("halt requested");
    }
}

/// Console that appends to an in-memory buffer.
#[derive(Default)]
pub struct RecordingConsole {
    buffer: Mutex<String>,
}

impl RecordingConsole {
    /// Create an empty recording console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }
}

impl Console for RecordingConsole {
    fn write(&self, s: &str) {
        self.buffer.lock().unwrap().push_str(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::VirtualMemory;

    #[test]
    fn test_host_pages_round_trip() {
        let pages = HostPageAllocator::new();
        let phys = pages.alloc_contiguous(4, AllocFlags::ZEROED).unwrap();
        assert_eq!(pages.outstanding(), 1);
        assert_eq!(phys.0 % PAGE_SIZE as u64, 0);
        pages.free_contiguous(phys, 4);
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn test_host_memory_identity_map() {
        let mem = HostMemory::new();
        let va = mem.map(PhysAddr(0x1000), PAGE_SIZE, PageProt::READ | PageProt::WRITE).unwrap();
        assert_eq!(va.as_usize(), 0x1000);
    }

    #[test]
    #[should_panic(expected = "writable and executable")]
    fn test_host_memory_rejects_wx() {
        let mem = HostMemory::new();
        let _ = mem.map(
            PhysAddr(0x1000),
            PAGE_SIZE,
            PageProt::READ | PageProt::WRITE | PageProt::EXECUTE,
        );
    }

    #[test]
    fn test_manual_timer_advance() {
        let timer = ManualTimer::new();
        assert_eq!(timer.now_ns(), 0);
        timer.advance(1_000_000);
        assert_eq!(timer.now_ns(), 1_000_000);
    }

    #[test]
    fn test_fixed_topology() {
        let topo = FixedTopology::new(4);
        assert_eq!(topo.cpus().len(), 4);
        assert_eq!(topo.cpus()[3].id, CpuId(3));
    }
}
