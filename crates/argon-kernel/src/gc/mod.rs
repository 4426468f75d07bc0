//! Garbage collection
//!
//! A stop-the-world, compacting Lisp-2 mark-sweep collector over
//! bump-allocated small-object slabs, plus a swept (never compacted)
//! large-object list. Root discovery is precise: JIT stackmaps for
//! frames, reference maps for static regions, the handle table and the
//! finalizer queue. There is no write barrier: the collector is neither
//! generational nor concurrent, so emitted stores stay plain.

pub mod collector;
pub mod finalizer;
pub mod handles;
pub mod header;
pub mod heap;
pub mod roots;

pub use collector::{CollectionOutcome, Collector, GcStats};
pub use finalizer::FinalizerQueue;
pub use handles::{Handle, HandleKind, HandleTable};
pub use header::ObjHeader;
pub use heap::{Heap, DEFAULT_GC_TRIGGER, LOH_THRESHOLD, SLAB_SIZE, TLAB_SIZE};
pub use roots::{RootSet, RootSlot};
