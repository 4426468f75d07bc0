//! GC rendezvous
//!
//! Coordinates stop-the-world: the coordinator (a mutator in the
//! allocation slow path) raises the GC flag on every running thread,
//! then waits for them to park at their next safepoint. Parked threads
//! spin until resume; waiting/runnable threads are already stopped with
//! saved contexts and count as parked. Full fences bracket the "all
//! parked" decision and the resume, per the memory model.

use super::thread::{ThreadRecord, ThreadState};
use crate::jit::trampoline::poll_flags;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Stop-the-world coordinator.
pub struct SafepointCoordinator {
    /// A collection is in progress (mutators spin on this while parked).
    gc_active: AtomicBool,
    /// Serializes coordinators.
    coordinator_lock: Mutex<()>,
    /// Threads currently parked for GC.
    parked: AtomicUsize,
    /// Stop-the-world rendezvous completed this boot.
    pub rendezvous_count: AtomicUsize,
}

impl SafepointCoordinator {
    /// Create an idle coordinator.
    pub fn new() -> Self {
        Self {
            gc_active: AtomicBool::new(false),
            coordinator_lock: Mutex::new(()),
            parked: AtomicUsize::new(0),
            rendezvous_count: AtomicUsize::new(0),
        }
    }

    /// Whether a stop-the-world is in progress.
    pub fn gc_active(&self) -> bool {
        self.gc_active.load(Ordering::Acquire)
    }

    /// Bring every mutator except `coordinator` to a stop.
    ///
    /// Returns with the heap quiescent: every other thread is Waiting,
    /// Runnable, ParkedForGc or dead, and a full fence has been issued.
    pub fn stop_the_world(
        &self,
        threads: &[Arc<ThreadRecord>],
        coordinator: Option<&ThreadRecord>,
    ) {
        let guard = self.coordinator_lock.lock();
        self.gc_active.store(true, Ordering::SeqCst);

        for thread in threads {
            if let Some(me) = coordinator {
                if std::ptr::eq(thread.as_ref(), me) {
                    continue;
                }
            }
            thread.set_flag(poll_flags::GC);
        }

        // Wait until no other thread is Running
        let backoff = Backoff::new();
        loop {
            let running = threads
                .iter()
                .filter(|t| {
                    if let Some(me) = coordinator {
                        if std::ptr::eq(t.as_ref(), me) {
                            return false;
                        }
                    }
                    t.state() == ThreadState::Running
                })
                .count();
            if running == 0 {
                break;
            }
            backoff.snooze();
        }

        // Everything the mutators published is now visible
        fence(Ordering::SeqCst);
        self.rendezvous_count.fetch_add(1, Ordering::Relaxed);
        std::mem::forget(guard); // released by resume_the_world
    }

    /// Release parked mutators after collection.
    pub fn resume_the_world(&self, threads: &[Arc<ThreadRecord>]) {
        fence(Ordering::SeqCst);
        for thread in threads {
            thread.clear_flag(poll_flags::GC);
        }
        self.gc_active.store(false, Ordering::SeqCst);
        // Safety: paired with the forgotten guard in stop_the_world
        unsafe { self.coordinator_lock.force_unlock() };
    }

    /// Called by a mutator that observed the GC flag at a safepoint:
    /// parks (spinning) until the collector finishes.
    ///
    /// The caller has already saved its walk origin in its thread record.
    pub fn park_until_resumed(&self, thread: &ThreadRecord) {
        let previous = thread.state();
        thread.set_state(ThreadState::ParkedForGc);
        self.parked.fetch_add(1, Ordering::SeqCst);

        let backoff = Backoff::new();
        while thread.has_flag(poll_flags::GC) {
            backoff.snooze();
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);
        thread.set_state(previous);
    }

    /// Number of threads currently parked.
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Arc<ThreadRecord> {
        ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests())
    }

    #[test]
    fn test_stop_sets_flags_and_resume_clears() {
        let coord = SafepointCoordinator::new();
        let threads = vec![thread(), thread()];
        // Neither is Running, so the rendezvous completes immediately
        coord.stop_the_world(&threads, None);
        assert!(coord.gc_active());
        assert!(threads[0].has_flag(poll_flags::GC));
        assert!(threads[1].has_flag(poll_flags::GC));

        coord.resume_the_world(&threads);
        assert!(!coord.gc_active());
        assert!(!threads[0].has_flag(poll_flags::GC));
    }

    #[test]
    fn test_coordinator_excluded_from_flags() {
        let coord = SafepointCoordinator::new();
        let threads = vec![thread(), thread()];
        coord.stop_the_world(&threads, Some(&threads[0]));
        assert!(!threads[0].has_flag(poll_flags::GC));
        assert!(threads[1].has_flag(poll_flags::GC));
        coord.resume_the_world(&threads);
    }

    #[test]
    fn test_running_thread_blocks_rendezvous_until_parked() {
        let coord = Arc::new(SafepointCoordinator::new());
        let worker = thread();
        worker.set_state(ThreadState::Running);
        let threads = vec![worker.clone()];

        let coord2 = coord.clone();
        let threads2 = threads.clone();
        let stopper = std::thread::spawn(move || {
            coord2.stop_the_world(&threads2, None);
            coord2.rendezvous_count.load(Ordering::Relaxed)
        });

        // Simulate the mutator reaching its poll
        let backoff = Backoff::new();
        while !worker.has_flag(poll_flags::GC) {
            backoff.snooze();
        }
        worker.set_parked_walk(0, 0);
        let parker = {
            let coord = coord.clone();
            let worker2 = worker.clone();
            std::thread::spawn(move || coord.park_until_resumed(&worker2))
        };

        let count = stopper.join().unwrap();
        assert_eq!(count, 1);
        coord.resume_the_world(&threads);
        parker.join().unwrap();
        assert_eq!(worker.state(), ThreadState::Running);
        assert_eq!(coord.parked_count(), 0);
    }
}
