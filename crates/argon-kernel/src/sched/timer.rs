//! Wait deadlines
//!
//! Sleeps and timed waits register here; the periodic tick sweeps
//! expired entries and re-enqueues their threads with a timed-out
//! indication.

use super::thread::{ThreadRecord, WakeReason};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deadline-ordered wait registry.
#[derive(Default)]
pub struct TimerWheel {
    entries: Mutex<BTreeMap<u64, Vec<Arc<ThreadRecord>>>>,
}

impl TimerWheel {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deadline for a waiting thread.
    pub fn arm(&self, deadline_ns: u64, thread: Arc<ThreadRecord>) {
        self.entries
            .lock()
            .entry(deadline_ns)
            .or_default()
            .push(thread);
    }

    /// Remove a thread (woken by its event before the deadline).
    pub fn disarm(&self, thread: &Arc<ThreadRecord>) {
        let mut entries = self.entries.lock();
        entries.retain(|_, threads| {
            threads.retain(|t| !Arc::ptr_eq(t, thread));
            !threads.is_empty()
        });
    }

    /// Collect every thread whose deadline is at or before `now_ns`,
    /// marking them timed out.
    pub fn expire(&self, now_ns: u64) -> Vec<Arc<ThreadRecord>> {
        let mut entries = self.entries.lock();
        let mut expired = Vec::new();
        let still_armed = entries.split_off(&(now_ns + 1));
        for (_, threads) in std::mem::replace(&mut *entries, still_armed) {
            for thread in threads {
                thread.set_wake_reason(WakeReason::TimedOut);
                expired.push(thread);
            }
        }
        expired
    }

    /// Number of armed deadlines.
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(|v| v.len()).sum()
    }

    /// Whether any deadline is armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::ThreadState;

    fn thread() -> Arc<ThreadRecord> {
        ThreadRecord::new(None, std::ptr::null(), crate::runtime::helpers_for_tests())
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let wheel = TimerWheel::new();
        let (a, b, c) = (thread(), thread(), thread());
        wheel.arm(100, a.clone());
        wheel.arm(50, b.clone());
        wheel.arm(200, c.clone());

        let expired = wheel.expire(100);
        assert_eq!(expired.len(), 2);
        assert!(Arc::ptr_eq(&expired[0], &b));
        assert!(Arc::ptr_eq(&expired[1], &a));
        assert_eq!(wheel.len(), 1);

        for t in &expired {
            assert_eq!(t.wake_reason(), WakeReason::TimedOut);
        }
        let _ = ThreadState::Waiting;
    }

    #[test]
    fn test_disarm_removes_thread() {
        let wheel = TimerWheel::new();
        let t = thread();
        wheel.arm(10, t.clone());
        assert_eq!(wheel.len(), 1);
        wheel.disarm(&t);
        assert!(wheel.is_empty());
        assert!(wheel.expire(1000).is_empty());
    }

    #[test]
    fn test_nothing_expires_early() {
        let wheel = TimerWheel::new();
        wheel.arm(500, thread());
        assert!(wheel.expire(499).is_empty());
        assert_eq!(wheel.expire(500).len(), 1);
    }
}
