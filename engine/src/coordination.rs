//! The two pieces of state that cross the Scheduler/MMU boundary outside the mailbox: the
//! `swappable` candidate list (published read-only by the scheduler, consumed by the MMU) and the
//! swap lock (held by the MMU for the duration of a multi-step swap-out, checked by the
//! scheduler before it advances the running process).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::pcb::Pid;

#[derive(Default)]
pub struct SwapCoordination {
    locked: AtomicBool,
    swappable: Mutex<Vec<Pid>>,
}

impl SwapCoordination {
    pub fn new() -> Self { SwapCoordination { locked: AtomicBool::new(false), swappable: Mutex::new(Vec::new()) } }

    /// True while the MMU is mid swap-out sequence. The scheduler must not advance the running
    /// process while this holds.
    pub fn is_locked(&self) -> bool { self.locked.load(Ordering::Acquire) }

    /// Acquired once by the MMU at the start of a NO_FREE_FRAMES retry loop, not per retry.
    pub fn lock(&self) { self.locked.store(true, Ordering::Release); }

    pub fn unlock(&self) { self.locked.store(false, Ordering::Release); }

    /// Called by the scheduler each tick to publish which PIDs are currently swap candidates: any
    /// BLOCKED process, plus the PID at the tail of READY.
    pub fn publish_swappable(&self, candidates: Vec<Pid>) { *self.swappable.lock().unwrap() = candidates; }

    /// Called by the MMU to pop the next victim candidate. Candidates are consumed front-to-back
    /// and not replaced until the scheduler republishes next tick.
    pub fn take_next_candidate(&self) -> Option<Pid> {
        let mut guard = self.swappable.lock().unwrap();
        if guard.is_empty() { None } else { Some(guard.remove(0)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trips() {
        let c = SwapCoordination::new();
        assert!(!c.is_locked());
        c.lock();
        assert!(c.is_locked());
        c.unlock();
        assert!(!c.is_locked());
    }

    #[test]
    fn candidates_consumed_front_to_back() {
        let c = SwapCoordination::new();
        c.publish_swappable(vec![Pid(1), Pid(2)]);
        assert_eq!(c.take_next_candidate(), Some(Pid(1)));
        assert_eq!(c.take_next_candidate(), Some(Pid(2)));
        assert_eq!(c.take_next_candidate(), None);
    }
}
