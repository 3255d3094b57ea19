/// Adapted from crossbeam-utils' backoff.
use core::cell::Cell;
use core::hint;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Performs exponential backoff for writers contending on a slot's
/// generation lock.
///
/// Each step takes roughly twice as long as the previous one. Once the
/// spin budget is used up, `snooze` hands the processor back to the OS
/// scheduler instead of burning it, so a writer stuck behind a slow
/// peer (or behind a relocation that has not been installed yet) never
/// busy-waits indefinitely.
pub(crate) struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    pub const fn new() -> Self {
        Backoff { step: Cell::new(0) }
    }

    /// Backs off while waiting on another thread to release a resource.
    #[inline]
    pub fn snooze(&self) {
        if self.step.get() <= SPIN_LIMIT {
            for _ in 0..1 << self.step.get() {
                hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }

        if self.step.get() <= YIELD_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// True once spinning has stopped being worthwhile.
    #[cfg(test)]
    pub fn is_completed(&self) -> bool {
        self.step.get() > YIELD_LIMIT
    }
}

#[test]
fn backoff_escalates_to_yielding() {
    let backoff = Backoff::new();
    assert!(!backoff.is_completed());
    for _ in 0..=YIELD_LIMIT {
        backoff.snooze();
    }
    assert!(backoff.is_completed());
}
