//! The per-slot generation lock.
//!
//! A single `u64` control word holds a 62-bit generation number, a
//! `locked` bit and a `replaced` bit:
//!
//! ```text
//! 63        62       61                                   0
//! +---------+--------+------------------------------------+
//! |replaced | locked |             generation             |
//! +---------+--------+------------------------------------+
//! ```
//!
//! Writers take the lock with one compare-and-swap and advance the
//! generation exactly once when they release it. Readers never take the
//! lock: they sample the word before and after copying the payload and
//! retry if anything moved in between. Once `replaced` is set it is never
//! cleared, and every later `try_lock` fails with
//! [`LockConflict::Replaced`].
use std::fmt;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::backoff::Backoff;

const LOCKED_BIT: u64 = 1 << 62;
const REPLACED_BIT: u64 = 1 << 63;
const GENERATION_MASK: u64 = LOCKED_BIT - 1;

/// A snapshot of a generation lock's control word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenLockState(u64);

impl GenLockState {
    /// The number of completed write generations, modulo 2^62.
    pub const fn generation(&self) -> u64 {
        self.0 & GENERATION_MASK
    }

    /// Whether a writer currently holds the slot.
    pub const fn is_locked(&self) -> bool {
        self.0 & LOCKED_BIT != 0
    }

    /// Whether the slot has been superseded by a newer one.
    pub const fn is_replaced(&self) -> bool {
        self.0 & REPLACED_BIT != 0
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for GenLockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenLockState")
            .field("generation", &self.generation())
            .field("locked", &self.is_locked())
            .field("replaced", &self.is_replaced())
            .finish()
    }
}

/// Why a `try_lock` attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockConflict {
    /// Another writer holds the lock. Back off and retry.
    Locked,
    /// The slot has been superseded. Re-resolve the key.
    Replaced,
}

/// The control word guarding one slot's length and payload.
pub struct GenLock {
    control: AtomicU64,
}

impl Default for GenLock {
    fn default() -> GenLock {
        GenLock::new()
    }
}

impl fmt::Debug for GenLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

impl GenLock {
    /// Unlocked, not replaced, generation 0.
    pub const fn new() -> GenLock {
        GenLock { control: AtomicU64::new(0) }
    }

    pub fn load(&self) -> GenLockState {
        GenLockState(self.control.load(Ordering::Acquire))
    }

    /// Attempts `locked: 0, replaced: 0 -> locked: 1` with a single CAS.
    /// Has no side effects on failure.
    pub fn try_lock(&self) -> Result<GenLockGuard<'_>, LockConflict> {
        let current = self.control.load(Ordering::Relaxed);

        if current & REPLACED_BIT != 0 {
            return Err(LockConflict::Replaced);
        }
        if current & LOCKED_BIT != 0 {
            return Err(LockConflict::Locked);
        }

        match self.control.compare_exchange(
            current,
            current | LOCKED_BIT,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                // payload stores made under the lock must not become
                // visible before the locked bit does.
                fence(Ordering::Release);
                Ok(GenLockGuard { lock: self, released: false })
            }
            Err(actual) if actual & REPLACED_BIT != 0 => {
                Err(LockConflict::Replaced)
            }
            Err(_) => Err(LockConflict::Locked),
        }
    }

    /// Spins (then yields) until the lock is acquired, or until the slot
    /// turns out to be replaced.
    pub fn lock(&self) -> Result<GenLockGuard<'_>, LockConflict> {
        let backoff = Backoff::new();
        loop {
            match self.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(LockConflict::Replaced) => {
                    return Err(LockConflict::Replaced);
                }
                Err(LockConflict::Locked) => backoff.snooze(),
            }
        }
    }

    /// Releases the lock and advances the generation by one. With
    /// `replaced` set, the slot is also retired permanently.
    ///
    /// Must only be called by the current lock holder, which is why it is
    /// only reachable through [`GenLockGuard`].
    fn unlock(&self, replaced: bool) {
        let current = self.control.load(Ordering::Relaxed);
        debug_assert!(current & LOCKED_BIT != 0, "unlock of an unlocked slot");
        debug_assert!(current & REPLACED_BIT == 0, "unlock of a replaced slot");

        let next_generation = (current + 1) & GENERATION_MASK;
        let next = if replaced {
            next_generation | REPLACED_BIT
        } else {
            next_generation
        };

        self.control.store(next, Ordering::Release);
    }

    /// Runs `read` until it observes a single, unlocked write generation.
    ///
    /// `read` may run several times and must tolerate observing a torn
    /// payload, which is discarded.
    pub fn read_consistent<T>(&self, mut read: impl FnMut() -> T) -> T {
        let backoff = Backoff::new();
        loop {
            let before = self.control.load(Ordering::Acquire);
            if before & LOCKED_BIT == 0 {
                let value = read();
                fence(Ordering::Acquire);
                let after = self.control.load(Ordering::Relaxed);
                if before == after {
                    return value;
                }
            }
            backoff.snooze();
        }
    }
}

/// Exclusive write access to a slot. Dropping the guard performs an
/// ordinary unlock.
#[must_use = "dropping the guard immediately releases the slot"]
pub struct GenLockGuard<'a> {
    lock: &'a GenLock,
    released: bool,
}

impl GenLockGuard<'_> {
    /// Ordinary unlock: clear `locked`, advance the generation.
    pub fn unlock(self) {
        self.release(false);
    }

    /// Retire the slot: clear `locked`, set `replaced`, advance the
    /// generation. The slot can never be locked again.
    pub fn unlock_replaced(self) {
        self.release(true);
    }

    fn release(mut self, replaced: bool) {
        self.lock.unlock(replaced);
        self.released = true;
    }
}

impl Drop for GenLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.unlock(false);
        }
    }
}
