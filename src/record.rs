use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::gen_lock::{GenLock, GenLockGuard, GenLockState, LockConflict};

/// What happened to an attempted in-place mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InPlace<R = ()> {
    /// The slot now holds the new payload.
    Updated,
    /// The new payload did not fit. This caller retired the slot and is
    /// responsible for installing its successor. Carries whatever the
    /// caller read under the lock before retiring.
    Retired(R),
    /// Someone else already retired the slot. Re-resolve the key.
    Stale,
    /// The new payload did not fit and no budget was available for a
    /// successor. The slot was left untouched.
    NoSpace,
}

/// One fixed-capacity record version.
///
/// The header is the generation lock, the capacity chosen by the first
/// write, the active length, and the address the engine allocated the
/// slot at. The payload is stored inline as atomics so that optimistic
/// readers racing a writer stay well defined; torn copies are detected
/// and discarded by the generation check.
pub struct Slot {
    gen_lock: GenLock,
    address: u64,
    length: AtomicUsize,
    payload: Box<[AtomicU8]>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("address", &self.address)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("gen_lock", &self.gen_lock)
            .finish()
    }
}

impl Slot {
    /// The first write into a freshly allocated slot. Nothing else can see
    /// the slot yet, so no synchronization is needed: capacity and length
    /// both become `payload.len()`.
    pub fn with_payload(address: u64, payload: &[u8]) -> Slot {
        Slot {
            gen_lock: GenLock::new(),
            address,
            length: AtomicUsize::new(payload.len()),
            payload: payload.iter().map(|b| AtomicU8::new(*b)).collect(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Bytes allocated at creation. Never changes.
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// The active length at the time of the call. Only meaningful under
    /// the lock or as part of an optimistic read.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> GenLockState {
        self.gen_lock.load()
    }

    pub fn is_replaced(&self) -> bool {
        self.state().is_replaced()
    }

    /// Copies the payload with the optimistic read protocol. Never blocks a
    /// writer.
    pub fn read(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.capacity());
        self.read_into(&mut buf);
        buf
    }

    /// Like `read`, also returning the generation the copy belongs to.
    pub fn read_versioned(&self) -> (Vec<u8>, GenLockState) {
        let mut buf = Vec::with_capacity(self.capacity());
        let state = self.gen_lock.read_consistent(|| {
            self.copy_out(&mut buf);
            self.gen_lock.load()
        });
        (buf, state)
    }

    pub fn read_into(&self, buf: &mut Vec<u8>) {
        self.gen_lock.read_consistent(|| self.copy_out(buf));
    }

    fn copy_out(&self, buf: &mut Vec<u8>) {
        buf.clear();
        // a torn length is still bounded by the capacity
        let len = self.length.load(Ordering::Relaxed).min(self.capacity());
        buf.extend(
            self.payload[..len].iter().map(|b| b.load(Ordering::Relaxed)),
        );
    }

    /// Acquires exclusive write access, backing off while other writers
    /// hold the slot.
    pub fn lock(&self) -> Result<SlotWriter<'_>, LockConflict> {
        let guard = self.gen_lock.lock()?;
        let generation = self.gen_lock.load().generation();
        Ok(SlotWriter { slot: self, guard, generation })
    }

    /// Single attempt at write access.
    pub fn try_lock(&self) -> Result<SlotWriter<'_>, LockConflict> {
        let guard = self.gen_lock.try_lock()?;
        let generation = self.gen_lock.load().generation();
        Ok(SlotWriter { slot: self, guard, generation })
    }
}

/// A slot held under its generation lock.
pub struct SlotWriter<'a> {
    slot: &'a Slot,
    guard: GenLockGuard<'a>,
    generation: u64,
}

impl SlotWriter<'_> {
    /// The generation that was current when the lock was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn address(&self) -> u64 {
        self.slot.address
    }

    pub fn capacity(&self) -> usize {
        self.slot.capacity()
    }

    /// The payload as of the lock acquisition. Stable while held.
    pub fn current(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.slot.capacity());
        self.slot.copy_out(&mut buf);
        buf
    }

    /// Overwrites length and bytes. `bytes` must fit the capacity.
    pub fn overwrite(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.slot.capacity(),
            "in-place write of {} bytes into a slot of capacity {}",
            bytes.len(),
            self.slot.capacity()
        );
        for (dst, src) in self.slot.payload.iter().zip(bytes) {
            dst.store(*src, Ordering::Relaxed);
        }
        self.slot.length.store(bytes.len(), Ordering::Relaxed);
    }

    /// Publishes the write and releases the slot.
    pub fn commit(self) {
        self.guard.unlock();
    }

    /// Releases the slot and marks it replaced forever.
    pub fn retire(self) {
        self.guard.unlock_replaced();
    }
}
