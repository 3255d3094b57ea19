//! Operation contexts.
//!
//! A context is built from the caller's buffers, owns them for the whole
//! logical operation, and implements the callbacks the engine invokes on
//! slots: the initial write into a fresh slot, the grow-and-copy into a
//! successor slot, and the in-place update under the generation lock.
//!
//! When an operation cannot finish synchronously the engine moves the
//! context into a boxed continuation. That move is the only ownership
//! transfer there is; the caller's frame keeps nothing that could be
//! released twice.
use std::fmt;

use inline_array::InlineArray;

use crate::record::{InPlace, Slot};
use crate::Status;

/// `merge(old, delta, dst)` returns the length of the merged value. With
/// `dst = None` it only computes that length; with `Some(dst)` it also
/// writes the merged bytes into `dst`, which is exactly that long.
///
/// Must be a pure function of `old` and `delta`.
pub type MergeFn = dyn Fn(&[u8], &[u8], Option<&mut [u8]>) -> usize;

/// Receives the value (or `None` when the key does not exist) and the
/// final status of a read. Called exactly once per read.
pub type ReadCallback = Box<dyn FnOnce(Option<&[u8]>, Status)>;

/// Receives the final status of an operation that went pending.
pub type CompletionCallback = Box<dyn FnOnce(Status)>;

/// Identifies the exact payload an old value was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadId {
    /// An in-memory slot at `address`, as of write generation `generation`.
    Slot { address: u64, generation: u64 },
    /// A record in the recovered checkpoint log at `offset`.
    Cold { offset: u64 },
}

pub(crate) struct ReadContext {
    key: InlineArray,
    callback: ReadCallback,
}

impl fmt::Debug for ReadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadContext").field("key", &self.key).finish()
    }
}

impl ReadContext {
    pub fn new(key: InlineArray, callback: ReadCallback) -> ReadContext {
        ReadContext { key, callback }
    }

    pub fn key(&self) -> &InlineArray {
        &self.key
    }

    /// Copies the value out of a live slot without blocking its writers.
    pub fn get(self, slot: &Slot) -> Status {
        let value = slot.read();
        self.get_bytes(&value)
    }

    /// Completes the read with bytes fetched from the device.
    pub fn get_bytes(self, value: &[u8]) -> Status {
        (self.callback)(Some(value), Status::Ok);
        Status::Ok
    }

    pub fn not_found(self) -> Status {
        (self.callback)(None, Status::NotFound);
        Status::NotFound
    }

    pub fn fail(self, status: Status) -> Status {
        (self.callback)(None, status);
        status
    }
}

#[derive(Debug)]
pub(crate) struct UpsertContext {
    key: InlineArray,
    value: InlineArray,
}

impl UpsertContext {
    pub fn new(key: InlineArray, value: InlineArray) -> UpsertContext {
        UpsertContext { key, value }
    }

    pub fn key(&self) -> &InlineArray {
        &self.key
    }

    /// The capacity a fresh slot needs for this value.
    pub fn value_size(&self) -> usize {
        self.value.len()
    }

    /// Initial write into a slot nobody else can see yet.
    pub fn put(&self, address: u64) -> Slot {
        Slot::with_payload(address, &self.value)
    }

    /// In-place overwrite of a possibly shared slot. When the value does
    /// not fit, `reserve` is asked for a successor's capacity before the
    /// slot is retired.
    pub fn put_atomic(
        &self,
        slot: &Slot,
        reserve: &dyn Fn(usize) -> bool,
    ) -> InPlace {
        let Ok(mut writer) = slot.lock() else {
            return InPlace::Stale;
        };

        if self.value.len() > writer.capacity() {
            if !reserve(self.value.len()) {
                return InPlace::NoSpace;
            }
            log::trace!(
                "upsert of {} bytes retires slot {} with capacity {}",
                self.value.len(),
                writer.address(),
                writer.capacity()
            );
            writer.retire();
            return InPlace::Retired(());
        }

        writer.overwrite(&self.value);
        writer.commit();
        InPlace::Updated
    }
}

#[derive(Debug, Clone, Copy)]
struct Memo {
    source: PayloadId,
    len: usize,
}

pub(crate) struct RmwContext {
    key: InlineArray,
    delta: InlineArray,
    merge: Box<MergeFn>,
    memo: Option<Memo>,
    on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for RmwContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmwContext")
            .field("key", &self.key)
            .field("delta", &self.delta)
            .field("memo", &self.memo)
            .finish()
    }
}

impl RmwContext {
    pub fn new(
        key: InlineArray,
        delta: InlineArray,
        merge: Box<MergeFn>,
        on_complete: Option<CompletionCallback>,
    ) -> RmwContext {
        RmwContext { key, delta, merge, memo: None, on_complete }
    }

    /// Delivers the final status of an operation that went pending.
    pub fn complete(self, status: Status) -> Status {
        match self.on_complete {
            Some(on_complete) => on_complete(status),
            None if !status.is_ok() => {
                log::warn!(
                    "pending rmw on {:?} finished with {}",
                    self.key,
                    status
                )
            }
            None => {}
        }
        status
    }

    pub fn key(&self) -> &InlineArray {
        &self.key
    }

    /// Capacity needed when there is no prior value.
    pub fn initial_value_size(&self) -> usize {
        self.delta.len()
    }

    /// Length of `merge(old, delta)`. Memoized per source payload, so the
    /// size probe and the following write agree without calling `merge`
    /// twice, and a memo is never applied to a different payload.
    pub fn value_size(&mut self, old: &[u8], source: PayloadId) -> usize {
        if let Some(memo) = self.memo {
            if memo.source == source {
                return memo.len;
            }
        }

        let len = (self.merge)(old, &self.delta, None);
        self.memo = Some(Memo { source, len });
        len
    }

    fn merged(&mut self, old: &[u8], source: PayloadId) -> Vec<u8> {
        let len = self.value_size(old, source);
        let mut buf = vec![0_u8; len];
        let written = (self.merge)(old, &self.delta, Some(&mut buf));
        debug_assert_eq!(
            written, len,
            "merge function returned an unstable length"
        );
        buf.truncate(written);
        buf
    }

    /// No prior value: the delta becomes the value verbatim.
    pub fn rmw_initial(&self, address: u64) -> Slot {
        Slot::with_payload(address, &self.delta)
    }

    /// Merges into a fresh successor slot sized for the result.
    pub fn rmw_copy(
        &mut self,
        old: &[u8],
        source: PayloadId,
        address: u64,
    ) -> Slot {
        let merged = self.merged(old, source);
        Slot::with_payload(address, &merged)
    }

    /// Merges in place under the slot's lock. When the result does not
    /// fit and `reserve` grants a successor's capacity, the slot is retired
    /// and the value it held is handed back for `rmw_copy`.
    pub fn rmw_atomic(
        &mut self,
        slot: &Slot,
        reserve: &dyn Fn(usize) -> bool,
    ) -> InPlace<(Vec<u8>, PayloadId)> {
        let Ok(mut writer) = slot.lock() else {
            return InPlace::Stale;
        };

        let old = writer.current();
        let source = PayloadId::Slot {
            address: writer.address(),
            generation: writer.generation(),
        };

        let new_len = self.value_size(&old, source);
        if new_len > writer.capacity() {
            if !reserve(new_len) {
                return InPlace::NoSpace;
            }
            log::trace!(
                "rmw retires slot {} with capacity {}",
                writer.address(),
                writer.capacity()
            );
            writer.retire();
            return InPlace::Retired((old, source));
        }

        let merged = self.merged(&old, source);
        writer.overwrite(&merged);
        writer.commit();
        InPlace::Updated
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn add_bytes(counter: Rc<Cell<usize>>) -> Box<MergeFn> {
        Box::new(move |old, delta, dst| {
            if dst.is_none() {
                counter.set(counter.get() + 1);
            }
            let len = old.len().max(delta.len());
            if let Some(dst) = dst {
                for (i, b) in dst.iter_mut().enumerate() {
                    let o = old.get(i).copied().unwrap_or(0);
                    let d = delta.get(i).copied().unwrap_or(0);
                    *b = o.wrapping_add(d);
                }
            }
            len
        })
    }

    fn key() -> InlineArray {
        InlineArray::from(&b"k"[..])
    }

    fn unlimited(_: usize) -> bool {
        true
    }

    #[test]
    fn put_atomic_respects_capacity() {
        let slot = UpsertContext::new(key(), InlineArray::from(&[1_u8; 8][..]))
            .put(1);

        let smaller =
            UpsertContext::new(key(), InlineArray::from(&[2_u8; 3][..]));
        assert_eq!(smaller.put_atomic(&slot, &unlimited), InPlace::Updated);
        assert_eq!(slot.read(), vec![2; 3]);

        let larger =
            UpsertContext::new(key(), InlineArray::from(&[3_u8; 9][..]));
        assert_eq!(larger.put_atomic(&slot, &|_| false), InPlace::NoSpace);
        assert!(!slot.is_replaced());

        assert_eq!(larger.put_atomic(&slot, &unlimited), InPlace::Retired(()));
        assert!(slot.is_replaced());
        assert_eq!(slot.read(), vec![2; 3]);

        assert_eq!(smaller.put_atomic(&slot, &unlimited), InPlace::Stale);
    }

    #[test]
    fn rmw_initial_writes_delta_verbatim() {
        let calls = Rc::new(Cell::new(0));
        let ctx = RmwContext::new(
            key(),
            InlineArray::from(&[9_u8, 9][..]),
            add_bytes(calls.clone()),
            None,
        );
        let slot = ctx.rmw_initial(4);
        assert_eq!(slot.read(), vec![9, 9]);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn rmw_memoizes_length_per_payload() {
        let calls = Rc::new(Cell::new(0));
        let mut ctx = RmwContext::new(
            key(),
            InlineArray::from(&[10_u8][..]),
            add_bytes(calls.clone()),
            None,
        );

        let source = PayloadId::Slot { address: 1, generation: 0 };
        let old = [0x2A_u8];

        assert_eq!(ctx.value_size(&old, source), 1);
        assert_eq!(ctx.value_size(&old, source), 1);
        assert_eq!(calls.get(), 1);

        // the memo does not change what gets written
        let a = ctx.rmw_copy(&old, source, 2).read();
        let b = ctx.rmw_copy(&old, source, 3).read();
        assert_eq!(a, vec![0x34]);
        assert_eq!(a, b);
        assert_eq!(calls.get(), 1);

        // a different payload is never served from the memo
        let other = PayloadId::Slot { address: 1, generation: 1 };
        assert_eq!(ctx.value_size(&[1, 2, 3], other), 3);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn rmw_atomic_merges_in_place_or_retires() {
        let calls = Rc::new(Cell::new(0));
        let slot = Slot::with_payload(1, &[0x2A]);

        let mut ctx = RmwContext::new(
            key(),
            InlineArray::from(&[10_u8][..]),
            add_bytes(calls.clone()),
            None,
        );
        assert_eq!(ctx.rmw_atomic(&slot, &unlimited), InPlace::Updated);
        assert_eq!(slot.read(), vec![0x34]);

        let mut growing = RmwContext::new(
            key(),
            InlineArray::from(&[1_u8, 1][..]),
            add_bytes(calls),
            None,
        );
        assert_eq!(growing.rmw_atomic(&slot, &|_| false), InPlace::NoSpace);
        assert_eq!(slot.read(), vec![0x34]);

        let InPlace::Retired((old, source)) =
            growing.rmw_atomic(&slot, &unlimited)
        else {
            panic!("expected the slot to be retired");
        };
        assert_eq!(old, vec![0x34]);
        assert!(slot.is_replaced());

        let successor = growing.rmw_copy(&old, source, 2);
        assert_eq!(successor.read(), vec![0x35, 1]);
        assert_eq!(successor.capacity(), 2);

        assert_eq!(growing.rmw_atomic(&slot, &unlimited), InPlace::Stale);
    }

    #[test]
    fn read_reports_missing_keys_through_callback() {
        let seen = Rc::new(Cell::new(None));
        let seen2 = seen.clone();
        let ctx = ReadContext::new(
            key(),
            Box::new(move |value, status| {
                seen2.set(Some((value.map(<[u8]>::len).unwrap_or(0), status)));
            }),
        );
        assert_eq!(ctx.not_found(), Status::NotFound);
        assert_eq!(seen.get(), Some((0, Status::NotFound)));
    }
}
