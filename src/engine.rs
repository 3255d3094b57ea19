//! The key-value engine behind both store backends.
//!
//! Keys resolve through the [`HashIndex`] to either a hot in-memory
//! [`Slot`] or a cold record in a recovered checkpoint log. Slots are
//! mutated in place under their generation lock while the new payload
//! fits, and superseded by a freshly allocated successor when it does
//! not. Only the writer that retired a slot installs its successor.
use std::io;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use fnv::FnvHashMap;
use inline_array::InlineArray;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::context::{PayloadId, ReadContext, RmwContext, UpsertContext};
use crate::device::{CheckpointImage, Device};
use crate::index::{Entry, HashIndex};
use crate::record::{InPlace, Slot};
use crate::session::{EngineSession, Notice, SessionShared};
use crate::version::Versions;
use crate::{CheckpointToken, Config, Error, Result, SessionId, Status};

/// Bytes accounted per slot on top of its payload capacity: the
/// generation word, the address and the active length.
pub(crate) const SLOT_HEADER_LEN: u64 = 24;

/// Invoked once per session that observes a finished checkpoint, with
/// the checkpoint's status and that session's durable serial number.
pub(crate) type PersistCallback = Arc<Mutex<dyn FnMut(Status, u64) + Send>>;

/// Returned immediately by [`crate::Store::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Whether a checkpoint was started.
    pub accepted: bool,
    /// Names both the index and the log half of the checkpoint. Nil when
    /// the checkpoint was refused.
    pub token: CheckpointToken,
}

impl CheckpointResult {
    fn refused() -> CheckpointResult {
        CheckpointResult { accepted: false, token: Uuid::nil() }
    }
}

/// Returned by [`crate::Store::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub status: Status,
    /// The version the checkpoint was taken at. Zero when recovery failed.
    pub version: u64,
    /// Sessions that may be resumed with `continue_session`.
    pub session_ids: Vec<SessionId>,
}

impl RecoveryResult {
    fn failed(status: Status) -> RecoveryResult {
        RecoveryResult { status, version: 0, session_ids: vec![] }
    }
}

/// How an operation left the engine.
#[derive(Debug)]
pub(crate) enum Outcome<C> {
    Done(Status),
    /// The old value lives at `offset` of the recovered log. The context
    /// is handed back to be parked until the record has been read.
    Pending { ctx: C, offset: u64 },
}

/// A finished background read of a cold record.
#[derive(Debug)]
pub(crate) struct IoCompletion {
    pub id: u64,
    pub result: io::Result<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct Engine<D: Device> {
    pub(crate) config: Config,
    pub(crate) versions: Versions,
    index: HashIndex,
    device: Arc<D>,
    tail: AtomicU64,
    log_bytes: AtomicU64,
    sessions: Mutex<FnvHashMap<SessionId, Arc<SessionShared>>>,
    recovered_log: RwLock<Option<Uuid>>,
    checkpoint_thread: Mutex<Option<JoinHandle<Status>>>,
}

impl<D: Device> Engine<D> {
    pub fn new(config: Config, device: D) -> Engine<D> {
        Engine {
            index: HashIndex::new(config.table_size),
            config,
            versions: Versions::default(),
            device: Arc::new(device),
            tail: AtomicU64::new(0),
            log_bytes: AtomicU64::new(0),
            sessions: Mutex::default(),
            recovered_log: RwLock::new(None),
            checkpoint_thread: Mutex::new(None),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.device.is_durable()
    }

    /// Claims log budget for a slot of `capacity` payload bytes.
    fn reserve(&self, capacity: usize) -> bool {
        let need = SLOT_HEADER_LEN + capacity as u64;
        let limit = self.config.log_size;
        let mut current = self.log_bytes.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(need) else {
                return false;
            };
            if next > limit {
                log::warn!(
                    "log budget exhausted: {} of {} bytes in use, {} requested",
                    current,
                    limit,
                    need
                );
                return false;
            }
            match self.log_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the budget of a slot that is no longer reachable from the
    /// index.
    fn release(&self, capacity: usize) {
        if cfg!(feature = "monotonic-behavior") {
            return;
        }
        let freed = SLOT_HEADER_LEN + capacity as u64;
        let last = self.log_bytes.fetch_sub(freed, Ordering::AcqRel);
        debug_assert!(last >= freed, "released more log budget than reserved");
    }

    /// Log address for a new slot. Addresses are never reused.
    fn allocate(&self, capacity: usize) -> u64 {
        let len = SLOT_HEADER_LEN + capacity as u64;
        self.tail.fetch_add(len, Ordering::Relaxed)
    }

    fn new_slot(
        &self,
        capacity: usize,
        fill: impl FnOnce(u64) -> Slot,
    ) -> Arc<Slot> {
        let slot = fill(self.allocate(capacity));
        debug_assert_eq!(slot.capacity(), capacity);
        Arc::new(slot)
    }

    /// Swaps the successor of a slot this caller retired into the index.
    fn install(
        &self,
        key: &InlineArray,
        retired: Arc<Slot>,
        successor: Arc<Slot>,
    ) -> Status {
        let freed = retired.capacity();
        let successor_capacity = successor.capacity();
        let retired = Entry::Hot(retired);
        match self.index.replace(key, &retired, Entry::Hot(successor)) {
            Ok(()) => {
                self.release(freed);
                Status::Ok
            }
            Err(current) => {
                self.release(successor_capacity);
                let bug = Error::ReportableBug(format!(
                    "retired slot for key {:?} was unlinked by someone else, \
                     index now holds {:?}",
                    key, current
                ));
                log::error!("{}", bug);
                Status::Aborted
            }
        }
    }

    pub fn upsert(&self, ctx: &UpsertContext) -> Status {
        let backoff = Backoff::new();
        let size = ctx.value_size();
        loop {
            match self.index.get(ctx.key()) {
                None => {
                    if !self.reserve(size) {
                        return Status::OutOfMemory;
                    }
                    let slot = self.new_slot(size, |address| ctx.put(address));
                    let entry = Entry::Hot(slot);
                    match self.index.insert_if_absent(ctx.key(), entry) {
                        Ok(()) => return Status::Ok,
                        // lost the race to create the key, update the winner
                        Err(_) => self.release(size),
                    }
                }
                Some(Entry::Hot(slot)) => {
                    match ctx.put_atomic(&slot, &|n| self.reserve(n)) {
                        InPlace::Updated => return Status::Ok,
                        InPlace::NoSpace => return Status::OutOfMemory,
                        InPlace::Stale => backoff.snooze(),
                        InPlace::Retired(()) => {
                            let successor =
                                self.new_slot(size, |address| ctx.put(address));
                            return self.install(ctx.key(), slot, successor);
                        }
                    }
                }
                Some(cold @ Entry::Cold { .. }) => {
                    // blind write, the old record is never read
                    if !self.reserve(size) {
                        return Status::OutOfMemory;
                    }
                    let slot = self.new_slot(size, |address| ctx.put(address));
                    let entry = Entry::Hot(slot);
                    match self.index.replace(ctx.key(), &cold, entry) {
                        Ok(()) => return Status::Ok,
                        Err(_) => {
                            self.release(size);
                            backoff.snooze();
                        }
                    }
                }
            }
        }
    }

    pub fn read(&self, ctx: ReadContext) -> Outcome<ReadContext> {
        match self.index.get(ctx.key()) {
            None => Outcome::Done(ctx.not_found()),
            Some(Entry::Hot(slot)) => Outcome::Done(ctx.get(&slot)),
            Some(Entry::Cold { offset }) => Outcome::Pending { ctx, offset },
        }
    }

    /// Finishes a read parked on a cold record.
    pub fn complete_read(
        &self,
        ctx: ReadContext,
        fetched: io::Result<Vec<u8>>,
    ) -> Status {
        match fetched {
            Ok(value) => ctx.get_bytes(&value),
            Err(e) => {
                log::error!(
                    "failed to read cold record for {:?}: {:?}",
                    ctx.key(),
                    e
                );
                ctx.fail(Status::from(&e))
            }
        }
    }

    pub fn rmw(&self, mut ctx: RmwContext) -> Outcome<RmwContext> {
        match self.rmw_resolved(&mut ctx) {
            Ok(status) => Outcome::Done(status),
            Err(offset) => Outcome::Pending { ctx, offset },
        }
    }

    /// Runs an RMW against whatever the key resolves to. Returns the
    /// offset of the old value instead of a status when it is cold.
    fn rmw_resolved(
        &self,
        ctx: &mut RmwContext,
    ) -> std::result::Result<Status, u64> {
        let backoff = Backoff::new();
        loop {
            match self.index.get(ctx.key()) {
                None => {
                    let size = ctx.initial_value_size();
                    if !self.reserve(size) {
                        return Ok(Status::OutOfMemory);
                    }
                    let slot =
                        self.new_slot(size, |address| ctx.rmw_initial(address));
                    let entry = Entry::Hot(slot);
                    match self.index.insert_if_absent(ctx.key(), entry) {
                        Ok(()) => return Ok(Status::Ok),
                        Err(_) => self.release(size),
                    }
                }
                Some(Entry::Hot(slot)) => {
                    match ctx.rmw_atomic(&slot, &|n| self.reserve(n)) {
                        InPlace::Updated => return Ok(Status::Ok),
                        InPlace::NoSpace => return Ok(Status::OutOfMemory),
                        InPlace::Stale => backoff.snooze(),
                        InPlace::Retired((old, source)) => {
                            let size = ctx.value_size(&old, source);
                            let successor = self.new_slot(size, |address| {
                                ctx.rmw_copy(&old, source, address)
                            });
                            return Ok(self.install(ctx.key(), slot, successor));
                        }
                    }
                }
                Some(Entry::Cold { offset }) => return Err(offset),
            }
        }
    }

    /// Finishes an RMW parked on a cold record, merging into a new hot
    /// slot. If the key was written while the record was being fetched,
    /// the RMW starts over against the current value.
    pub fn complete_rmw(
        &self,
        mut ctx: RmwContext,
        offset: u64,
        fetched: io::Result<Vec<u8>>,
    ) -> Outcome<RmwContext> {
        let old = match fetched {
            Ok(old) => old,
            Err(e) => {
                log::error!(
                    "failed to read cold record for {:?}: {:?}",
                    ctx.key(),
                    e
                );
                return Outcome::Done(ctx.complete(Status::from(&e)));
            }
        };

        let source = PayloadId::Cold { offset };
        let size = ctx.value_size(&old, source);
        if !self.reserve(size) {
            return Outcome::Done(ctx.complete(Status::OutOfMemory));
        }
        let slot =
            self.new_slot(size, |address| ctx.rmw_copy(&old, source, address));
        let cold = Entry::Cold { offset };
        let installed = self.index.replace(ctx.key(), &cold, Entry::Hot(slot));
        if installed.is_ok() {
            return Outcome::Done(ctx.complete(Status::Ok));
        }

        self.release(size);
        log::trace!(
            "cold key {:?} changed during fetch, retrying rmw",
            ctx.key()
        );
        match self.rmw_resolved(&mut ctx) {
            Ok(status) => Outcome::Done(ctx.complete(status)),
            Err(offset) => Outcome::Pending { ctx, offset },
        }
    }

    /// Reads a cold record on the rayon pool and reports it to `tx`.
    pub fn issue_read(&self, offset: u64, id: u64, tx: Sender<IoCompletion>) {
        let device = self.device.clone();
        let log_token = *self.recovered_log.read();
        rayon::spawn(move || {
            let result = match log_token {
                Some(log_token) => device.read_record(log_token, offset),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no recovered log to read cold records from",
                )),
            };
            // the device must be released before the session can observe
            // the completion, or dropping the store right after
            // `complete_pending` could leave the directory locked.
            drop(device);
            // the session may have been dropped in the meantime
            let _ = tx.send(IoCompletion { id, result });
        });
    }

    pub fn start_session(self: &Arc<Self>) -> EngineSession<D> {
        let id = Uuid::new_v4();
        let shared = Arc::new(SessionShared::new(id, 0, true));
        self.sessions.lock().insert(id, shared.clone());
        log::debug!("started session {}", id);
        EngineSession::new(self.clone(), shared)
    }

    pub fn continue_session(
        self: &Arc<Self>,
        id: SessionId,
    ) -> Result<(EngineSession<D>, u64)> {
        let sessions = self.sessions.lock();
        let Some(shared) = sessions.get(&id).cloned() else {
            return Err(Error::UnknownSession(id));
        };
        drop(sessions);

        if !shared.activate() {
            return Err(Error::SessionInUse(id));
        }
        let serial = shared.serial();
        log::debug!("continued session {} at serial {}", id, serial);
        Ok((EngineSession::new(self.clone(), shared), serial))
    }

    pub fn size(&self) -> u64 {
        self.index.len()
    }

    pub fn grow_index<F: FnOnce(u64)>(&self, callback: F) -> bool {
        if self.index.table_size() >= 1 << 32 {
            log::warn!("refusing to grow index past {} buckets", 1_u64 << 32);
            return false;
        }
        let new_size = self.index.grow();
        log::debug!("grew index to {} buckets", new_size);
        callback(new_size);
        true
    }

    pub fn dump_distribution(&self) -> Vec<u64> {
        let histogram = self.index.distribution();
        log::info!(
            "index of {} keys over {} buckets",
            self.index.len(),
            self.index.table_size()
        );
        for (keys, buckets) in histogram.iter().enumerate() {
            if *buckets != 0 {
                log::info!("{:>8} buckets hold {} keys", buckets, keys);
            }
        }
        histogram
    }

    pub fn checkpoint(
        self: &Arc<Self>,
        on_persist: PersistCallback,
    ) -> CheckpointResult {
        if !self.device.is_durable() {
            log::warn!("refusing checkpoint of an in-memory store");
            return CheckpointResult::refused();
        }

        let mut running = self.checkpoint_thread.lock();
        if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
            log::warn!("refusing checkpoint while another one is running");
            return CheckpointResult::refused();
        }
        if let Some(finished) = running.take() {
            let _ = finished.join();
        }

        let token = Uuid::new_v4();
        let engine = self.clone();
        let spawned = thread::Builder::new()
            .name("genkv_checkpoint".into())
            .spawn(move || engine.run_checkpoint(token, on_persist));

        match spawned {
            Ok(handle) => {
                *running = Some(handle);
                log::debug!("started checkpoint {}", token);
                CheckpointResult { accepted: true, token }
            }
            Err(e) => {
                log::error!("failed to spawn checkpoint thread: {:?}", e);
                CheckpointResult::refused()
            }
        }
    }

    fn run_checkpoint(
        &self,
        token: Uuid,
        on_persist: PersistCallback,
    ) -> Status {
        // operations of the next version wait for the image, so the
        // captured serials describe exactly what it contains.
        let (version, (sessions, serials, image)) =
            self.versions.seal_with(|version| {
                let sessions: Vec<Arc<SessionShared>> =
                    self.sessions.lock().values().cloned().collect();
                let serials: Vec<(SessionId, u64)> =
                    sessions.iter().map(|s| (s.id, s.serial())).collect();
                let image = self.snapshot(version, serials.clone());
                (sessions, serials, image)
            });

        let status = match image {
            Ok(image) => match self.device.write_checkpoint(token, &image) {
                Ok(()) => Status::Ok,
                Err(e) => {
                    log::error!(
                        "failed to write checkpoint {}: {:?}",
                        token,
                        e
                    );
                    Status::from(&e)
                }
            },
            Err(e) => {
                log::error!("failed to snapshot checkpoint {}: {:?}", token, e);
                Status::from(&e)
            }
        };

        for (session, (_, serial)) in sessions.iter().zip(serials) {
            if session.is_active() {
                session.notify(Notice {
                    status,
                    serial,
                    callback: on_persist.clone(),
                });
            }
        }

        log::info!(
            "checkpoint {} of version {} finished with {}",
            token,
            version,
            status
        );
        status
    }

    fn snapshot(
        &self,
        version: NonZeroU64,
        sessions: Vec<(SessionId, u64)>,
    ) -> io::Result<CheckpointImage> {
        let log_token = *self.recovered_log.read();
        let entries = self.index.entries();
        let mut records = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let value = match entry {
                Entry::Hot(slot) => slot.read(),
                Entry::Cold { offset } => {
                    let Some(log_token) = log_token else {
                        return Err(io::Error::other(Error::ReportableBug(
                            "cold entry without a recovered log".into(),
                        )));
                    };
                    self.device.read_record(log_token, offset)?
                }
            };
            records.push((key, value));
        }

        Ok(CheckpointImage {
            version: version.get(),
            table_size: self.index.table_size(),
            sessions,
            records,
        })
    }

    /// Blocks until the running checkpoint, if any, has finished.
    pub fn wait_for_checkpoint(&self) -> Option<Status> {
        // held across the join so nothing else starts meanwhile
        let mut running = self.checkpoint_thread.lock();
        let handle = running.take()?;
        match handle.join() {
            Ok(status) => Some(status),
            Err(_) => {
                log::error!("checkpoint thread panicked");
                Some(Status::Aborted)
            }
        }
    }

    pub fn recover(
        &self,
        index_token: Uuid,
        log_token: Uuid,
    ) -> RecoveryResult {
        if !self.device.is_durable() {
            log::warn!("refusing recovery into an in-memory store");
            return RecoveryResult::failed(Status::Aborted);
        }

        let running = self.checkpoint_thread.lock();
        if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
            log::warn!("refusing recovery while a checkpoint is running");
            return RecoveryResult::failed(Status::Aborted);
        }

        let mut sessions = self.sessions.lock();
        if sessions.values().any(|s| s.is_active()) || self.index.len() != 0 {
            log::warn!("refusing recovery into a store that is in use");
            return RecoveryResult::failed(Status::Aborted);
        }

        let recovered = match self.device.recover(index_token, log_token) {
            Ok(recovered) => recovered,
            Err(e) => {
                log::error!(
                    "failed to recover checkpoint {}/{}: {:?}",
                    index_token,
                    log_token,
                    e
                );
                return RecoveryResult::failed(Status::from(&e));
            }
        };

        while self.index.table_size() < recovered.table_size {
            self.index.grow();
        }
        for (key, offset) in recovered.entries {
            let entry = Entry::Cold { offset };
            if self.index.insert_if_absent(&key, entry).is_err() {
                log::warn!(
                    "checkpoint {} lists key {:?} twice",
                    index_token,
                    key
                );
            }
        }
        *self.recovered_log.write() = Some(log_token);

        let mut session_ids = Vec::with_capacity(recovered.sessions.len());
        for (id, serial) in recovered.sessions {
            let shared = SessionShared::new(id, serial, false);
            sessions.insert(id, Arc::new(shared));
            session_ids.push(id);
        }
        drop(sessions);
        drop(running);

        if let Some(version) = NonZeroU64::new(recovered.version) {
            self.versions.advance_past(version);
        }

        log::info!(
            "recovered {} keys and {} sessions from checkpoint {} \
             at version {}, \
             continuing at version {}",
            self.index.len(),
            session_ids.len(),
            index_token,
            recovered.version,
            self.versions.current()
        );

        RecoveryResult {
            status: Status::Ok,
            version: recovered.version,
            session_ids,
        }
    }
}
