use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::context::{ReadContext, RmwContext, UpsertContext};
use crate::device::Device;
use crate::engine::{Engine, IoCompletion, Outcome, PersistCallback};
use crate::{Error, Result, SessionId, Status};

/// Lifecycle of a [`crate::Session`]. A session is `Active` from the
/// moment it is started or continued until it is stopped or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Active,
    Stopped,
}

/// A finished checkpoint, waiting for the session to observe it.
pub(crate) struct Notice {
    pub status: Status,
    pub serial: u64,
    pub callback: PersistCallback,
}

impl fmt::Debug for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notice")
            .field("status", &self.status)
            .field("serial", &self.serial)
            .finish()
    }
}

/// The part of a session the engine can see from other threads.
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub id: SessionId,
    serial: AtomicU64,
    active: AtomicBool,
    notices: Mutex<Vec<Notice>>,
}

impl SessionShared {
    pub fn new(id: SessionId, serial: u64, active: bool) -> SessionShared {
        SessionShared {
            id,
            serial: AtomicU64::new(serial),
            active: AtomicBool::new(active),
            notices: Mutex::default(),
        }
    }

    /// The highest serial number below which every operation of this
    /// session has completed.
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    fn publish(&self, serial: u64) {
        self.serial.store(serial, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Claims the session for a caller. Fails if it is already claimed.
    pub fn activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }

    fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock())
    }
}

/// An operation parked until its cold record has been read.
enum Parked {
    Read { ctx: ReadContext },
    Rmw { ctx: RmwContext, offset: u64, serial: u64 },
}

/// One thread's lease on an engine.
///
/// Every operation runs inside a version guard, so a checkpoint's drain
/// waits only for operations that are actually executing. Parked
/// operations hold no guard; they re-enter the engine when their record
/// arrives on `io_rx`.
///
/// The completed serial is published before the guard is released, so a
/// checkpoint captures exactly the serials whose effects it holds.
/// Mutations apply in serial order: a parked rmw is finished before the
/// next upsert or rmw of the same session runs.
pub(crate) struct EngineSession<D: Device> {
    engine: Arc<Engine<D>>,
    shared: Arc<SessionShared>,
    state: SessionState,
    ops: u64,
    serial: u64,
    parked: FnvHashMap<u64, Parked>,
    next_io_id: u64,
    io_tx: Sender<IoCompletion>,
    io_rx: Receiver<IoCompletion>,
}

impl<D: Device> fmt::Debug for EngineSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state)
            .field("serial", &self.serial)
            .field("pending", &self.parked.len())
            .finish()
    }
}

impl<D: Device> EngineSession<D> {
    pub fn new(
        engine: Arc<Engine<D>>,
        shared: Arc<SessionShared>,
    ) -> EngineSession<D> {
        let (io_tx, io_rx) = crossbeam_channel::unbounded();
        let serial = shared.serial();
        EngineSession {
            engine,
            shared,
            state: SessionState::Active,
            ops: 0,
            serial,
            parked: FnvHashMap::default(),
            next_io_id: 0,
            io_tx,
            io_rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The serial number of the last issued operation.
    pub fn serial_num(&self) -> u64 {
        self.serial
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(Error::SessionNotActive(self.shared.id))
        }
    }

    pub fn upsert(
        &mut self,
        ctx: UpsertContext,
        serial: u64,
    ) -> Result<Status> {
        self.ensure_active()?;
        self.finish_parked_rmws();
        let status = {
            let _guard = self.engine.versions.check_in();
            let status = self.engine.upsert(&ctx);
            self.record(serial);
            status
        };
        self.issued();
        Ok(status)
    }

    pub fn read(&mut self, ctx: ReadContext, serial: u64) -> Result<Status> {
        self.ensure_active()?;
        let status = {
            let _guard = self.engine.versions.check_in();
            let status = match self.engine.read(ctx) {
                Outcome::Done(status) => status,
                Outcome::Pending { ctx, offset } => {
                    self.park(offset, Parked::Read { ctx });
                    Status::Pending
                }
            };
            self.record(serial);
            status
        };
        self.issued();
        Ok(status)
    }

    pub fn rmw(&mut self, ctx: RmwContext, serial: u64) -> Result<Status> {
        self.ensure_active()?;
        self.finish_parked_rmws();
        let status = {
            let _guard = self.engine.versions.check_in();
            let status = match self.engine.rmw(ctx) {
                Outcome::Done(status) => status,
                Outcome::Pending { ctx, offset } => {
                    self.park(offset, Parked::Rmw { ctx, offset, serial });
                    Status::Pending
                }
            };
            self.record(serial);
            status
        };
        self.issued();
        Ok(status)
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.refresh_inner();
        Ok(())
    }

    /// Finishes parked operations whose records have arrived, or all of
    /// them when `wait` is set. Returns whether nothing is left pending.
    pub fn complete_pending(&mut self, wait: bool) -> Result<bool> {
        self.ensure_active()?;
        self.drain_completions(wait);
        self.refresh_inner();
        Ok(self.parked.is_empty())
    }

    /// Completes all outstanding work and gives up the session. Returns
    /// the serial number everything up to which has completed.
    pub fn stop(&mut self) -> Result<u64> {
        self.ensure_active()?;
        self.drain_completions(true);
        self.refresh_inner();
        self.shared.deactivate();
        self.state = SessionState::Stopped;
        let serial = self.shared.serial();
        log::debug!("stopped session {} at serial {}", self.shared.id, serial);
        Ok(serial)
    }

    /// Must be called under the guard the operation ran in.
    fn record(&mut self, serial: u64) {
        self.serial = serial;
        self.shared.publish(self.completed_serial());
    }

    fn issued(&mut self) {
        self.ops += 1;
        if self.ops % self.engine.config.refresh_interval == 0 {
            self.refresh_inner();
        }
        if self.ops % self.engine.config.complete_pending_interval == 0 {
            self.drain_completions(false);
        }
    }

    /// Every mutation up to this serial number has been applied, and none
    /// after it. Parked reads change nothing and do not hold it back.
    fn completed_serial(&self) -> u64 {
        let oldest_rmw = self
            .parked
            .values()
            .filter_map(|parked| match parked {
                Parked::Rmw { serial, .. } => Some(*serial),
                Parked::Read { .. } => None,
            })
            .min();
        match oldest_rmw {
            Some(oldest) => oldest.saturating_sub(1).min(self.serial),
            None => self.serial,
        }
    }

    fn refresh_inner(&mut self) {
        self.shared.publish(self.completed_serial());

        for notice in self.shared.take_notices() {
            log::trace!(
                "session {} observed checkpoint with {} at serial {}",
                self.shared.id,
                notice.status,
                notice.serial
            );
            let mut callback = notice.callback.lock();
            (&mut *callback)(notice.status, notice.serial);
        }

        self.drain_completions(false);
    }

    fn park(&mut self, offset: u64, parked: Parked) {
        let id = self.next_io_id;
        self.next_io_id += 1;
        self.engine.issue_read(offset, id, self.io_tx.clone());
        self.parked.insert(id, parked);
    }

    fn finish_parked_rmws(&mut self) {
        while self.parked.values().any(|p| matches!(p, Parked::Rmw { .. })) {
            match self.io_rx.recv() {
                Ok(completion) => self.finish(completion),
                Err(_) => break,
            }
        }
    }

    fn drain_completions(&mut self, wait: bool) -> bool {
        loop {
            let received = if wait && !self.parked.is_empty() {
                self.io_rx.recv().ok()
            } else {
                self.io_rx.try_recv().ok()
            };
            let Some(completion) = received else {
                break;
            };
            self.finish(completion);
        }
        self.parked.is_empty()
    }

    fn finish(&mut self, completion: IoCompletion) {
        let Some(parked) = self.parked.remove(&completion.id) else {
            log::warn!(
                "session {} received completion for unknown io {}",
                self.shared.id,
                completion.id
            );
            return;
        };

        let _guard = self.engine.versions.check_in();
        match parked {
            Parked::Read { ctx, .. } => {
                self.engine.complete_read(ctx, completion.result);
            }
            Parked::Rmw { ctx, offset, serial } => {
                match self.engine.complete_rmw(ctx, offset, completion.result) {
                    Outcome::Done(_) => {}
                    Outcome::Pending { ctx, offset } => {
                        self.park(offset, Parked::Rmw { ctx, offset, serial })
                    }
                }
            }
        }
        self.shared.publish(self.completed_serial());
    }
}

impl<D: Device> Drop for EngineSession<D> {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            if let Err(e) = self.stop() {
                log::error!(
                    "failed to stop session {} on drop: {:?}",
                    self.shared.id,
                    e
                );
            }
        }
    }
}
