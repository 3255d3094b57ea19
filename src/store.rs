use std::sync::Arc;

use inline_array::InlineArray;
use parking_lot::Mutex;

use crate::context::{ReadContext, RmwContext, UpsertContext};
use crate::device::{FileDisk, NullDisk};
use crate::engine::{CheckpointResult, Engine, PersistCallback, RecoveryResult};
use crate::session::{EngineSession, SessionState};
use crate::{CheckpointToken, Config, Result, SessionId, Status};

enum Backend {
    Memory(Arc<Engine<NullDisk>>),
    File(Arc<Engine<FileDisk>>),
}

macro_rules! dispatch {
    ($backend:expr, $engine:ident => $body:expr) => {
        match $backend {
            Backend::Memory($engine) => $body,
            Backend::File($engine) => $body,
        }
    };
}

/// A key-value store of variable-length records.
///
/// Opened with a storage path, the store can checkpoint to and recover
/// from that directory. Without one it lives purely in memory and
/// refuses both.
///
/// ```
/// let store = genkv::Config::new().table_size(128).open().unwrap();
/// let mut session = store.start_session();
///
/// session.upsert(b"k", [0x2A_u8], 1).unwrap();
/// session
///     .rmw(b"k", [10_u8], |old: &[u8], delta: &[u8], dst: Option<&mut [u8]>| {
///         if let Some(dst) = dst {
///             for (i, byte) in dst.iter_mut().enumerate() {
///                 *byte = old.get(i).copied().unwrap_or(0)
///                     .wrapping_add(delta.get(i).copied().unwrap_or(0));
///             }
///         }
///         old.len().max(delta.len())
///     }, 2)
///     .unwrap();
/// session
///     .read(b"k", 3, |value, status| {
///         assert!(status.is_ok());
///         assert_eq!(value, Some(&[0x34][..]));
///     })
///     .unwrap();
/// ```
pub struct Store {
    inner: Backend,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("durable", &self.is_durable())
            .field("size", &self.size())
            .finish()
    }
}

impl Store {
    pub fn open(config: Config) -> Result<Store> {
        config.validate()?;
        let inner = match config.path.clone() {
            Some(path) => {
                let disk = FileDisk::open(&path)?;
                Backend::File(Arc::new(Engine::new(config, disk)))
            }
            None => Backend::Memory(Arc::new(Engine::new(config, NullDisk))),
        };
        Ok(Store { inner })
    }

    /// Whether this store can checkpoint and recover.
    pub fn is_durable(&self) -> bool {
        dispatch!(&self.inner, engine => engine.is_durable())
    }

    pub fn start_session(&self) -> Session {
        let inner = match &self.inner {
            Backend::Memory(engine) => {
                SessionBackend::Memory(engine.start_session())
            }
            Backend::File(engine) => {
                SessionBackend::File(engine.start_session())
            }
        };
        Session { inner }
    }

    /// Resumes a stopped or recovered session. Returns it together with
    /// the serial number up to which its operations are known complete.
    pub fn continue_session(&self, id: SessionId) -> Result<(Session, u64)> {
        let (inner, serial) = match &self.inner {
            Backend::Memory(engine) => {
                let (session, serial) = engine.continue_session(id)?;
                (SessionBackend::Memory(session), serial)
            }
            Backend::File(engine) => {
                let (session, serial) = engine.continue_session(id)?;
                (SessionBackend::File(session), serial)
            }
        };
        Ok((Session { inner }, serial))
    }

    /// Starts a checkpoint in the background. `on_persist` is called from
    /// each active session's next refresh once the checkpoint finished,
    /// with its status and that session's durable serial number.
    pub fn checkpoint<F>(&self, on_persist: F) -> CheckpointResult
    where
        F: FnMut(Status, u64) + Send + 'static,
    {
        let callback: PersistCallback = Arc::new(Mutex::new(on_persist));
        dispatch!(&self.inner, engine => engine.checkpoint(callback))
    }

    /// Blocks until the running checkpoint has finished and returns its
    /// status, or `None` if no checkpoint was started since the last call.
    pub fn wait_for_checkpoint(&self) -> Option<Status> {
        dispatch!(&self.inner, engine => engine.wait_for_checkpoint())
    }

    /// Loads a checkpoint into an empty store. The recovered keys are
    /// read lazily from the checkpoint log.
    pub fn recover(
        &self,
        index_token: CheckpointToken,
        log_token: CheckpointToken,
    ) -> RecoveryResult {
        dispatch!(&self.inner, engine => engine.recover(index_token, log_token))
    }

    /// Number of keys.
    pub fn size(&self) -> u64 {
        dispatch!(&self.inner, engine => engine.size())
    }

    /// Doubles the index. `callback` receives the new table size.
    pub fn grow_index<F: FnOnce(u64)>(&self, callback: F) -> bool {
        dispatch!(&self.inner, engine => engine.grow_index(callback))
    }

    /// Logs and returns how many buckets hold each number of keys.
    pub fn dump_distribution(&self) -> Vec<u64> {
        dispatch!(&self.inner, engine => engine.dump_distribution())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(status) = self.wait_for_checkpoint() {
            log::debug!(
                "checkpoint finished with {} while closing store",
                status
            );
        }
    }
}

enum SessionBackend {
    Memory(EngineSession<NullDisk>),
    File(EngineSession<FileDisk>),
}

macro_rules! dispatch_session {
    ($backend:expr, $session:ident => $body:expr) => {
        match $backend {
            SessionBackend::Memory($session) => $body,
            SessionBackend::File($session) => $body,
        }
    };
}

/// A thread's handle for issuing operations against a [`Store`].
///
/// Operations carry caller-chosen, increasing serial numbers. Reads and
/// RMWs of keys recovered from a checkpoint return `Status::Pending`
/// and finish from `complete_pending`, `refresh`, or `stop`. Upserts and
/// RMWs apply in serial order, so one issued while an RMW of this session
/// is pending waits for it first. Dropping an active session stops it.
pub struct Session {
    inner: SessionBackend,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        dispatch_session!(
            &self.inner,
            session => std::fmt::Debug::fmt(session, f)
        )
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        dispatch_session!(&self.inner, session => session.id())
    }

    pub fn state(&self) -> SessionState {
        dispatch_session!(&self.inner, session => session.state())
    }

    /// Serial number of the last issued operation.
    pub fn serial_num(&self) -> u64 {
        dispatch_session!(&self.inner, session => session.serial_num())
    }

    pub fn upsert<K, V>(
        &mut self,
        key: K,
        value: V,
        serial: u64,
    ) -> Result<Status>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let ctx = UpsertContext::new(
            InlineArray::from(key.as_ref()),
            InlineArray::from(value.as_ref()),
        );
        dispatch_session!(
            &mut self.inner,
            session => session.upsert(ctx, serial)
        )
    }

    /// Merges `delta` into the key's value with `merge`. A missing key
    /// takes `delta` verbatim.
    ///
    /// `merge(old, delta, dst)` returns the merged length; with
    /// `Some(dst)` it also writes the merged bytes into `dst`.
    pub fn rmw<K, D, F>(
        &mut self,
        key: K,
        delta: D,
        merge: F,
        serial: u64,
    ) -> Result<Status>
    where
        K: AsRef<[u8]>,
        D: AsRef<[u8]>,
        F: Fn(&[u8], &[u8], Option<&mut [u8]>) -> usize + 'static,
    {
        let ctx = RmwContext::new(
            InlineArray::from(key.as_ref()),
            InlineArray::from(delta.as_ref()),
            Box::new(merge),
            None,
        );
        dispatch_session!(&mut self.inner, session => session.rmw(ctx, serial))
    }

    /// Like [`Session::rmw`], calling `on_complete` with the final status
    /// if the operation went pending.
    pub fn rmw_with_callback<K, D, F, C>(
        &mut self,
        key: K,
        delta: D,
        merge: F,
        serial: u64,
        on_complete: C,
    ) -> Result<Status>
    where
        K: AsRef<[u8]>,
        D: AsRef<[u8]>,
        F: Fn(&[u8], &[u8], Option<&mut [u8]>) -> usize + 'static,
        C: FnOnce(Status) + 'static,
    {
        let ctx = RmwContext::new(
            InlineArray::from(key.as_ref()),
            InlineArray::from(delta.as_ref()),
            Box::new(merge),
            Some(Box::new(on_complete)),
        );
        dispatch_session!(&mut self.inner, session => session.rmw(ctx, serial))
    }

    /// Reads a key. `on_complete` is called exactly once, with `None` and
    /// `Status::NotFound` for a missing key.
    pub fn read<K, F>(
        &mut self,
        key: K,
        serial: u64,
        on_complete: F,
    ) -> Result<Status>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Option<&[u8]>, Status) + 'static,
    {
        let ctx = ReadContext::new(
            InlineArray::from(key.as_ref()),
            Box::new(on_complete),
        );
        dispatch_session!(&mut self.inner, session => session.read(ctx, serial))
    }

    /// Publishes progress, runs persistence callbacks of finished
    /// checkpoints, and finishes any pending operations whose records
    /// have arrived.
    pub fn refresh(&mut self) -> Result<()> {
        dispatch_session!(&mut self.inner, session => session.refresh())
    }

    /// Returns whether nothing is left pending. With `wait`, blocks until
    /// that is the case.
    pub fn complete_pending(&mut self, wait: bool) -> Result<bool> {
        dispatch_session!(
            &mut self.inner,
            session => session.complete_pending(wait)
        )
    }

    /// Finishes all pending work and ends the session. Returns the
    /// serial number up to which every operation has completed.
    pub fn stop(&mut self) -> Result<u64> {
        dispatch_session!(&mut self.inner, session => session.stop())
    }
}
