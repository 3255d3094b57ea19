//! `genkv` is a concurrent key-value store of variable-length records.
//!
//! Each record version lives in a fixed-capacity slot guarded by a
//! generation lock: writers update a slot in place under the lock while
//! the new value fits, readers copy it optimistically and retry if a
//! writer got in between, and a value that outgrows its slot is moved to
//! a larger successor.
//!
//! Threads work through [`Session`]s. A store opened with a storage
//! path can take asynchronous checkpoints and recover from them; the
//! recovered sessions can be resumed with [`Store::continue_session`].
//!
//! ```
//! let store = genkv::Config::new().open().unwrap();
//! let mut session = store.start_session();
//!
//! assert!(session.upsert(b"a", b"1", 1).unwrap().is_ok());
//! session
//!     .read(b"b", 2, |value, status| {
//!         assert_eq!(status, genkv::Status::NotFound);
//!         assert!(value.is_none());
//!     })
//!     .unwrap();
//!
//! session.stop().unwrap();
//! ```
mod backoff;
mod config;
mod context;
mod device;
mod engine;
mod error;
mod gen_lock;
mod index;
mod record;
mod session;
mod status;
mod store;
mod version;

pub use crate::config::Config;
pub use crate::context::MergeFn;
pub use crate::engine::{CheckpointResult, RecoveryResult};
pub use crate::error::{Error, Result};
pub use crate::gen_lock::{GenLock, GenLockGuard, GenLockState, LockConflict};
pub use crate::record::{Slot, SlotWriter};
pub use crate::session::SessionState;
pub use crate::status::Status;
pub use crate::store::{Session, Store};

pub use inline_array::InlineArray;

/// Identifies a session across checkpoints and recovery.
pub type SessionId = uuid::Uuid;

/// Names a checkpoint's index and log files.
pub type CheckpointToken = uuid::Uuid;
