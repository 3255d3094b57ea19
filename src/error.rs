use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::SessionId;

/// The top-level result type for setup and contract violations.
/// Per-operation outcomes are reported as [`crate::Status`].
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the ways a store or session can be misused
/// or fail to start.
#[derive(Debug)]
pub enum Error {
    /// An operation was issued on a session that is not `Active`.
    SessionNotActive(SessionId),
    /// `continue_session` was given an id this store has never seen.
    UnknownSession(SessionId),
    /// `continue_session` was given an id that is already active.
    SessionInUse(SessionId),
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An unexpected bug has happened.
    ReportableBug(String),
    /// A read or write error has happened when interacting with the file
    /// system.
    Io(io::Error),
    /// Corruption has been detected in a checkpoint file.
    Corruption {
        /// What was being read when the corruption was found.
        what: String,
    },
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            SessionNotActive(id) => SessionNotActive(*id),
            UnknownSession(id) => UnknownSession(*id),
            SessionInUse(id) => SessionInUse(*id),
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
            Corruption { what } => Corruption { what: what.clone() },
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (SessionNotActive(l), SessionNotActive(r)) => l == r,
            (UnknownSession(l), UnknownSession(r)) => l == r,
            (SessionInUse(l), SessionInUse(r)) => l == r,
            (Unsupported(l), Unsupported(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (Corruption { what: l }, Corruption { what: r }) => l == r,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        if io_error.kind() == io::ErrorKind::InvalidData {
            Error::Corruption { what: io_error.to_string() }
        } else {
            Error::Io(io_error)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;

        match *self {
            SessionNotActive(ref id) => {
                write!(f, "Session {} is not active", id)
            }
            UnknownSession(ref id) => {
                write!(f, "Session {} is not known to this store", id)
            }
            SessionInUse(ref id) => {
                write!(f, "Session {} is already active", id)
            }
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { ref what } => {
                write!(f, "Read corrupted data: {}", what)
            }
        }
    }
}

#[test]
fn invalid_data_becomes_corruption() {
    let e: Error =
        io::Error::new(io::ErrorKind::InvalidData, "crc mismatch").into();
    assert!(matches!(e, Error::Corruption { .. }));

    let e: Error = io::Error::new(io::ErrorKind::Other, "disk on fire").into();
    assert!(matches!(e, Error::Io(_)));
    assert_ne!(e.clone(), e);
}
