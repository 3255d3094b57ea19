use std::fmt;

/// The outcome of a single engine operation.
///
/// Capacity problems and lock conflicts never show up here: the engine
/// resolves them by relocating or retrying. Device failures are passed
/// through as `IoError` / `Corrupted` without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// The operation was parked; its callback runs from
    /// `Session::complete_pending`.
    Pending = 1,
    NotFound = 2,
    /// The store's log budget cannot hold the record.
    OutOfMemory = 3,
    IoError = 4,
    Corrupted = 5,
    Aborted = 6,
}

impl Status {
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Pending => "pending",
            Status::NotFound => "not found",
            Status::OutOfMemory => "out of memory",
            Status::IoError => "io error",
            Status::Corrupted => "corrupted",
            Status::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl From<&std::io::Error> for Status {
    fn from(e: &std::io::Error) -> Status {
        if e.kind() == std::io::ErrorKind::InvalidData {
            Status::Corrupted
        } else {
            Status::IoError
        }
    }
}

#[test]
fn status_codes_match_wire_values() {
    assert_eq!(Status::Ok as u8, 0);
    assert_eq!(Status::NotFound as u8, 2);
    assert_eq!(Status::Aborted as u8, 6);

    let invalid =
        std::io::Error::new(std::io::ErrorKind::InvalidData, "bad crc");
    assert_eq!(Status::from(&invalid), Status::Corrupted);
    let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    assert_eq!(Status::from(&missing), Status::IoError);
}
