use std::cell::RefCell;
use std::rc::Rc;

use genkv::{Session, Status};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("unknown"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// Adds `delta` to `old` byte by byte, the longer input deciding the
/// length of the result.
#[allow(dead_code)]
pub fn add_bytes(old: &[u8], delta: &[u8], dst: Option<&mut [u8]>) -> usize {
    let len = old.len().max(delta.len());
    if let Some(dst) = dst {
        for (i, byte) in dst.iter_mut().enumerate() {
            let a = old.get(i).copied().unwrap_or(0);
            let b = delta.get(i).copied().unwrap_or(0);
            *byte = a.wrapping_add(b);
        }
    }
    len
}

/// What a read callback received.
#[allow(dead_code)]
pub type ReadResult = Rc<RefCell<Option<(Option<Vec<u8>>, Status)>>>;

/// Issues a read whose callback records its arguments.
#[allow(dead_code)]
pub fn read(
    session: &mut Session,
    key: &[u8],
    serial: u64,
) -> (Status, ReadResult) {
    let result: ReadResult = Rc::default();
    let slot = result.clone();
    let status = session
        .read(key, serial, move |value, status| {
            let previous =
                slot.borrow_mut().replace((value.map(<[u8]>::to_vec), status));
            assert!(previous.is_none(), "read callback invoked twice");
        })
        .unwrap();
    (status, result)
}

/// Reads a key, waiting for the record if it has to be fetched.
#[allow(dead_code)]
pub fn read_now(
    session: &mut Session,
    key: &[u8],
    serial: u64,
) -> (Option<Vec<u8>>, Status) {
    let (status, result) = read(session, key, serial);
    if status == Status::Pending {
        assert!(session.complete_pending(true).unwrap());
    }
    let ret = result.borrow_mut().take();
    ret.expect("read callback was never invoked")
}
