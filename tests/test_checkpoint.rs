mod common;

use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use genkv::{CheckpointToken, Config, SessionState, Status, Store};

use common::{add_bytes, read, read_now};

const N_KEYS: u64 = 100;

fn open(path: &Path) -> Store {
    Config::new().table_size(16).path(Some(path.to_owned())).open().unwrap()
}

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn value(i: u64) -> Vec<u8> {
    vec![i as u8; 1 + (i as usize % 17)]
}

/// Takes a checkpoint and waits for it, returning its token and what the
/// persistence callback reported to `session`.
fn checkpoint(
    store: &Store,
    session: &mut genkv::Session,
) -> (CheckpointToken, Vec<(Status, u64)>) {
    let persisted = Arc::new(Mutex::new(vec![]));
    let sink = persisted.clone();
    let result = store.checkpoint(move |status, serial| {
        sink.lock().unwrap().push((status, serial));
    });
    assert!(result.accepted);
    assert!(!result.token.is_nil());
    assert_eq!(store.wait_for_checkpoint(), Some(Status::Ok));

    session.refresh().unwrap();
    let reported = persisted.lock().unwrap().clone();
    (result.token, reported)
}

#[test]
fn checkpoint_and_recover_round_trip() {
    common::setup_logger();

    let dir = tempdir::TempDir::new("genkv_round_trip").unwrap();

    let (token, session_id) = {
        let store = open(dir.path());
        assert!(store.is_durable());
        let mut session = store.start_session();
        for i in 0..N_KEYS {
            assert_eq!(
                session.upsert(key(i), value(i), i + 1).unwrap(),
                Status::Ok
            );
        }
        let (token, reported) = checkpoint(&store, &mut session);
        assert_eq!(reported, vec![(Status::Ok, N_KEYS)]);

        // observed once only
        session.refresh().unwrap();
        (token, session.id())
    };

    let store = open(dir.path());
    let recovered = store.recover(token, token);
    assert_eq!(recovered.status, Status::Ok);
    assert_eq!(recovered.version, 1);
    assert_eq!(recovered.session_ids, vec![session_id]);
    assert_eq!(store.size(), N_KEYS);

    let (mut session, serial) = store.continue_session(session_id).unwrap();
    assert_eq!(serial, N_KEYS);
    assert_eq!(session.state(), SessionState::Active);

    // recovered values are fetched from the checkpoint log
    let (status, result) = read(&mut session, &key(3), serial + 1);
    assert_eq!(status, Status::Pending);
    assert!(session.complete_pending(true).unwrap());
    assert_eq!(result.borrow_mut().take(), Some((Some(value(3)), Status::Ok)));

    // rmw of a cold key parks until its old value is read
    let completed = Rc::new(Cell::new(None));
    let sink = completed.clone();
    let on_complete = move |status: Status| sink.set(Some(status));
    let status = session
        .rmw_with_callback(key(5), [1_u8], add_bytes, serial + 2, on_complete)
        .unwrap();
    assert_eq!(status, Status::Pending);
    assert!(session.complete_pending(true).unwrap());
    assert_eq!(completed.get(), Some(Status::Ok));
    let mut expected = value(5);
    expected[0] += 1;
    assert_eq!(
        read_now(&mut session, &key(5), serial + 3),
        (Some(expected.clone()), Status::Ok)
    );

    // upserts of cold keys are blind and never park
    assert_eq!(session.upsert(key(7), b"hot", serial + 4).unwrap(), Status::Ok);
    assert_eq!(
        read_now(&mut session, &key(7), serial + 5),
        (Some(b"hot".to_vec()), Status::Ok)
    );

    // a missing key is still answered synchronously
    assert_eq!(
        read_now(&mut session, &key(N_KEYS + 1), serial + 6),
        (None, Status::NotFound)
    );

    // a second checkpoint mixes hot slots with records of the first log
    session.refresh().unwrap();
    let (second, reported) = checkpoint(&store, &mut session);
    assert_eq!(reported, vec![(Status::Ok, serial + 6)]);
    drop(session);
    drop(store);

    let store = open(dir.path());
    let recovered = store.recover(second, second);
    assert_eq!(recovered.status, Status::Ok);
    assert_eq!(recovered.version, 2);
    assert_eq!(store.size(), N_KEYS);

    let (mut session, serial) = store.continue_session(session_id).unwrap();
    assert_eq!(serial, N_KEYS + 6);
    for i in 0..N_KEYS {
        let expected = match i {
            5 => expected.clone(),
            7 => b"hot".to_vec(),
            _ => value(i),
        };
        assert_eq!(
            read_now(&mut session, &key(i), serial + 1 + i),
            (Some(expected), Status::Ok),
            "key {}",
            i
        );
    }
}

#[test]
fn durable_serial_matches_checkpoint_contents() {
    common::setup_logger();

    let dir = tempdir::TempDir::new("genkv_durable_serial").unwrap();

    let (token, session_id) = {
        let store = open(dir.path());
        let mut session = store.start_session();
        // fewer operations than the refresh interval, so only the
        // operations themselves publish progress
        for serial in 1..=10 {
            assert_eq!(
                session.rmw(b"c", [1_u8], add_bytes, serial).unwrap(),
                Status::Ok
            );
        }
        let result = store.checkpoint(|_, _| {});
        assert!(result.accepted);
        assert_eq!(store.wait_for_checkpoint(), Some(Status::Ok));

        for serial in 11..=15 {
            assert_eq!(
                session.rmw(b"c", [1_u8], add_bytes, serial).unwrap(),
                Status::Ok
            );
        }
        (result.token, session.id())
    };

    let store = open(dir.path());
    assert_eq!(store.recover(token, token).status, Status::Ok);
    let (mut session, durable) = store.continue_session(session_id).unwrap();
    assert_eq!(durable, 10);

    // replaying everything after the durable serial restores the value
    for serial in durable + 1..=15 {
        match session.rmw(b"c", [1_u8], add_bytes, serial).unwrap() {
            Status::Ok => {}
            Status::Pending => assert!(session.complete_pending(true).unwrap()),
            other => panic!("unexpected rmw status {:?}", other),
        }
    }
    assert_eq!(read_now(&mut session, b"c", 16), (Some(vec![15]), Status::Ok));
}

#[test]
fn mutations_wait_for_a_pending_rmw() {
    let dir = tempdir::TempDir::new("genkv_rmw_order").unwrap();
    let token = {
        let store = open(dir.path());
        let mut session = store.start_session();
        session.upsert(key(1), value(1), 1).unwrap();
        checkpoint(&store, &mut session).0
    };

    let store = open(dir.path());
    assert_eq!(store.recover(token, token).status, Status::Ok);
    let mut session = store.start_session();

    let completed = Rc::new(Cell::new(None));
    let sink = completed.clone();
    let status = session
        .rmw_with_callback(key(1), [1_u8], add_bytes, 1, move |status| {
            sink.set(Some(status))
        })
        .unwrap();
    assert_eq!(status, Status::Pending);
    assert_eq!(completed.get(), None);

    // the later upsert lands after the rmw, not underneath it
    assert_eq!(session.upsert(key(1), b"last", 2).unwrap(), Status::Ok);
    assert_eq!(completed.get(), Some(Status::Ok));
    assert_eq!(
        read_now(&mut session, &key(1), 3),
        (Some(b"last".to_vec()), Status::Ok)
    );
    assert_eq!(session.stop().unwrap(), 3);
}

#[test]
fn many_pending_reads_complete_together() {
    let dir = tempdir::TempDir::new("genkv_pending").unwrap();
    let token = {
        let store = open(dir.path());
        let mut session = store.start_session();
        for i in 0..N_KEYS {
            session.upsert(key(i), value(i), i + 1).unwrap();
        }
        checkpoint(&store, &mut session).0
    };

    let store = open(dir.path());
    assert_eq!(store.recover(token, token).status, Status::Ok);
    let mut session = store.start_session();

    let mut results = vec![];
    for i in 0..N_KEYS {
        let (status, result) = read(&mut session, &key(i), i + 1);
        assert_eq!(status, Status::Pending);
        results.push(result);
    }
    assert!(session.complete_pending(true).unwrap());

    for (i, result) in results.into_iter().enumerate() {
        let i = i as u64;
        assert_eq!(
            result.borrow_mut().take(),
            Some((Some(value(i)), Status::Ok))
        );
    }

    // stopping waits for anything still outstanding
    let (status, result) = read(&mut session, &key(0), N_KEYS + 1);
    assert_eq!(status, Status::Pending);
    assert_eq!(session.stop().unwrap(), N_KEYS + 1);
    assert_eq!(result.borrow_mut().take(), Some((Some(value(0)), Status::Ok)));
}

#[test]
fn recovery_requires_an_idle_empty_store() {
    let dir = tempdir::TempDir::new("genkv_recover_busy").unwrap();
    let store = open(dir.path());
    let mut session = store.start_session();
    session.upsert(b"k", b"v", 1).unwrap();
    let (token, _) = checkpoint(&store, &mut session);

    // active session and keys present
    assert_eq!(store.recover(token, token).status, Status::Aborted);
    session.stop().unwrap();
    // keys present
    assert_eq!(store.recover(token, token).status, Status::Aborted);
    drop(session);
    drop(store);

    let store = open(dir.path());
    let _session = store.start_session();
    assert_eq!(store.recover(token, token).status, Status::Aborted);
}

#[test]
fn unknown_checkpoint_is_an_io_error() {
    let dir = tempdir::TempDir::new("genkv_recover_missing").unwrap();
    let store = open(dir.path());
    let missing = CheckpointToken::new_v4();
    let recovered = store.recover(missing, missing);
    assert_eq!(recovered.status, Status::IoError);
    assert!(recovered.session_ids.is_empty());
    assert_eq!(store.size(), 0);
}

#[test]
fn corrupted_log_records_are_reported() {
    let dir = tempdir::TempDir::new("genkv_corrupt_log").unwrap();
    let token = {
        let store = open(dir.path());
        let mut session = store.start_session();
        for i in 0..N_KEYS {
            session.upsert(key(i), value(i), i + 1).unwrap();
        }
        checkpoint(&store, &mut session).0
    };

    // flip the first value byte of the first record in the log
    let log = dir
        .path()
        .join("checkpoints")
        .join(token.to_string())
        .join("log.snapshot");
    let mut bytes = fs::read(&log).unwrap();
    bytes[12] ^= 0xFF;
    fs::write(&log, bytes).unwrap();

    let store = open(dir.path());
    assert_eq!(store.recover(token, token).status, Status::Ok);
    let mut session = store.start_session();

    let mut corrupted = vec![];
    for i in 0..N_KEYS {
        match read_now(&mut session, &key(i), i + 1) {
            (Some(v), Status::Ok) => assert_eq!(v, value(i)),
            (None, Status::Corrupted) => corrupted.push(i),
            other => panic!("unexpected read result {:?} for key {}", other, i),
        }
    }
    assert_eq!(corrupted.len(), 1);

    let completed = Rc::new(Cell::new(None));
    let sink = completed.clone();
    let on_complete = move |status: Status| sink.set(Some(status));
    let status = session
        .rmw_with_callback(
            key(corrupted[0]),
            [1_u8],
            add_bytes,
            N_KEYS + 1,
            on_complete,
        )
        .unwrap();
    assert_eq!(status, Status::Pending);
    assert!(session.complete_pending(true).unwrap());
    assert_eq!(completed.get(), Some(Status::Corrupted));
}

#[test]
fn corrupted_index_fails_recovery() {
    let dir = tempdir::TempDir::new("genkv_corrupt_index").unwrap();
    let token = {
        let store = open(dir.path());
        let mut session = store.start_session();
        session.upsert(b"k", b"v", 1).unwrap();
        checkpoint(&store, &mut session).0
    };

    let index = dir
        .path()
        .join("checkpoints")
        .join(token.to_string())
        .join("index.snapshot");
    let mut bytes = fs::read(&index).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&index, bytes).unwrap();

    let store = open(dir.path());
    assert_eq!(store.recover(token, token).status, Status::Corrupted);
    assert_eq!(store.size(), 0);
}

#[test]
fn storage_directory_is_exclusive() {
    let dir = tempdir::TempDir::new("genkv_exclusive").unwrap();
    let store = open(dir.path());
    assert!(matches!(
        Config::new().path(Some(dir.path().to_owned())).open(),
        Err(genkv::Error::Io(_))
    ));
    drop(store);
    let _reopened = open(dir.path());
}
