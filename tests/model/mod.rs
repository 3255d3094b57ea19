use std::collections::HashMap;
use std::fmt;

use quickcheck::{Arbitrary, Gen};

use genkv::{Config, Status};

use super::common::{add_bytes, read_now};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key(pub Vec<u8>);

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.0)
    }
}

fn range(g: &mut Gen, min_inclusive: usize, max_exclusive: usize) -> usize {
    assert!(max_exclusive > min_inclusive);
    let range = max_exclusive - min_inclusive;
    let generated = usize::arbitrary(g) % range;
    min_inclusive + generated
}

impl Arbitrary for Key {
    fn arbitrary(g: &mut Gen) -> Self {
        // a small key space, so that operations keep hitting the same
        // records
        let len = range(g, 1, 3);
        Key((0..len).map(|_| range(g, 0, 4) as u8).collect())
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        Box::new(
            (1..self.0.len()).rev().map({
                let inner = self.0.clone();
                move |len| Key(inner[..len].to_vec())
            }),
        )
    }
}

#[derive(Debug, Clone)]
pub enum Op {
    Upsert(Key, Vec<u8>),
    Rmw(Key, u8),
    Read(Key),
    Restart,
}

use self::Op::*;

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        if range(g, 0, 12) == 0 {
            return Restart;
        }

        match range(g, 0, 3) {
            0 => {
                let len = range(g, 0, 48);
                let value = (0..len).map(|_| u8::arbitrary(g)).collect();
                Upsert(Key::arbitrary(g), value)
            }
            1 => Rmw(Key::arbitrary(g), u8::arbitrary(g)),
            2 => Read(Key::arbitrary(g)),
            _ => panic!("impossible choice"),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        match self {
            Upsert(k, v) => {
                let v = v.clone();
                Box::new(k.shrink().map(move |k| Upsert(k, v.clone())))
            }
            Rmw(k, delta) => {
                let delta = *delta;
                Box::new(k.shrink().map(move |k| Rmw(k, delta)))
            }
            Read(k) => Box::new(k.shrink().map(Read)),
            Restart => Box::new(vec![].into_iter()),
        }
    }
}

fn merged(old: Option<&Vec<u8>>, delta: u8) -> Vec<u8> {
    let old = old.map(Vec::as_slice).unwrap_or(&[]);
    let mut dst = vec![0; add_bytes(old, &[delta], None)];
    add_bytes(old, &[delta], Some(&mut dst));
    dst
}

pub fn prop_store_matches_model(ops: Vec<Op>) -> bool {
    super::common::setup_logger();

    let dir = tempdir::TempDir::new("genkv_model").unwrap();
    let config = Config::new()
        .table_size(2)
        .refresh_interval(4)
        .complete_pending_interval(8)
        .path(Some(dir.path().to_owned()));

    let mut store = config.open().unwrap();
    let mut session = store.start_session();
    let mut reference: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut serial = 0;

    for op in ops {
        match op {
            Upsert(k, v) => {
                serial += 1;
                assert_eq!(
                    session.upsert(&k.0, &v, serial).unwrap(),
                    Status::Ok
                );
                reference.insert(k.0, v);
            }
            Rmw(k, delta) => {
                serial += 1;
                match session.rmw(&k.0, [delta], add_bytes, serial).unwrap() {
                    Status::Ok => {}
                    Status::Pending => {
                        assert!(session.complete_pending(true).unwrap())
                    }
                    other => panic!("rmw of {:?} returned {}", k, other),
                }
                let new = merged(reference.get(&k.0), delta);
                reference.insert(k.0, new);
            }
            Read(k) => {
                serial += 1;
                let expected = match reference.get(&k.0) {
                    Some(v) => (Some(v.clone()), Status::Ok),
                    None => (None, Status::NotFound),
                };
                assert_eq!(
                    read_now(&mut session, &k.0, serial),
                    expected,
                    "read of {:?} disagrees with the model",
                    k
                );
            }
            Restart => {
                session.refresh().unwrap();
                let result = store
                    .checkpoint(|status, _| assert_eq!(status, Status::Ok));
                assert!(result.accepted);
                assert_eq!(store.wait_for_checkpoint(), Some(Status::Ok));

                let id = session.id();
                drop(session);
                drop(store);

                store = config.open().unwrap();
                let recovered = store.recover(result.token, result.token);
                assert_eq!(recovered.status, Status::Ok);
                assert_eq!(recovered.session_ids, vec![id]);
                assert_eq!(store.size(), reference.len() as u64);

                let (resumed, durable) = store.continue_session(id).unwrap();
                assert_eq!(durable, serial);
                session = resumed;
            }
        }
    }

    true
}
