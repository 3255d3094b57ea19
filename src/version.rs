use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

const SEAL_BIT: u64 = 1 << 63;
const SEAL_MASK: u64 = u64::MAX - SEAL_BIT;

/// Fires once every operation checked in to a sealed version has
/// finished.
#[derive(Clone, Debug)]
pub(crate) struct Drained {
    mu: Arc<Mutex<bool>>,
    cv: Arc<Condvar>,
    version: NonZeroU64,
}

impl Drained {
    fn new(version: NonZeroU64) -> Drained {
        Drained { mu: Default::default(), cv: Default::default(), version }
    }

    pub fn wait(self) -> NonZeroU64 {
        let mut mu = self.mu.lock();
        while !*mu {
            self.cv.wait(&mut mu);
        }

        self.version
    }

    fn mark(&self) {
        let mut mu = self.mu.lock();
        log::trace!("version {} drained", self.version);
        *mu = true;
        drop(mu);
        self.cv.notify_all();
    }
}

#[derive(Debug)]
struct VersionTracker {
    version: NonZeroU64,
    rc: AtomicU64,
    drained: Drained,
}

impl VersionTracker {
    fn new(version: NonZeroU64) -> VersionTracker {
        VersionTracker {
            version,
            rc: AtomicU64::new(0),
            drained: Drained::new(version),
        }
    }
}

/// Held for the synchronous part of every operation. Keeps the version
/// it was taken in from draining.
#[derive(Debug)]
pub(crate) struct VersionGuard {
    tracker: Arc<VersionTracker>,
}

impl VersionGuard {
    pub fn version(&self) -> NonZeroU64 {
        self.tracker.version
    }
}

impl Drop for VersionGuard {
    fn drop(&mut self) {
        let rc = self.tracker.rc.fetch_sub(1, Ordering::AcqRel) - 1;
        if rc == SEAL_BIT {
            self.tracker.drained.mark();
        }
    }
}

/// The store's monotonically increasing version. A checkpoint seals the
/// current version, waits for it to drain, and persists the result under
/// that version number.
#[derive(Debug)]
pub(crate) struct Versions {
    current: RwLock<Arc<VersionTracker>>,
}

impl Default for Versions {
    fn default() -> Versions {
        Versions::starting_at(NonZeroU64::MIN)
    }
}

impl Versions {
    pub fn starting_at(version: NonZeroU64) -> Versions {
        Versions {
            current: RwLock::new(Arc::new(VersionTracker::new(version))),
        }
    }

    pub fn current(&self) -> NonZeroU64 {
        self.current.read().version
    }

    pub fn check_in(&self) -> VersionGuard {
        let current = self.current.read();
        // the increment happens under the read lock, so a concurrent seal
        // either sees it or happens strictly before it.
        let last = current.rc.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(last & SEAL_BIT, 0, "checked in to a sealed version");
        VersionGuard { tracker: current.clone() }
    }

    /// Moves the current version forward to at least `version`, used when
    /// recovering a checkpoint taken at an older version. Operations
    /// checked in to the replaced version are not waited for.
    pub fn advance_past(&self, version: NonZeroU64) {
        let mut current = self.current.write();
        if current.version > version {
            return;
        }
        let Some(next) = version.checked_add(1) else {
            return;
        };
        *current = Arc::new(VersionTracker::new(next));
    }

    /// Seals the current version, waits for it to drain, and runs `f`
    /// before any operation can check in to the next version. Returns the
    /// sealed version together with what `f` returned.
    pub fn seal_with<T>(
        &self,
        f: impl FnOnce(NonZeroU64) -> T,
    ) -> (NonZeroU64, T) {
        let mut current = self.current.write();
        let sealed_version = current.version;
        let next = NonZeroU64::new(sealed_version.get() + 1)
            .expect("version counter overflowed");

        let last = current.rc.fetch_add(SEAL_BIT, Ordering::AcqRel);
        assert_eq!(
            last & SEAL_BIT,
            0,
            "version {} double-sealed",
            sealed_version
        );

        if last & SEAL_MASK == 0 {
            current.drained.mark();
        }

        // guards drop without touching the lock, so this cannot stall
        // behind the write lock held here.
        current.drained.clone().wait();

        let ret = f(sealed_version);
        *current = Arc::new(VersionTracker::new(next));
        (sealed_version, ret)
    }
}

#[test]
fn version_basic_functionality() {
    use std::time::Duration;

    let versions = Versions::default();

    let g1 = versions.check_in();
    let g2 = versions.check_in();

    assert_eq!(g1.version().get(), 1);
    assert_eq!(g2.version().get(), 1);

    std::thread::scope(|s| {
        let sealer =
            s.spawn(|| versions.seal_with(|version| version.get() * 10));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!sealer.is_finished());
        drop(g1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!sealer.is_finished());
        drop(g2);

        let (sealed, ret) = sealer.join().unwrap();
        assert_eq!(sealed.get(), 1);
        assert_eq!(ret, 10);
    });
    assert_eq!(versions.current().get(), 2);

    let g3 = versions.check_in();
    assert_eq!(g3.version().get(), 2);
    drop(g3);

    // nothing in flight: sealing drains immediately
    let (sealed, ()) = versions.seal_with(|_| ());
    assert_eq!(sealed.get(), 2);
    assert_eq!(versions.current().get(), 3);

    versions.advance_past(NonZeroU64::new(9).unwrap());
    assert_eq!(versions.current().get(), 10);
    versions.advance_past(NonZeroU64::new(3).unwrap());
    assert_eq!(versions.current().get(), 10);
}

#[test]
fn check_in_waits_for_sealed_work() {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    let versions = Versions::default();
    let sealed_work_done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let sealer = s.spawn(|| {
            versions.seal_with(|_| {
                std::thread::sleep(Duration::from_millis(50));
                sealed_work_done.store(true, Ordering::Release);
            })
        });

        // wait until the seal is in place
        while versions.current.try_read().is_some_and(|c| c.version.get() == 1)
            && !sealer.is_finished()
        {
            std::thread::yield_now();
        }

        let guard = versions.check_in();
        assert_eq!(guard.version().get(), 2);
        assert!(sealed_work_done.load(Ordering::Acquire));
        drop(guard);
        sealer.join().unwrap();
    });
}
