//! Per-link, per-operation-class request serialization.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::le::Link;
use crate::SyncMutex;

/// Class of GATT operations that share a single outstanding request slot.
/// Each class is locked independently per link, except
/// [`FeatureClass::RemoteRssi`], which shares one slot across all links.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    enum_iterator::Sequence,
    strum::Display,
)]
#[non_exhaustive]
pub enum FeatureClass {
    Connect,
    ServicesDiscovered,
    Mtu,
    PhyRead,
    PhyUpdate,
    CharacteristicRead,
    CharacteristicWrite,
    DescriptorRead,
    DescriptorWrite,
    Bonding,
    RemoteRssi,
}

impl FeatureClass {
    /// Returns whether the class is locked by the host adapter rather than by
    /// individual links.
    #[inline(always)]
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::RemoteRssi)
    }
}

/// Lock slot identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum Key {
    Link(Link, FeatureClass),
    Global(FeatureClass),
}

impl Key {
    #[inline]
    const fn new(link: Link, f: FeatureClass) -> Self {
        if f.is_global() {
            Self::Global(f)
        } else {
            Self::Link(link, f)
        }
    }
}

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Set of request locks for all links. Acquisitions of the same slot are
/// granted in FIFO order. Slots are created on demand and removed once they
/// have no holder and no waiters, so the set does not grow with the number of
/// links that ever existed.
///
/// Locks of different links or different classes never wait on each other.
/// The internal map lock is only held while looking up a slot, never while
/// waiting for one.
#[derive(Clone, Debug, Default)]
pub struct RequestLock(Arc<SyncMutex<HashMap<Key, Slot>>>);

impl RequestLock {
    /// Creates an empty lock set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other guard for the (`link`, `f`) slot exists and
    /// returns a guard that holds it. This method is cancel safe: dropping the
    /// future before it completes gives up the place in the queue.
    pub async fn acquire(&self, link: Link, f: FeatureClass) -> LockGuard {
        let k = Key::new(link, f);
        let slot = self.slot(k);
        let _gc = CancelGc(self, k);
        let g = slot.lock_owned().await;
        trace!("Acquired {f} lock for {link}");
        LockGuard {
            set: self.clone(),
            key: k,
            g: Some(g),
        }
    }

    /// Acquires the (`link`, `f`) slot if it is free without waiting.
    #[must_use]
    pub fn try_acquire(&self, link: Link, f: FeatureClass) -> Option<LockGuard> {
        let k = Key::new(link, f);
        let Ok(g) = self.slot(k).try_lock_owned() else {
            return None;
        };
        trace!("Acquired {f} lock for {link} (try)");
        Some(LockGuard {
            set: self.clone(),
            key: k,
            g: Some(g),
        })
    }

    /// Returns whether the (`link`, `f`) slot is currently held.
    #[must_use]
    pub fn is_locked(&self, link: Link, f: FeatureClass) -> bool {
        (self.0.lock().get(&Key::new(link, f))).map_or(false, |s| s.try_lock().is_err())
    }

    /// Returns the number of slots that are held or waited on.
    #[inline]
    #[must_use]
    pub fn active(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns the slot for key `k`, creating it if needed.
    fn slot(&self, k: Key) -> Slot {
        Arc::clone(self.0.lock().entry(k).or_default())
    }

    /// Removes the slot for key `k` if it is no longer referenced by any guard
    /// or waiter.
    fn gc(&self, k: Key) {
        let mut m = self.0.lock();
        if m.get(&k).map_or(false, |s| Arc::strong_count(s) == 1) {
            m.remove(&k);
        }
    }
}

/// Removes the slot of an acquisition that was cancelled after the holder
/// released it. Has no effect once the slot is held.
struct CancelGc<'a>(&'a RequestLock, Key);

impl Drop for CancelGc<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.gc(self.1);
    }
}

/// Held request lock slot. The slot is released when the guard is dropped,
/// which covers operation completion, failure, cancellation, and timeout.
#[derive(Debug)]
#[must_use]
pub struct LockGuard {
    set: RequestLock,
    key: Key,
    g: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl LockGuard {
    /// Returns the operation class of the held slot.
    #[inline]
    #[must_use]
    pub const fn class(&self) -> FeatureClass {
        match self.key {
            Key::Link(_, f) | Key::Global(f) => f,
        }
    }

    /// Releases the slot, resuming the next waiter, if any.
    #[inline(always)]
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // The slot must be unlocked before gc can observe it as unreferenced
        drop(self.g.take());
        self.set.gc(self.key);
        match self.key {
            Key::Link(link, f) => trace!("Released {f} lock for {link}"),
            Key::Global(f) => trace!("Released global {f} lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use enum_iterator::all;
    use tokio::time::timeout;

    use crate::le::{Addr, RawAddr};

    use super::*;

    fn link(i: u8) -> Link {
        Link::new(
            Addr::Public(RawAddr::from([0, 0, 0, 0, 0, 0xA0])),
            Addr::Public(RawAddr::from([i, 0, 0, 0, 0, 0xC0])),
        )
    }

    #[tokio::test]
    async fn fifo() {
        let lk = RequestLock::new();
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let g = lk.acquire(link(0), FeatureClass::Mtu).await;
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let (lk, order) = (lk.clone(), Arc::clone(&order));
                tokio::spawn(async move {
                    let _g = lk.acquire(link(0), FeatureClass::Mtu).await;
                    order.lock().push(i);
                    tokio::task::yield_now().await;
                })
            })
            .collect();
        // Let every task enqueue before releasing
        tokio::task::yield_now().await;
        assert!(lk.is_locked(link(0), FeatureClass::Mtu));
        g.release();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), [0, 1, 2, 3]);
        assert!(!lk.is_locked(link(0), FeatureClass::Mtu));
        assert_eq!(lk.active(), 0);
    }

    #[tokio::test]
    async fn independent_slots() {
        let lk = RequestLock::new();
        let _a = lk.acquire(link(0), FeatureClass::CharacteristicRead).await;

        // Other links and other classes of the same link are not blocked
        let b = lk.try_acquire(link(1), FeatureClass::CharacteristicRead);
        assert!(b.is_some());
        let c = lk.try_acquire(link(0), FeatureClass::CharacteristicWrite);
        assert!(c.is_some());
        assert!(lk
            .try_acquire(link(0), FeatureClass::CharacteristicRead)
            .is_none());

        // RSSI reads contend across links
        let _r = lk.acquire(link(0), FeatureClass::RemoteRssi).await;
        assert!(lk.try_acquire(link(1), FeatureClass::RemoteRssi).is_none());
        assert!(lk.is_locked(link(5), FeatureClass::RemoteRssi));
    }

    #[tokio::test]
    async fn cancelled_acquire() {
        let lk = RequestLock::new();
        let g = lk.acquire(link(0), FeatureClass::Connect).await;
        let r = timeout(
            Duration::from_millis(10),
            lk.acquire(link(0), FeatureClass::Connect),
        )
        .await;
        assert!(r.is_err());
        drop(g);
        assert_eq!(lk.active(), 0);

        // Guard held by an aborted task is released
        let lk2 = lk.clone();
        let t = tokio::spawn(async move {
            let _g = lk2.acquire(link(0), FeatureClass::Connect).await;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        assert!(lk.is_locked(link(0), FeatureClass::Connect));
        t.abort();
        let _ = t.await;
        let g = timeout(
            Duration::from_secs(1),
            lk.acquire(link(0), FeatureClass::Connect),
        )
        .await;
        assert!(g.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress() {
        const LINKS: u8 = 10;
        const ITERS: usize = 50;
        let lk = RequestLock::new();
        let held: Arc<SyncMutex<HashMap<Key, Arc<AtomicBool>>>> = Arc::default();
        let done = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..LINKS {
            for f in all::<FeatureClass>() {
                let (lk, held, done) = (lk.clone(), Arc::clone(&held), Arc::clone(&done));
                tasks.push(tokio::spawn(async move {
                    let flag = Arc::clone(held.lock().entry(Key::new(link(i), f)).or_default());
                    for n in 0..ITERS {
                        let acq = lk.acquire(link(i), f);
                        if n % 7 == 3 {
                            // Cancel some acquisitions while they may be queued
                            let _ = timeout(Duration::from_micros(1), acq).await;
                            continue;
                        }
                        let g = acq.await;
                        assert!(!flag.swap(true, Ordering::SeqCst), "{f} lock not exclusive");
                        tokio::task::yield_now().await;
                        flag.store(false, Ordering::SeqCst);
                        g.release();
                    }
                    done.fetch_add(1, Ordering::Relaxed);
                }));
            }
        }
        let join = async {
            for t in tasks {
                t.await.unwrap();
            }
        };
        timeout(Duration::from_secs(30), join)
            .await
            .expect("lock stress test deadlocked");
        assert_eq!(
            done.load(Ordering::Relaxed),
            usize::from(LINKS) * all::<FeatureClass>().count()
        );
        assert_eq!(lk.active(), 0);
    }
}
