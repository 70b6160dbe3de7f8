//! Correlation of forwarded attribute requests with their responses.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use tracing::trace;

use crate::gatt::Handle;
use crate::le::{Addr, Link};
use crate::lock::FeatureClass;
use crate::SyncMutex;

/// Error returned when a response identifier does not match any outstanding
/// request, either because it was already resolved or never issued.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("stale or unknown request {id}")]
pub struct StaleRequest {
    pub id: RequestId,
}

/// Request identifier assigned by a [`Registry`]. Identifiers are strictly
/// increasing and never reused.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Returns the raw identifier.
    #[inline(always)]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type of the attribute targeted by a request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
pub enum AttrType {
    Characteristic,
    Descriptor,
}

/// Operation performed by a request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestKind {
    Read(AttrType),
    Write(AttrType),
    /// Commit or abort of a reliable write transaction.
    ExecuteWrite,
}

impl RequestKind {
    /// Returns the class of the client operation that issued the request.
    #[must_use]
    pub const fn class(self) -> FeatureClass {
        match self {
            Self::Read(AttrType::Characteristic) => FeatureClass::CharacteristicRead,
            Self::Write(AttrType::Characteristic) | Self::ExecuteWrite => {
                FeatureClass::CharacteristicWrite
            }
            Self::Read(AttrType::Descriptor) => FeatureClass::DescriptorRead,
            Self::Write(AttrType::Descriptor) => FeatureClass::DescriptorWrite,
        }
    }
}

/// Outstanding request awaiting a response from the attribute owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub link: Link,
    /// Target attribute, or `None` for [`RequestKind::ExecuteWrite`].
    pub hdl: Option<Handle>,
    pub kind: RequestKind,
}

/// Registry of outstanding requests. Each request is created once and
/// resolved at most once.
#[derive(Debug)]
pub struct Registry(SyncMutex<State>);

#[derive(Debug)]
struct State {
    next: u64,
    pending: HashMap<RequestId, PendingRequest>,
}

impl Default for Registry {
    #[inline]
    fn default() -> Self {
        Self(SyncMutex::new(State {
            next: 1,
            pending: HashMap::new(),
        }))
    }
}

impl Registry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new identifier and stores the request until it is resolved.
    pub fn new_request(&self, link: Link, hdl: Option<Handle>, kind: RequestKind) -> RequestId {
        let mut s = self.0.lock();
        let id = s.alloc();
        trace!("New request {id}: {kind:?} {hdl:?} on {link}");
        s.pending.insert(
            id,
            PendingRequest {
                id,
                link,
                hdl,
                kind,
            },
        );
        id
    }

    /// Allocates an identifier for a request that does not expect a response.
    /// Resolving the returned identifier fails.
    #[inline]
    pub fn skip(&self) -> RequestId {
        self.0.lock().alloc()
    }

    /// Removes and returns the request with identifier `id`.
    pub fn resolve(&self, id: RequestId) -> Result<PendingRequest, StaleRequest> {
        (self.0.lock().pending.remove(&id)).ok_or(StaleRequest { id })
    }

    /// Removes and returns the request with identifier `id` if it was issued
    /// on behalf of client `device`. A request of another client remains
    /// outstanding.
    pub fn resolve_for(&self, id: RequestId, device: Addr) -> Result<PendingRequest, StaleRequest> {
        match self.0.lock().pending.entry(id) {
            Entry::Occupied(e) if e.get().link.client == device => Ok(e.remove()),
            Entry::Occupied(e) => {
                trace!("Request {id} belongs to {}, not {device}", e.get().link.client);
                Err(StaleRequest { id })
            }
            Entry::Vacant(_) => Err(StaleRequest { id }),
        }
    }

    /// Discards all outstanding requests of `link` without resolving them and
    /// returns the number of discarded requests.
    pub fn discard(&self, link: Link) -> usize {
        let mut s = self.0.lock();
        let n = s.pending.len();
        s.pending.retain(|_, r| r.link != link);
        n - s.pending.len()
    }

    /// Discards the outstanding requests of `link` issued by an operation of
    /// class `op`, which was cancelled by the client. Responses to those
    /// requests become stale.
    pub fn cancel(&self, link: Link, op: FeatureClass) -> usize {
        let mut s = self.0.lock();
        let n = s.pending.len();
        (s.pending).retain(|_, r| r.link != link || r.kind.class() != op);
        n - s.pending.len()
    }

    /// Returns the number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().pending.len()
    }

    /// Returns whether there are no outstanding requests.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl State {
    /// Returns the next request identifier.
    ///
    /// # Panics
    ///
    /// Panics if the identifier space is exhausted.
    #[inline]
    fn alloc(&mut self) -> RequestId {
        let id = RequestId(self.next);
        self.next = (self.next.checked_add(1)).expect("request identifier overflow");
        id
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use crate::le::{Addr, RawAddr};

    use super::*;

    fn link(i: u8) -> Link {
        Link::new(
            Addr::Public(RawAddr::from([1, 0, 0, 0, 0, 0])),
            Addr::Random(RawAddr::from([i, 0, 0, 0, 0, 0])),
        )
    }

    #[test]
    fn resolve_once() {
        let r = Registry::new();
        let kind = RequestKind::Read(AttrType::Characteristic);
        let a = r.new_request(link(1), Handle::new(3), kind);
        let skip = r.skip();
        let b = r.new_request(link(1), None, RequestKind::ExecuteWrite);
        assert!(a < skip && skip < b);
        assert_eq!(r.len(), 2);

        assert_matches!(r.resolve(a), Ok(PendingRequest { id, hdl: Some(_), .. }) if id == a);
        assert_eq!(r.resolve(a), Err(StaleRequest { id: a }));
        assert_eq!(r.resolve(skip), Err(StaleRequest { id: skip }));
        assert_matches!(
            r.resolve(b),
            Ok(PendingRequest {
                kind: RequestKind::ExecuteWrite,
                hdl: None,
                ..
            })
        );
        assert!(r.is_empty());
    }

    #[test]
    fn resolve_for_device() {
        let r = Registry::new();
        let rd = RequestKind::Read(AttrType::Descriptor);
        let a = r.new_request(link(1), Handle::new(4), rd);
        assert_eq!(r.resolve_for(a, link(2).client), Err(StaleRequest { id: a }));
        assert_eq!(r.len(), 1);
        assert_matches!(r.resolve_for(a, link(1).client), Ok(PendingRequest { id, .. }) if id == a);
        assert_eq!(r.resolve_for(a, link(1).client), Err(StaleRequest { id: a }));
    }

    #[test]
    fn ids_exceed_u32() {
        let r = Registry::new();
        r.0.lock().next = u64::from(u32::MAX);
        let a = r.skip();
        let b = r.new_request(link(1), None, RequestKind::ExecuteWrite);
        assert_eq!((a.get(), b.get()), (u64::from(u32::MAX), 1 << 32));
        assert!(r.resolve(b).is_ok());
    }

    #[test]
    fn discard() {
        let r = Registry::new();
        let w = RequestKind::Write(AttrType::Descriptor);
        let a = r.new_request(link(1), Handle::new(4), w);
        let b = r.new_request(link(2), Handle::new(4), w);
        r.new_request(link(1), Handle::new(5), w);
        assert_eq!(r.discard(link(1)), 2);
        assert!(r.resolve(a).is_err());
        assert_eq!(r.resolve(b).map(|p| p.link), Ok(link(2)));
        assert_eq!(r.discard(link(2)), 0);
    }

    #[test]
    fn cancel() {
        let r = Registry::new();
        let rd = RequestKind::Read(AttrType::Characteristic);
        let a = r.new_request(link(1), Handle::new(3), rd);
        let b = r.new_request(link(1), None, RequestKind::ExecuteWrite);
        let c = r.new_request(link(2), Handle::new(3), rd);
        assert_eq!(r.cancel(link(1), FeatureClass::CharacteristicWrite), 1);
        assert!(r.resolve(b).is_err());
        assert_eq!(r.cancel(link(1), FeatureClass::DescriptorRead), 0);
        assert_eq!(r.cancel(link(1), FeatureClass::CharacteristicRead), 1);
        assert!(r.resolve(a).is_err());
        assert!(r.resolve(c).is_ok());
    }
}
