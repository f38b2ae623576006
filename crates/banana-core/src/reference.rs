//! Capability references and their bookkeeping.
//!
//! A *local* capability ([`LocalRef`]) wraps an object implementing
//! [`Referenceable`]; it crosses the wire as a `my-reference` carrying a
//! connection-local id (clid). A *remote* capability ([`RemoteHandle`]) is
//! the proxy created on the receiving side.
//!
//! Reference counting is explicit rather than finalizer-driven: the last
//! [`RemoteHandle`] clone to drop pushes `(clid, count)` onto a
//! [`DecrefQueue`] shared with the owning broker, which turns entries into
//! `decref` calls to the peer at its next pump. The exporting side retires
//! its tracker only when the acknowledged count reaches zero.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::failure::RemoteFailure;
use crate::value::Value;

/// Named arguments of one remote call.
pub type Args = BTreeMap<String, Value>;

/// An object that can be invoked from the other end of a connection.
pub trait Referenceable: Send + Sync {
    /// The remote-interface name this object claims to implement, if any.
    /// A claimed interface subjects every call to its method schemas.
    fn interface_name(&self) -> Option<&str> {
        None
    }

    /// Dispatch one inbound call. Runs exactly once per request; the
    /// result (or failure) becomes the `answer` (or `error`) sequence.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteFailure`] that will be serialized to the caller.
    fn do_remote_call(&self, method: &str, args: Args) -> Result<Value, RemoteFailure>;
}

/// A locally hosted capability, cheap to clone.
#[derive(Clone)]
pub struct LocalRef {
    obj: Arc<dyn Referenceable>,
}

impl LocalRef {
    /// Wrap an object for export.
    pub fn new(obj: Arc<dyn Referenceable>) -> Self {
        Self { obj }
    }

    /// The wrapped object.
    #[must_use]
    pub fn object(&self) -> &Arc<dyn Referenceable> {
        &self.obj
    }

    /// Identity for clid assignment: the allocation address.
    #[must_use]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.obj).cast::<()>() as usize
    }

    /// True if both wrap the same allocation.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl std::fmt::Debug for LocalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRef")
            .field("identity", &format_args!("{:#x}", self.identity()))
            .field("interface", &self.obj.interface_name())
            .finish()
    }
}

/// Pending decref notifications, shared between handles and their broker.
#[derive(Clone, Default)]
pub struct DecrefQueue {
    entries: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl DecrefQueue {
    /// A fresh, empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` dropped references to `clid`.
    pub fn push(&self, clid: u64, count: u64) {
        if count > 0 {
            self.entries.lock().push((clid, count));
        }
    }

    /// Take everything recorded so far.
    #[must_use]
    pub fn drain(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Identity of this queue's shared slot. Two handles report to the
    /// same broker exactly when their queues share a key.
    #[must_use]
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.entries) as usize
    }
}

struct HandleInner {
    clid: u64,
    url: Option<String>,
    interface_name: Option<String>,
    /// How many times the peer has sent us this reference. The eventual
    /// decref must return exactly this count.
    received: AtomicU64,
    decrefs: DecrefQueue,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let count = self.received.load(Ordering::Relaxed);
        self.decrefs.push(self.clid, count);
    }
}

/// A proxy for a capability hosted by the peer.
///
/// Clones share one slot; the peer's reference count is settled once, when
/// the last clone drops.
#[derive(Clone)]
pub struct RemoteHandle {
    inner: Arc<HandleInner>,
}

impl RemoteHandle {
    /// The connection-local id the peer knows this capability by.
    #[must_use]
    pub fn clid(&self) -> u64 {
        self.inner.clid
    }

    /// The stable URL, if the capability is globally nameable.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.inner.url.as_deref()
    }

    /// The interface the peer claims the capability implements.
    #[must_use]
    pub fn interface_name(&self) -> Option<&str> {
        self.inner.interface_name.as_deref()
    }

    /// True if both handles proxy the same imported capability.
    #[must_use]
    pub fn same_reference(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The decref-queue identity, used to tell whether this handle was
    /// imported over a given broker (see [`DecrefQueue::key`]).
    #[must_use]
    pub fn decref_key(&self) -> usize {
        self.inner.decrefs.key()
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("clid", &self.inner.clid)
            .field("url", &self.inner.url)
            .finish()
    }
}

/// Send-side record for one exported capability.
///
/// Tracks how many times the reference has crossed the wire, minus the
/// decrefs the peer has returned. At zero the clid is retired.
#[derive(Debug)]
pub struct ReferenceableTracker {
    /// The exported object.
    pub obj: LocalRef,
    /// The clid it travels under.
    pub clid: u64,
    /// Transmissions not yet decref'd.
    pub ref_count: u64,
    /// Stable URL, if the object is published.
    pub url: Option<String>,
}

impl ReferenceableTracker {
    /// New tracker with a zero count.
    #[must_use]
    pub fn new(obj: LocalRef, clid: u64, url: Option<String>) -> Self {
        Self { obj, clid, ref_count: 0, url }
    }

    /// Count one transmission. Returns true on the first, which is when
    /// the interface name and URL accompany the clid on the wire.
    pub fn send(&mut self) -> bool {
        self.ref_count += 1;
        self.ref_count == 1
    }

    /// Apply a decref from the peer. Returns true when the count reaches
    /// zero and the clid should be retired.
    ///
    /// A decref larger than the outstanding count indicates a confused or
    /// hostile peer; the count saturates at zero rather than wrapping.
    pub fn decref(&mut self, count: u64) -> bool {
        if count > self.ref_count {
            tracing::warn!(
                clid = self.clid,
                outstanding = self.ref_count,
                count,
                "decref exceeds outstanding reference count"
            );
        }
        self.ref_count = self.ref_count.saturating_sub(count);
        self.ref_count == 0
    }
}

/// Receive-side record for one imported capability.
pub struct RemoteReferenceTracker {
    clid: u64,
    url: Option<String>,
    interface_name: Option<String>,
    decrefs: DecrefQueue,
    handle: Weak<HandleInner>,
}

impl RemoteReferenceTracker {
    /// New tracker for a clid the peer just introduced.
    #[must_use]
    pub fn new(
        clid: u64,
        url: Option<String>,
        interface_name: Option<String>,
        decrefs: DecrefQueue,
    ) -> Self {
        Self { clid, url, interface_name, decrefs, handle: Weak::new() }
    }

    /// The stable URL, if one was sent.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Produce the live handle, creating it if no clone is alive, and
    /// count one more receipt against the eventual decref.
    pub fn get_ref(&mut self) -> RemoteHandle {
        if let Some(inner) = self.handle.upgrade() {
            inner.received.fetch_add(1, Ordering::Relaxed);
            return RemoteHandle { inner };
        }
        let inner = Arc::new(HandleInner {
            clid: self.clid,
            url: self.url.clone(),
            interface_name: self.interface_name.clone(),
            received: AtomicU64::new(1),
            decrefs: self.decrefs.clone(),
        });
        self.handle = Arc::downgrade(&inner);
        RemoteHandle { inner }
    }

    /// True if no handle clone is alive (the decref is queued or already
    /// sent) — the tracker can be removed once the peer acknowledges.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.handle.upgrade().is_none()
    }
}

/// A long-lived pointer to a published capability: the parsed form of a
/// `pb://tubid@host:port,host2:port2/name` or `pbu://host:port/name` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SturdyRef {
    /// True for `pb://` (authenticated) references.
    pub encrypted: bool,
    /// The target tub identity; present only when authenticated.
    pub tub_id: Option<String>,
    /// Where the tub may be reached.
    pub location_hints: Vec<String>,
    /// The published name (a swiss number for anonymous publications).
    pub name: String,
}

impl SturdyRef {
    /// Parse a reference URL.
    ///
    /// # Errors
    ///
    /// Returns a description of the malformation.
    pub fn parse(url: &str) -> Result<Self, String> {
        if let Some(rest) = url.strip_prefix("pb://") {
            let slash = rest.rfind('/').ok_or("missing name component")?;
            let name = rest[slash + 1..].to_string();
            let authority = &rest[..slash];
            let at = authority.find('@').ok_or("missing tub id")?;
            let tub_id = authority[..at].to_string();
            if tub_id.is_empty() {
                return Err("empty tub id".into());
            }
            let hints = authority[at + 1..].split(',').map(str::to_string).collect();
            Ok(Self { encrypted: true, tub_id: Some(tub_id), location_hints: hints, name })
        } else if let Some(rest) = url.strip_prefix("pbu://") {
            let slash = rest.rfind('/').ok_or("missing name component")?;
            Ok(Self {
                encrypted: false,
                tub_id: None,
                location_hints: vec![rest[..slash].to_string()],
                name: rest[slash + 1..].to_string(),
            })
        } else {
            Err(format!("unknown reference-URL prefix in '{}'", url))
        }
    }

    /// Render back to URL form.
    #[must_use]
    pub fn url(&self) -> String {
        if self.encrypted {
            format!(
                "pb://{}@{}/{}",
                self.tub_id.as_deref().unwrap_or(""),
                self.location_hints.join(","),
                self.name
            )
        } else {
            format!("pbu://{}/{}", self.location_hints.join(","), self.name)
        }
    }

    /// The identity of the hosting tub, for connection dedup.
    #[must_use]
    pub fn tub_ref(&self) -> TubRef {
        match &self.tub_id {
            Some(id) => TubRef::Auth { tub_id: id.clone() },
            None => TubRef::NoAuth {
                location: self.location_hints.first().cloned().unwrap_or_default(),
            },
        }
    }
}

/// Comparable identity of a peer tub, used as the key of the broker table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TubRef {
    /// An authenticated tub, identified by its certificate digest.
    Auth {
        /// The identity digest.
        tub_id: String,
    },
    /// An unauthenticated tub, identified only by where we reached it.
    NoAuth {
        /// The `host:port` we connected to.
        location: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sturdy_ref_round_trip() {
        let url = "pb://abc123@tub-a:1234,tub-a.example:1234/deadbeef";
        let sr = SturdyRef::parse(url).unwrap();
        assert!(sr.encrypted);
        assert_eq!(sr.tub_id.as_deref(), Some("abc123"));
        assert_eq!(sr.location_hints.len(), 2);
        assert_eq!(sr.name, "deadbeef");
        assert_eq!(sr.url(), url);

        let url = "pbu://localhost:9000/math";
        let sr = SturdyRef::parse(url).unwrap();
        assert!(!sr.encrypted);
        assert_eq!(sr.url(), url);
    }

    #[test]
    fn malformed_urls_rejected() {
        assert!(SturdyRef::parse("http://x/y").is_err());
        assert!(SturdyRef::parse("pb://noname").is_err());
        assert!(SturdyRef::parse("pb://@host/missing-id").is_err());
    }

    #[test]
    fn tracker_send_and_decref() {
        struct Nothing;
        impl Referenceable for Nothing {
            fn do_remote_call(&self, _m: &str, _a: Args) -> Result<Value, RemoteFailure> {
                Ok(Value::None)
            }
        }
        let obj = LocalRef::new(Arc::new(Nothing));
        let mut t = ReferenceableTracker::new(obj, 1, None);
        assert!(t.send());
        assert!(!t.send());
        assert!(!t.decref(1));
        assert!(t.decref(1));
    }

    #[test]
    fn last_handle_drop_queues_full_count() {
        let q = DecrefQueue::new();
        let mut tracker = RemoteReferenceTracker::new(5, None, None, q.clone());
        let h1 = tracker.get_ref();
        let h2 = tracker.get_ref();
        assert!(h1.same_reference(&h2));
        drop(h1);
        assert!(q.drain().is_empty());
        drop(h2);
        assert_eq!(q.drain(), vec![(5, 2)]);
        assert!(tracker.is_idle());
    }
}
