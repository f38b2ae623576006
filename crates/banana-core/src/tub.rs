//! The capability-hosting service.
//!
//! A `Tub` is one identity's presence: it owns the table of published
//! objects (name to capability), hands out `pb://`/`pbu://` URLs, and
//! tracks which peers currently have a live broker so that negotiation
//! can reject duplicate connections.
//!
//! Publication names for anonymous objects are swiss numbers: unguessable
//! strings drawn from the [`Environment`]'s randomness. Knowing the name
//! *is* the authority to reach the object.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::env::Environment;
use crate::reference::{LocalRef, SturdyRef, TubRef};

/// Bits of unguessable name per anonymous publication.
const NAME_BITS: usize = 160;

/// Shared handle to a tub.
pub type TubHandle = Arc<Mutex<Tub>>;

/// One identity's capability table and connection registry.
pub struct Tub {
    tub_id: Option<String>,
    location_hints: Vec<String>,
    name_to_ref: HashMap<String, LocalRef>,
    ident_to_name: HashMap<usize, String>,
    connected_peers: HashSet<TubRef>,
}

impl Tub {
    /// An authenticated tub with the given identity digest.
    #[must_use]
    pub fn new(tub_id: impl Into<String>) -> Self {
        Self {
            tub_id: Some(tub_id.into()),
            location_hints: Vec::new(),
            name_to_ref: HashMap::new(),
            ident_to_name: HashMap::new(),
            connected_peers: HashSet::new(),
        }
    }

    /// An unauthenticated tub.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            tub_id: None,
            location_hints: Vec::new(),
            name_to_ref: HashMap::new(),
            ident_to_name: HashMap::new(),
            connected_peers: HashSet::new(),
        }
    }

    /// Shared-handle constructor.
    #[must_use]
    pub fn handle(self) -> TubHandle {
        Arc::new(Mutex::new(self))
    }

    /// This tub's identity digest, if authenticated.
    #[must_use]
    pub fn tub_id(&self) -> Option<&str> {
        self.tub_id.as_deref()
    }

    /// Declare how the outside world reaches this tub. Must be set before
    /// anything can be published.
    pub fn set_location(&mut self, hints: impl IntoIterator<Item = String>) {
        self.location_hints = hints.into_iter().collect();
    }

    /// Publish an object under an unguessable name. Returns its URL.
    /// Publishing the same object again returns the existing URL.
    pub fn publish(&mut self, obj: LocalRef, env: &impl Environment) -> String {
        if let Some(name) = self.ident_to_name.get(&obj.identity()) {
            return self.url_for_name(name);
        }
        let mut bytes = [0u8; NAME_BITS / 8];
        env.random_bytes(&mut bytes);
        let name: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        self.publish_named(obj, &name)
    }

    /// Publish an object under a well-known name. Returns its URL.
    pub fn publish_named(&mut self, obj: LocalRef, name: &str) -> String {
        self.ident_to_name.insert(obj.identity(), name.to_string());
        self.name_to_ref.insert(name.to_string(), obj);
        self.url_for_name(name)
    }

    /// Remove a publication.
    pub fn unpublish(&mut self, name: &str) {
        if let Some(obj) = self.name_to_ref.remove(name) {
            self.ident_to_name.remove(&obj.identity());
        }
    }

    /// The published object under `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<LocalRef> {
        self.name_to_ref.get(name).cloned()
    }

    /// Resolve a reference URL that points at this tub.
    #[must_use]
    pub fn lookup_url(&self, url: &str) -> Option<LocalRef> {
        let sturdy = SturdyRef::parse(url).ok()?;
        if sturdy.tub_id.as_deref() != self.tub_id.as_deref() {
            return None;
        }
        self.lookup(&sturdy.name)
    }

    /// The stable URL of a published object, by identity.
    #[must_use]
    pub fn url_for_identity(&self, identity: usize) -> Option<String> {
        self.ident_to_name.get(&identity).map(|name| self.url_for_name(name))
    }

    fn url_for_name(&self, name: &str) -> String {
        let sturdy = SturdyRef {
            encrypted: self.tub_id.is_some(),
            tub_id: self.tub_id.clone(),
            location_hints: self.location_hints.clone(),
            name: name.to_string(),
        };
        sturdy.url()
    }

    /// Record a live broker to `peer`. False if one already exists — the
    /// negotiation master uses this to reject duplicate connections.
    pub fn broker_attached(&mut self, peer: TubRef) -> bool {
        self.connected_peers.insert(peer)
    }

    /// A broker went away.
    pub fn broker_detached(&mut self, peer: &TubRef) {
        self.connected_peers.remove(peer);
    }

    /// True if a broker to `peer` is currently attached.
    #[must_use]
    pub fn has_broker_for(&self, peer: &TubRef) -> bool {
        self.connected_peers.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::RemoteFailure;
    use crate::reference::{Args, Referenceable};
    use crate::value::Value;
    use std::time::{Duration, Instant};

    #[derive(Clone)]
    struct FixedEnv;

    impl Environment for FixedEnv {
        fn now(&self) -> Instant {
            Instant::now()
        }
        fn sleep(&self, _d: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }
        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0xab);
        }
    }

    struct Nothing;
    impl Referenceable for Nothing {
        fn do_remote_call(&self, _m: &str, _a: Args) -> Result<Value, RemoteFailure> {
            Ok(Value::None)
        }
    }

    #[test]
    fn publish_and_resolve() {
        let mut tub = Tub::new("tubid123");
        tub.set_location(vec!["localhost:5000".to_string()]);
        let obj = LocalRef::new(Arc::new(Nothing));

        let url = tub.publish(obj.clone(), &FixedEnv);
        assert!(url.starts_with("pb://tubid123@localhost:5000/"));
        // stable across repeat publication
        assert_eq!(tub.publish(obj.clone(), &FixedEnv), url);
        assert_eq!(tub.url_for_identity(obj.identity()), Some(url.clone()));

        let found = tub.lookup_url(&url).expect("published object resolves");
        assert!(found.same_object(&obj));
        assert!(tub.lookup_url("pb://other@x/name").is_none());
    }

    #[test]
    fn duplicate_broker_detection() {
        let mut tub = Tub::new("tubid123");
        let peer = TubRef::Auth { tub_id: "peer".into() };
        assert!(tub.broker_attached(peer.clone()));
        assert!(!tub.broker_attached(peer.clone()));
        tub.broker_detached(&peer);
        assert!(tub.broker_attached(peer));
    }
}
