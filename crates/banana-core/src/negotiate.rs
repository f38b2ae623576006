//! The pre-Banana handshake.
//!
//! Two peers run this once per connection to agree on wire parameters
//! before the broker takes over. The exchange is text: an HTTP/1.1-shaped
//! upgrade request in the clear, then rfc822-style `key: value` blocks
//! (ending in a blank line) over the possibly-upgraded transport.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────┐ GET/101 ┌───────────┐ hello   ┌──────────┐ decision ┌────────┐
//! │ Plaintext │────────>│ Encrypted │────────>│ Deciding │─────────>│ Banana │
//! └───────────┘         └───────────┘         └──────────┘          └────────┘
//!       │ any failure        │                     │
//!       └────────────────────┴─────────────────────┴──> Abandoned
//! ```
//!
//! (The master skips `Deciding`: it evaluates both hellos, transmits its
//! decision and switches immediately.)
//!
//! Master election: the lexicographically greater tub id wins; a missing
//! id compares less than any present one; a full tie goes to the server
//! side. The master alone checks for an existing connection to the same
//! peer and rejects the new one as a duplicate, which keeps simultaneous
//! cross-connects from killing both links.
//!
//! This is a pure state machine in the action style: methods take `now`,
//! return actions, and never touch a socket. The driver owns the
//! transport, the optional TLS upgrade, and the timer.

use std::time::{Duration, Instant};

use banana_proto::{BananaError, NegotiationError, RemoteNegotiationError};

use crate::reference::{SturdyRef, TubRef};

/// Negotiation protocol version spoken and required.
const NEGOTIATION_VERSION: &str = "1";

/// Header blocks larger than this are hostile.
const MAX_HEADER_BLOCK: usize = 4096;

/// Negotiation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for / sending the plaintext upgrade exchange.
    Plaintext,
    /// Hello blocks in flight over the (possibly) secured channel.
    Encrypted,
    /// Non-master waiting for the master's decision.
    Deciding,
    /// Handshake complete; the broker owns the connection now.
    Banana,
    /// Terminal failure.
    Abandoned,
}

/// Parameters agreed for the Banana connection. Version 1 fixes
/// everything, so the set is presently empty; it travels anyway so the
/// switch-over interface does not change when parameters appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BananaParams {}

/// Actions for the driver to execute, in order.
#[derive(Debug)]
pub enum Action {
    /// Write these bytes to the transport.
    SendText(Vec<u8>),
    /// Upgrade the transport with the security layer, presenting our
    /// identity material if we have any. The driver must report the
    /// peer's verified fingerprint back via
    /// [`Negotiation::set_peer_identity`].
    StartTls,
    /// Negotiation succeeded: hand the connection to a broker.
    SwitchToBanana {
        /// Agreed parameters.
        params: BananaParams,
        /// Bytes received past the final header block; feed them to the
        /// broker first.
        leftover: Vec<u8>,
        /// The peer's identity, when it claimed one.
        peer: Option<TubRef>,
        /// Whether this side was the master.
        is_master: bool,
    },
    /// Drop the transport.
    Close {
        /// Human-readable reason.
        reason: String,
    },
}

/// Why the handshake failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    /// We detected the problem.
    Local(NegotiationError),
    /// The peer told us it gave up; send nothing back.
    Remote(RemoteNegotiationError),
    /// The exchange was malformed beyond negotiation semantics.
    Protocol(BananaError),
    /// The server redirected us; retry against the new location.
    Redirect(String),
}

impl std::fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationFailure::Local(e) => write!(f, "{}", e),
            NegotiationFailure::Remote(e) => write!(f, "{}", e),
            NegotiationFailure::Protocol(e) => write!(f, "{}", e),
            NegotiationFailure::Redirect(location) => {
                write!(f, "redirected to {}", location)
            }
        }
    }
}

/// What a listener knows about a requested identity.
pub enum HostLookup {
    /// This endpoint hosts the identity (or accepts anonymous
    /// connections); negotiate with the given local tub id.
    Found {
        /// Our tub id for this connection, if authenticated.
        my_tub_id: Option<String>,
    },
    /// The identity lives elsewhere; single redirect hop.
    Redirect(String),
    /// Nobody here by that name.
    Unknown,
}

/// The listener-side environment the server consults during negotiation.
pub trait NegotiationHost {
    /// Resolve a requested target identity.
    fn lookup(&mut self, tub_id: Option<&str>) -> HostLookup;

    /// Is there already a live broker to this peer? Only the master asks.
    fn is_duplicate(&mut self, peer: &TubRef) -> bool;

    /// Whether a transport security layer is available.
    fn tls_available(&mut self) -> bool {
        false
    }
}

/// Timing knobs.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Server-side deadline for the whole handshake.
    pub server_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { server_timeout: Duration::from_secs(60) }
    }
}

/// The handshake state machine for one side of one connection.
pub struct Negotiation {
    phase: Phase,
    is_client: bool,
    config: NegotiationConfig,
    buffer: Vec<u8>,

    my_tub_id: Option<String>,
    target: Option<SturdyRef>,
    target_host: String,
    want_encryption: bool,
    encrypted: bool,
    peer_fingerprint: Option<String>,
    their_tub_id: Option<String>,

    deadline: Option<Instant>,
    failed_phase: Option<Phase>,
}

impl Negotiation {
    /// Client side, dialing `target` at `host`.
    #[must_use]
    pub fn client(
        config: NegotiationConfig,
        target: &SturdyRef,
        target_host: impl Into<String>,
        my_tub_id: Option<String>,
    ) -> Self {
        let want_encryption = target.encrypted || my_tub_id.is_some();
        Self {
            phase: Phase::Plaintext,
            is_client: true,
            config,
            buffer: Vec::new(),
            my_tub_id,
            target: Some(target.clone()),
            target_host: target_host.into(),
            want_encryption,
            encrypted: false,
            peer_fingerprint: None,
            their_tub_id: None,
            deadline: None,
            failed_phase: None,
        }
    }

    /// Server side, for one accepted connection.
    #[must_use]
    pub fn server(config: NegotiationConfig) -> Self {
        Self {
            phase: Phase::Plaintext,
            is_client: false,
            config,
            buffer: Vec::new(),
            my_tub_id: None,
            target: None,
            target_host: String::new(),
            want_encryption: false,
            encrypted: false,
            peer_fingerprint: None,
            their_tub_id: None,
            deadline: None,
            failed_phase: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Call once when the transport connects. The client speaks first;
    /// the server arms its timeout.
    pub fn connection_made(&mut self, now: Instant) -> Vec<Action> {
        if self.is_client {
            vec![Action::SendText(self.plaintext_request())]
        } else {
            self.deadline = Some(now + self.config.server_timeout);
            Vec::new()
        }
    }

    fn plaintext_request(&self) -> Vec<u8> {
        let target_id = self
            .target
            .as_ref()
            .and_then(|t| t.tub_id.as_deref())
            .unwrap_or("");
        let upgrade = if self.want_encryption { "TLS/1.0" } else { "PB/1.0" };
        format!(
            "GET /id/{} HTTP/1.1\r\nHost: {}\r\nUpgrade: {}\r\nConnection: Upgrade\r\n\r\n",
            target_id, self.target_host, upgrade
        )
        .into_bytes()
    }

    /// The driver finished the TLS upgrade; record the peer's verified
    /// certificate fingerprint, if it presented one.
    pub fn set_peer_identity(&mut self, fingerprint: Option<String>) {
        self.encrypted = true;
        self.peer_fingerprint = fingerprint;
    }

    /// Check the server timeout. Emits a `Close` when it expired.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        match self.deadline {
            Some(deadline)
                if now >= deadline
                    && !matches!(self.phase, Phase::Banana | Phase::Abandoned) =>
            {
                tracing::warn!("negotiation timed out");
                self.phase = Phase::Abandoned;
                self.deadline = None;
                vec![Action::Close { reason: "negotiation timeout".to_string() }]
            }
            _ => Vec::new(),
        }
    }

    /// Consume transport bytes, advancing through complete header blocks.
    ///
    /// # Errors
    ///
    /// Any [`NegotiationFailure`] abandons the handshake; run the result
    /// through [`Negotiation::abandon_actions`] for the best-effort
    /// diagnostic and the close.
    pub fn feed(
        &mut self,
        data: &[u8],
        now: Instant,
        host: &mut dyn NegotiationHost,
    ) -> Result<Vec<Action>, NegotiationFailure> {
        if self.phase == Phase::Abandoned {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(data);
        let mut actions = Vec::new();
        loop {
            if matches!(self.phase, Phase::Banana | Phase::Abandoned) {
                return Ok(actions);
            }
            if self.buffer.len() > MAX_HEADER_BLOCK {
                return Err(self.fail_protocol("header block too long"));
            }
            let Some(end) = find_block_end(&self.buffer) else {
                return Ok(actions);
            };
            let block: Vec<u8> = self.buffer.drain(..end + 4).take(end).collect();
            let header = String::from_utf8_lossy(&block).into_owned();

            let step = match self.phase {
                Phase::Plaintext if self.is_client => self.handle_plaintext_client(&header),
                Phase::Plaintext => self.handle_plaintext_server(&header, host),
                Phase::Encrypted => self.handle_encrypted(&header, host, now),
                Phase::Deciding => self.handle_deciding(&header),
                Phase::Banana | Phase::Abandoned => unreachable!("checked above"),
            };
            match step {
                Ok(step_actions) => actions.extend(step_actions),
                Err(failure) => {
                    self.failed_phase = Some(self.phase);
                    self.phase = Phase::Abandoned;
                    self.deadline = None;
                    return Err(failure);
                }
            }
        }
    }

    /// The best-effort diagnostic (phase-appropriate) plus the close, for
    /// a failure returned by [`Negotiation::feed`]. Remote failures get no
    /// diagnostic: the peer already explained itself.
    #[must_use]
    pub fn abandon_actions(&mut self, failure: &NegotiationFailure) -> Vec<Action> {
        let failing_phase = self.failed_phase.unwrap_or(self.phase);
        self.phase = Phase::Abandoned;
        self.deadline = None;
        let mut actions = Vec::new();
        match failure {
            NegotiationFailure::Remote(_) | NegotiationFailure::Redirect(_) => {}
            NegotiationFailure::Local(e) => {
                actions.push(diagnostic(failing_phase, &e.0));
            }
            NegotiationFailure::Protocol(e) => {
                actions.push(diagnostic(failing_phase, &e.message));
            }
        }
        actions.push(Action::Close { reason: failure.to_string() });
        actions
    }

    fn fail_protocol(&mut self, message: &str) -> NegotiationFailure {
        NegotiationFailure::Protocol(BananaError::new(message))
    }

    fn handle_plaintext_client(
        &mut self,
        header: &str,
    ) -> Result<Vec<Action>, NegotiationFailure> {
        let status_line = header.lines().next().unwrap_or("");
        let mut words = status_line.split_whitespace();
        let _version = words.next();
        let status = words.next().unwrap_or("");
        match status {
            "101" => {}
            "303" => {
                let location = parse_block(header)
                    .get("location")
                    .cloned()
                    .ok_or_else(|| self.fail_protocol("redirect without a location"))?;
                return Err(NegotiationFailure::Redirect(location));
            }
            other => {
                return Err(self.fail_protocol(&format!(
                    "expected 101 Switching Protocols, got '{}'",
                    other
                )));
            }
        }
        let encrypted = header.contains("Upgrade: TLS/1.0");
        if !encrypted {
            // unencrypted connections claim no identity
            self.my_tub_id = None;
        }
        Ok(self.start_encrypted(encrypted))
    }

    fn handle_plaintext_server(
        &mut self,
        header: &str,
        host: &mut dyn NegotiationHost,
    ) -> Result<Vec<Action>, NegotiationFailure> {
        let request_line = header.lines().next().unwrap_or("");
        let mut words = request_line.split_whitespace();
        if words.next() != Some("GET") {
            return Err(self.fail_protocol("expected a GET request"));
        }
        let url = words.next().unwrap_or("");
        let Some(target) = url.strip_prefix("/id/") else {
            // probably a web browser
            return Err(self.fail_protocol("unrecognized request path"));
        };
        let target_id = if target.is_empty() { None } else { Some(target.to_string()) };
        let mut want_encrypted = header.contains("Upgrade: TLS/1.0");

        if want_encrypted && !host.tls_available() {
            return Err(NegotiationFailure::Local(NegotiationError(
                "encryption requested but not available".to_string(),
            )));
        }
        if want_encrypted && target_id.is_none() {
            // no target identity means no certificate to present
            want_encrypted = false;
        }
        if target_id.is_some() && !want_encrypted {
            return Err(NegotiationFailure::Local(NegotiationError(
                "secure tubs require encryption".to_string(),
            )));
        }

        match host.lookup(target_id.as_deref()) {
            HostLookup::Found { my_tub_id } => {
                self.my_tub_id = my_tub_id;
                let upgrade = if want_encrypted { "TLS/1.0, PB/1.0" } else { "PB/1.0" };
                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: {}\r\nConnection: Upgrade\r\n\r\n",
                    upgrade
                );
                let mut actions = vec![Action::SendText(response.into_bytes())];
                actions.extend(self.start_encrypted(want_encrypted));
                Ok(actions)
            }
            HostLookup::Redirect(location) => {
                let response = format!(
                    "HTTP/1.1 303 See Other\r\nLocation: {}\r\n\r\n",
                    location
                );
                self.phase = Phase::Abandoned;
                Ok(vec![
                    Action::SendText(response.into_bytes()),
                    Action::Close { reason: format!("redirected to {}", location) },
                ])
            }
            HostLookup::Unknown => Err(NegotiationFailure::Local(NegotiationError(format!(
                "unknown tub id {:?}",
                target_id
            )))),
        }
    }

    fn start_encrypted(&mut self, encrypted: bool) -> Vec<Action> {
        self.phase = Phase::Encrypted;
        let mut actions = Vec::new();
        if encrypted {
            actions.push(Action::StartTls);
        } else {
            self.encrypted = false;
        }
        actions.push(Action::SendText(self.hello_block()));
        actions
    }

    fn hello_block(&self) -> Vec<u8> {
        let mut lines = vec![format!("banana-negotiation-version: {}", NEGOTIATION_VERSION)];
        if let Some(my_tub_id) = &self.my_tub_id {
            lines.push(format!("my-tub-id: {}", my_tub_id));
        }
        lines.sort();
        let mut text = lines.join("\r\n");
        text.push_str("\r\n\r\n");
        text.into_bytes()
    }

    fn handle_encrypted(
        &mut self,
        header: &str,
        host: &mut dyn NegotiationHost,
        _now: Instant,
    ) -> Result<Vec<Action>, NegotiationFailure> {
        let offer = parse_block(header);
        if let Some(error) = offer.get("error") {
            return Err(NegotiationFailure::Remote(RemoteNegotiationError(error.clone())));
        }

        match offer.get("banana-negotiation-version").map(String::as_str) {
            Some(NEGOTIATION_VERSION) => {}
            other => {
                return Err(NegotiationFailure::Local(NegotiationError(format!(
                    "unrecognized negotiation version {:?}, need '{}'",
                    other, NEGOTIATION_VERSION
                ))));
            }
        }

        let their_tub_id = offer.get("my-tub-id").cloned();
        match (&self.peer_fingerprint, &their_tub_id) {
            (None, Some(_)) if !self.encrypted => {
                // an identity claim without a certificate is how the lazy
                // man-in-the-middle looks
                return Err(self.fail_protocol("you must use a certificate to claim a tub id"));
            }
            (Some(fingerprint), Some(claimed)) if fingerprint != claimed => {
                return Err(self.fail_protocol("tub id does not match certificate"));
            }
            _ => {}
        }
        self.their_tub_id = their_tub_id.clone();

        let peer = self.peer_ref();
        if self.is_client {
            if let Some(target) = &self.target {
                if target.encrypted && peer.as_ref() != Some(&target.tub_ref()) {
                    return Err(self.fail_protocol("connected to the wrong tub"));
                }
            }
        }

        let i_am_the_master = match (&self.my_tub_id, &their_tub_id) {
            (None, None) => !self.is_client,
            (None, Some(_)) => false,
            (Some(_), None) => true,
            (Some(mine), Some(theirs)) => mine > theirs,
        };
        tracing::debug!(i_am_the_master, "evaluated hello");

        if !i_am_the_master {
            self.phase = Phase::Deciding;
            return Ok(Vec::new());
        }

        // the master decides whether this connection lives at all
        if let Some(peer) = &peer {
            if host.is_duplicate(peer) {
                return Err(NegotiationFailure::Local(NegotiationError(
                    "Duplicate connection".to_string(),
                )));
            }
        }

        // both offers must agree, identity claims aside
        let mut ours = parse_block(&String::from_utf8_lossy(&self.hello_block()));
        let mut theirs = offer;
        ours.remove("my-tub-id");
        theirs.remove("my-tub-id");
        if ours != theirs {
            return Err(NegotiationFailure::Local(NegotiationError(
                "our negotiation offers are different".to_string(),
            )));
        }

        let decision = format!(
            "banana-decision-version: {}\r\n\r\n",
            NEGOTIATION_VERSION
        );
        self.phase = Phase::Banana;
        Ok(vec![
            Action::SendText(decision.into_bytes()),
            Action::SwitchToBanana {
                params: BananaParams::default(),
                leftover: std::mem::take(&mut self.buffer),
                peer,
                is_master: true,
            },
        ])
    }

    fn handle_deciding(&mut self, header: &str) -> Result<Vec<Action>, NegotiationFailure> {
        let decision = parse_block(header);
        if let Some(error) = decision.get("error") {
            return Err(NegotiationFailure::Remote(RemoteNegotiationError(error.clone())));
        }
        match decision.get("banana-decision-version").map(String::as_str) {
            Some(NEGOTIATION_VERSION) => {}
            other => {
                return Err(NegotiationFailure::Local(NegotiationError(format!(
                    "unrecognized decision version {:?}, need '{}'",
                    other, NEGOTIATION_VERSION
                ))));
            }
        }
        self.phase = Phase::Banana;
        Ok(vec![Action::SwitchToBanana {
            params: BananaParams::default(),
            leftover: std::mem::take(&mut self.buffer),
            peer: self.peer_ref(),
            is_master: false,
        }])
    }

    fn peer_ref(&self) -> Option<TubRef> {
        match &self.their_tub_id {
            Some(tub_id) => Some(TubRef::Auth { tub_id: tub_id.clone() }),
            None if self.is_client => Some(TubRef::NoAuth {
                location: self.target_host.clone(),
            }),
            None => None, // anonymous inbound peers are not deduplicated
        }
    }
}

/// The best-effort diagnostic for the phase the failure happened in: an
/// HTTP error while still in plaintext, an `error:` block afterwards.
fn diagnostic(phase: Phase, message: &str) -> Action {
    let text = if phase == Phase::Plaintext {
        format!("HTTP/1.1 500 Internal Server Error\r\n\r\n{}\r\n", message)
    } else {
        format!("error: {}\r\n\r\n", message)
    };
    Action::SendText(text.into_bytes())
}

/// Split an rfc822-style block into lowercase keys and trimmed values.
fn parse_block(header: &str) -> std::collections::HashMap<String, String> {
    let mut block = std::collections::HashMap::new();
    for line in header.lines() {
        let Some(colon) = line.find(':') else { continue };
        let key = line[..colon].to_ascii_lowercase();
        let value = line[colon + 1..].trim_start().to_string();
        block.insert(key, value);
    }
    block
}

fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneTubHost {
        tub_id: Option<String>,
        duplicates: bool,
    }

    impl NegotiationHost for OneTubHost {
        fn lookup(&mut self, tub_id: Option<&str>) -> HostLookup {
            if tub_id == self.tub_id.as_deref() {
                HostLookup::Found { my_tub_id: self.tub_id.clone() }
            } else {
                HostLookup::Unknown
            }
        }
        fn is_duplicate(&mut self, _peer: &TubRef) -> bool {
            self.duplicates
        }
        fn tls_available(&mut self) -> bool {
            true
        }
    }

    struct NoHost;
    impl NegotiationHost for NoHost {
        fn lookup(&mut self, _tub_id: Option<&str>) -> HostLookup {
            HostLookup::Found { my_tub_id: None }
        }
        fn is_duplicate(&mut self, _peer: &TubRef) -> bool {
            false
        }
    }

    fn anonymous_target() -> SturdyRef {
        SturdyRef::parse("pbu://server:1234/name").unwrap()
    }

    /// Run both sides to completion over in-memory buffers.
    fn run_pair(
        mut client: Negotiation,
        mut server: Negotiation,
        server_host: &mut dyn NegotiationHost,
    ) -> (Vec<Action>, Vec<Action>) {
        let now = Instant::now();
        let mut to_server: Vec<u8> = Vec::new();
        let mut to_client: Vec<u8> = Vec::new();
        let mut client_switch = Vec::new();
        let mut server_switch = Vec::new();

        let mut gather = |actions: Vec<Action>, wire: &mut Vec<u8>, switches: &mut Vec<Action>| {
            for action in actions {
                match action {
                    Action::SendText(bytes) => wire.extend_from_slice(&bytes),
                    Action::StartTls => {}
                    other => switches.push(other),
                }
            }
        };

        gather(client.connection_made(now), &mut to_server, &mut client_switch);
        gather(server.connection_made(now), &mut to_client, &mut server_switch);

        for _ in 0..8 {
            let data = std::mem::take(&mut to_server);
            let actions = server.feed(&data, now, server_host).expect("server feed");
            gather(actions, &mut to_client, &mut server_switch);

            let data = std::mem::take(&mut to_client);
            let actions = client.feed(&data, now, &mut NoHost).expect("client feed");
            gather(actions, &mut to_server, &mut client_switch);
        }
        (client_switch, server_switch)
    }

    #[test]
    fn anonymous_pair_converges() {
        let client = Negotiation::client(
            NegotiationConfig::default(),
            &anonymous_target(),
            "server",
            None,
        );
        let server = Negotiation::server(NegotiationConfig::default());
        let mut host = OneTubHost { tub_id: None, duplicates: false };

        let (client_actions, server_actions) = run_pair(client, server, &mut host);

        // no identities: the server side is the master
        match &server_actions[..] {
            [Action::SwitchToBanana { is_master: true, .. }] => {}
            other => panic!("server did not switch as master: {:?}", other),
        }
        match &client_actions[..] {
            [Action::SwitchToBanana { is_master: false, .. }] => {}
            other => panic!("client did not switch: {:?}", other),
        }
    }

    #[test]
    fn duplicate_connection_is_rejected_by_master() {
        let now = Instant::now();
        let mut server = Negotiation::server(NegotiationConfig::default());
        let mut host = OneTubHost { tub_id: None, duplicates: true };
        server.connection_made(now);

        let request = b"GET /id/ HTTP/1.1\r\nHost: s\r\nUpgrade: PB/1.0\r\nConnection: Upgrade\r\n\r\n";
        let _ = server.feed(request, now, &mut host).expect("plaintext ok");

        // give the server the greater identity so it is the master, and
        // mark the peer's claim as certificate-verified
        server.my_tub_id = Some("server-tub".to_string());
        server.set_peer_identity(Some("client-tub".to_string()));

        let hello = b"banana-negotiation-version: 1\r\nmy-tub-id: client-tub\r\n\r\n";
        let failure = server.feed(hello, now, &mut host).unwrap_err();
        assert!(matches!(
            &failure,
            NegotiationFailure::Local(NegotiationError(msg)) if msg == "Duplicate connection"
        ));
        // non-master peers see the reason; it must not be echoed back
        // as a generic connection error
        let actions = server.abandon_actions(&failure);
        assert!(matches!(actions.last(), Some(Action::Close { .. })));
        assert_eq!(server.phase(), Phase::Abandoned);
    }

    #[test]
    fn version_mismatch_fails() {
        let now = Instant::now();
        let mut client = Negotiation::client(
            NegotiationConfig::default(),
            &anonymous_target(),
            "server",
            None,
        );
        client.connection_made(now);
        let response =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: PB/1.0\r\nConnection: Upgrade\r\n\r\n";
        client.feed(response, now, &mut NoHost).unwrap();
        let hello = b"banana-negotiation-version: 2\r\n\r\n";
        let failure = client.feed(hello, now, &mut NoHost).unwrap_err();
        assert!(matches!(failure, NegotiationFailure::Local(_)));
    }

    #[test]
    fn server_timeout_closes() {
        let now = Instant::now();
        let mut server = Negotiation::server(NegotiationConfig::default());
        server.connection_made(now);
        assert!(server.tick(now).is_empty());
        let actions = server.tick(now + Duration::from_secs(61));
        assert!(matches!(&actions[..], [Action::Close { .. }]));
        assert_eq!(server.phase(), Phase::Abandoned);
        // the timer is gone; no stray firing later
        assert!(server.tick(now + Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn remote_error_block_gets_no_reply() {
        let now = Instant::now();
        let mut client = Negotiation::client(
            NegotiationConfig::default(),
            &anonymous_target(),
            "server",
            None,
        );
        client.connection_made(now);
        let response =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: PB/1.0\r\nConnection: Upgrade\r\n\r\n";
        client.feed(response, now, &mut NoHost).unwrap();
        let error = b"error: something broke\r\n\r\n";
        let failure = client.feed(error, now, &mut NoHost).unwrap_err();
        assert!(matches!(failure, NegotiationFailure::Remote(_)));
        let actions = client.abandon_actions(&failure);
        // close only, no diagnostic back at the peer
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Close { .. }));
    }

    #[test]
    fn redirect_is_surfaced_distinctly() {
        let now = Instant::now();
        let mut client = Negotiation::client(
            NegotiationConfig::default(),
            &anonymous_target(),
            "server",
            None,
        );
        client.connection_made(now);
        let response = b"HTTP/1.1 303 See Other\r\nLocation: other:5678\r\n\r\n";
        let failure = client.feed(response, now, &mut NoHost).unwrap_err();
        assert_eq!(failure, NegotiationFailure::Redirect("other:5678".to_string()));
    }
}
