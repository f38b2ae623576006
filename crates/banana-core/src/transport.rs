//! Transport abstraction for network I/O.
//!
//! Banana consumes exactly one ordered byte stream per direction, so the
//! transport model is a plain connected stream pair, not multiplexed
//! channels. The trait exists so that production TCP, in-memory pipes, and
//! the simulation harness are interchangeable under the same driver code.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connection-oriented byte transport.
///
/// # Lifecycle
///
/// ```text
/// Server:                      Client:
/// Transport::accept()          Transport::connect(addr)
///   ↓                            ↓
/// (send, recv) halves          (send, recv) halves
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write half of an established connection.
    type SendStream: AsyncWrite + Unpin + Send + 'static;
    /// Read half of an established connection.
    type RecvStream: AsyncRead + Unpin + Send + 'static;

    /// Accept one inbound connection.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the endpoint is shut down or the connection
    /// fails while being established.
    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream)>;

    /// Connect to a remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the remote is unreachable or refuses the
    /// connection.
    async fn connect(&self, remote: SocketAddr) -> io::Result<(Self::SendStream, Self::RecvStream)>;
}

/// Optional transport-security hook consumed by the negotiation driver.
///
/// When the negotiation state machine emits a `StartTls` action, the
/// driver asks this to wrap the current stream pair. Drivers without a
/// security layer simply fail negotiation for peers that require it.
#[async_trait]
pub trait SecureUpgrade: Send + Sync {
    /// Opaque identity material (certificate bytes, key handles) owned by
    /// the embedder.
    type Identity: Send + Sync;

    /// Begin a secure session over the already-connected transport.
    ///
    /// Returns the fingerprint of the peer's verified identity, if it
    /// presented one. The negotiation machine compares this against the
    /// identity the peer *claims* in its hello block.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the secure session cannot be established.
    async fn start_secure_session(
        &self,
        identity: Option<&Self::Identity>,
    ) -> io::Result<Option<String>>;
}
