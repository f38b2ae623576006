//! Drives the negotiation state machine over a real (or simulated)
//! stream.
//!
//! The state machine itself is pure; this is the glue that executes its
//! actions against a transport, feeds it bytes, and runs its timer off an
//! [`Environment`]. Transport security upgrades are not simulated:
//! `StartTls` actions are rejected, so simulation peers negotiate
//! anonymously.

use std::time::Duration;

use banana_proto::NegotiationError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use banana_core::env::Environment;
use banana_core::negotiate::{
    Action, BananaParams, Negotiation, NegotiationFailure, NegotiationHost,
};
use banana_core::reference::TubRef;

/// The outcome of a completed handshake.
pub struct Switched {
    /// Agreed connection parameters.
    pub params: BananaParams,
    /// Bytes already received past the handshake; feed these to the
    /// broker before reading the stream again.
    pub leftover: Vec<u8>,
    /// The peer's identity, if claimed.
    pub peer: Option<TubRef>,
    /// Whether this side made the decision.
    pub is_master: bool,
}

/// Run one side's negotiation to completion.
///
/// # Errors
///
/// Returns the [`NegotiationFailure`] after executing the machine's
/// best-effort diagnostic and closing actions.
pub async fn drive_negotiation<S>(
    stream: &mut S,
    mut machine: Negotiation,
    host: &mut dyn NegotiationHost,
    env: &impl Environment,
) -> Result<Switched, NegotiationFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let actions = machine.connection_made(env.now());
    if let Some(switched) = execute(stream, &mut machine, actions).await? {
        return Ok(switched);
    }

    let mut buf = [0u8; 4096];
    loop {
        let read = tokio::select! {
            read = stream.read(&mut buf) => read,
            () = env.sleep(Duration::from_secs(1)) => {
                let actions = machine.tick(env.now());
                if let Some(switched) = execute(stream, &mut machine, actions).await? {
                    return Ok(switched);
                }
                continue;
            }
        };
        let n = match read {
            Ok(0) | Err(_) => {
                return Err(NegotiationFailure::Local(NegotiationError(
                    "connection lost during negotiation".to_string(),
                )))
            }
            Ok(n) => n,
        };
        let actions = match machine.feed(&buf[..n], env.now(), host) {
            Ok(actions) => actions,
            Err(failure) => {
                let actions = machine.abandon_actions(&failure);
                let _ = execute(stream, &mut machine, actions).await;
                return Err(failure);
            }
        };
        if let Some(switched) = execute(stream, &mut machine, actions).await? {
            return Ok(switched);
        }
    }
}

async fn execute<S>(
    stream: &mut S,
    machine: &mut Negotiation,
    actions: Vec<Action>,
) -> Result<Option<Switched>, NegotiationFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for action in actions {
        match action {
            Action::SendText(bytes) => {
                // best effort: the peer may already be gone
                let _ = stream.write_all(&bytes).await;
            }
            Action::StartTls => {
                let failure = NegotiationFailure::Local(NegotiationError(
                    "transport security is not available in the harness".to_string(),
                ));
                let actions = machine.abandon_actions(&failure);
                for action in actions {
                    if let Action::SendText(bytes) = action {
                        let _ = stream.write_all(&bytes).await;
                    }
                }
                return Err(failure);
            }
            Action::SwitchToBanana { params, leftover, peer, is_master } => {
                return Ok(Some(Switched { params, leftover, peer, is_master }));
            }
            Action::Close { reason } => {
                return Err(NegotiationFailure::Local(NegotiationError(reason)));
            }
        }
    }
    Ok(None)
}
