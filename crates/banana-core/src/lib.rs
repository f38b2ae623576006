//! # Banana core: the object pipeline and the broker
//!
//! This crate contains the protocol logic above the token codec and below
//! the transport: the send-side and receive-side stack machines, the
//! constraint system that guards untrusted input, reference and cycle
//! tracking, the pre-connection negotiation handshake, and the
//! per-connection RPC broker.
//!
//! # Architecture
//!
//! The protocol logic is strictly separated from I/O:
//!
//! ```text
//!      ┌──────────────────────────────┐
//!      │ banana-core                  │
//!      │ - slicer / unslicer engines  │
//!      │ - schema constraints         │
//!      │ - negotiation state machine  │
//!      │ - broker / reference tables  │
//!      └──────────────────────────────┘
//!         ↓                      ↓
//! ┌────────────────┐   ┌────────────────┐
//! │ banana-harness │   │ embedder       │
//! │ (turmoil)      │   │ (tokio)        │
//! │ - virtual time │   │ - real network │
//! │ - seeded RNG   │   │ - system clock │
//! └────────────────┘   └────────────────┘
//! ```
//!
//! State machines accept time as parameters and return actions or bytes;
//! randomness comes through [`env::Environment`]. Nothing in this crate
//! opens a socket or spawns a task.
//!
//! # Modules
//!
//! - [`value`]: the object-graph model, with shared identity and cycles
//! - [`schema`]: constraints and method schemas
//! - [`slicer`] / [`unslicer`] / [`unslicers`]: the two stack machines
//! - [`registry`]: opentype, copyable, and remote-interface tables
//! - [`reference`]: capabilities, trackers, decref bookkeeping
//! - [`call`]: the call/answer/error wire sequences
//! - [`broker`]: the per-connection RPC object
//! - [`negotiate`]: the pre-Banana handshake
//! - [`tub`]: the capability-publication service
//! - [`failure`]: serialized failures
//! - [`env`] / [`transport`]: the seams to the outside world

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod call;
pub mod env;
pub mod failure;
pub mod negotiate;
pub mod promise;
pub mod reference;
pub mod registry;
pub mod schema;
pub mod slicer;
pub mod transport;
pub mod tub;
pub mod unslicer;
pub mod unslicers;
pub mod value;

pub use banana_proto::{BananaError, NegotiationError, RemoteNegotiationError, Violation};

pub use broker::{Broker, BrokerConfig};
pub use call::{CallError, CallHandle};
pub use failure::RemoteFailure;
pub use reference::{Args, LocalRef, Referenceable, RemoteHandle, SturdyRef, TubRef};
pub use schema::{Constraint, MethodSchema, Opentype};
pub use tub::{Tub, TubHandle};
pub use value::{Key, Value};
