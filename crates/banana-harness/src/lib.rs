//! Deterministic test harness for the Banana stack.
//!
//! Provides a seeded [`SimEnv`], a turmoil-backed [`SimTransport`], and
//! in-memory engine/broker pairs so protocol tests run without sockets,
//! wall clocks, or entropy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod negotiate_driver;
pub mod pipe;
pub mod sim_env;
pub mod sim_transport;

pub use negotiate_driver::{drive_negotiation, Switched};
pub use pipe::{BrokerPair, ValuePipe};
pub use sim_env::SimEnv;
pub use sim_transport::SimTransport;
