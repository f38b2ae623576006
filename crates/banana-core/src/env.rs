//! Environment abstraction for deterministic testing.
//!
//! Protocol logic in this crate never reads the system clock or entropy
//! pool directly. Time arrives as method parameters (`now: Instant`) and
//! randomness comes through this trait, so the harness can substitute a
//! virtual clock and a seeded RNG and reproduce any run exactly.
//!
//! # Invariants
//!
//! - Monotonicity: `now()` never goes backwards within one execution
//!   context.
//! - Determinism: given the same seed, `random_bytes()` produces the same
//!   sequence in simulation.
//! - Production implementations must use a cryptographically secure source
//!   for `random_bytes()` — swiss numbers in published URLs are
//!   capabilities, and guessing one is equivalent to stealing it.

use std::time::{Duration, Instant};

/// Time and randomness provider.
///
/// Implemented by the harness (`SimEnv`: virtual time, seeded ChaCha20)
/// and by embedders (system clock, OS entropy).
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current time. Must never decrease.
    fn now(&self) -> Instant;

    /// Sleep for `duration`. Only driver code awaits this; state machines
    /// express timeouts by comparing instants.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Convenience: a random `u64`, for request and session identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
