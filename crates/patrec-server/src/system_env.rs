//! Production Environment implementation using system time and OS entropy.
//!
//! `SystemEnv` uses the monotonic clock for TTL checks and getrandom to seed
//! the router's problem generator. Production behavior is therefore not
//! reproducible; tests substitute a virtual clock.

use patrec_core::env::Environment;

/// Production environment using the monotonic clock and OS randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. This indicates an OS-level fault and the
/// process cannot seed its generators without it.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
