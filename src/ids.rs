//! Event identifier generation

use rand::rngs::OsRng;
use rand::{RngCore, TryRngCore};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use uuid::Builder;

type EntropyFn = fn(&mut [u8; 16]) -> Result<(), String>;

/// Produces RFC 4122 v4 identifiers, preferring OS entropy and falling back
/// to the thread-local generator when the OS source is unavailable.
#[derive(Debug)]
pub struct IdGenerator {
    primary: EntropyFn,
    fallbacks: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_entropy(os_entropy)
    }

    pub(crate) fn with_entropy(primary: EntropyFn) -> Self {
        Self {
            primary,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Generate a new event identifier
    pub fn next_id(&self) -> String {
        let mut bytes = [0u8; 16];

        if let Err(e) = (self.primary)(&mut bytes) {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            warn!("OS entropy unavailable, using fallback id generator: {}", e);
            rand::rng().fill_bytes(&mut bytes);
        }

        Builder::from_random_bytes(bytes)
            .into_uuid()
            .hyphenated()
            .to_string()
    }

    /// Number of ids produced by the fallback strategy
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

fn os_entropy(bytes: &mut [u8; 16]) -> Result<(), String> {
    OsRng.try_fill_bytes(bytes).map_err(|e| e.to_string())
}
