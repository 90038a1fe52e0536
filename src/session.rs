//! Per-request identifiers and key seeds.
//!
//! Everything here is stateless beyond a single call: a correlation token or
//! key seed is generated, handed to the caller, and forgotten. The caller
//! owns the lifecycle of any private key derived from a seed; this process
//! never retains one.

use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

/// Length of a PSI key seed in bytes.
pub const KEY_SEED_LEN: usize = 32;

/// Entropy behind a correlation token (4 bytes, rendered as 8 hex chars).
/// Tokens are caller-side bookkeeping only; collisions are the caller's
/// problem and astronomically unlikely at this size for realistic loads.
const CORRELATION_TOKEN_BYTES: usize = 4;

/// Entropy failures.
#[derive(Debug, Error)]
pub enum EntropyError {
    #[error("system RNG unavailable")]
    Unavailable,
}

/// Injected source of cryptographically strong randomness.
///
/// The async variant exists for hosts whose RNG is only reachable through an
/// async API; the default implementation just delegates to the sync path.
#[async_trait]
pub trait EntropyProvider: Send + Sync {
    /// Fill `buf` with cryptographically strong random bytes.
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), EntropyError>;

    /// Async variant of [`fill_random`](Self::fill_random).
    async fn fill_random_async(&self, buf: &mut [u8]) -> Result<(), EntropyError> {
        self.fill_random(buf)
    }
}

/// OS-backed entropy via `ring`.
#[derive(Clone)]
pub struct SystemEntropy {
    rng: SystemRandom,
}

impl SystemEntropy {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SystemEntropy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntropyProvider for SystemEntropy {
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), EntropyError> {
        self.rng.fill(buf).map_err(|_| EntropyError::Unavailable)
    }
}

/// A fresh 32-byte seed for deriving exactly one PSI private key.
///
/// Zeroized on drop. A seed is requested per engine invocation and never
/// reused across calls.
#[derive(ZeroizeOnDrop)]
pub struct KeySeed([u8; KEY_SEED_LEN]);

impl KeySeed {
    pub fn as_bytes(&self) -> &[u8; KEY_SEED_LEN] {
        &self.0
    }
}

/// Generates per-request correlation tokens and key seeds.
pub struct SessionKeyManager<P: EntropyProvider> {
    entropy: P,
}

impl<P: EntropyProvider> SessionKeyManager<P> {
    pub fn new(entropy: P) -> Self {
        Self { entropy }
    }

    /// Short random hex token for caller-side bookkeeping.
    ///
    /// No uniqueness is enforced here; the token only lets the caller
    /// re-associate a stored private key with a transaction later.
    pub fn new_correlation_token(&self) -> Result<String, EntropyError> {
        let mut bytes = [0u8; CORRELATION_TOKEN_BYTES];
        self.entropy.fill_random(&mut bytes)?;
        Ok(hex::encode(bytes))
    }

    /// Fresh 32-byte key seed for exactly one engine invocation.
    pub fn new_key_seed(&self) -> Result<KeySeed, EntropyError> {
        let mut bytes = [0u8; KEY_SEED_LEN];
        self.entropy.fill_random(&mut bytes)?;
        Ok(KeySeed(bytes))
    }
}

impl SessionKeyManager<SystemEntropy> {
    /// Manager backed by the OS RNG.
    pub fn system() -> Self {
        Self::new(SystemEntropy::new())
    }
}
