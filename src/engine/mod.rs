//! PSI engine capability.
//!
//! The cryptographic engine is consumed through a trait seam so the
//! dispatcher can be exercised against a mock, mirroring how the rest of the
//! process treats it: a black box exposing client/server instance
//! construction, set encryption, response processing, setup-message
//! construction, and intersection computation.
//!
//! Engine instances are transient per-call objects. Their release is bound to
//! scope (`Drop`), so no handler exit path can leak one.

pub mod ecdh;
pub mod gcs;
pub mod mock;

pub use ecdh::EcdhPsiEngine;
pub use gcs::GolombCodedSet;
pub use mock::MockPsiEngine;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Length of a PSI private key in bytes.
pub const KEY_LEN: usize = 32;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine operation errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The supplied private key bytes do not form a usable key.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// A wire message decoded structurally but its contents are unusable.
    #[error("malformed engine message: {0}")]
    MalformedMessage(String),

    /// Internal engine failure.
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Client request: the client's item set, encrypted under its ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub reveal_intersection: bool,
    pub encrypted_elements: Vec<Vec<u8>>,
}

impl Request {
    /// Number of encrypted client elements.
    ///
    /// The server setup message is sized from THIS count, not from the
    /// server's own set size; the false-positive-rate math depends on it.
    pub fn num_encrypted_elements(&self) -> usize {
        self.encrypted_elements.len()
    }
}

/// Server response: the client's encrypted elements, re-encrypted under the
/// server's key, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub encrypted_elements: Vec<Vec<u8>>,
}

/// Membership structure selector for the server setup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupStructure {
    /// Golomb-coded set: compact, probabilistic (bounded false-positive rate).
    Gcs,
    /// Plain sorted hash list: exact, larger on the wire.
    Raw,
}

/// Server setup message: a membership structure over the server's encrypted
/// set, against which the client tests its unblinded elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerSetup {
    Gcs(GolombCodedSet),
    Raw(RawSetup),
}

/// Exact membership list variant of the setup message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSetup {
    /// Sorted, deduplicated 64-bit element hashes.
    pub element_hashes: Vec<u64>,
}

impl ServerSetup {
    /// Decode the structure once into a queryable membership set.
    pub fn membership(&self) -> SetupMembership {
        match self {
            ServerSetup::Gcs(gcs) => SetupMembership {
                values: gcs.values().into_iter().collect(),
                hash_range: Some(gcs.hash_range()),
            },
            ServerSetup::Raw(raw) => SetupMembership {
                values: raw.element_hashes.iter().copied().collect(),
                hash_range: None,
            },
        }
    }
}

/// Queryable view of a [`ServerSetup`].
pub struct SetupMembership {
    values: HashSet<u64>,
    hash_range: Option<u64>,
}

impl SetupMembership {
    /// Test a full 64-bit element hash against the structure.
    pub fn contains(&self, element_hash: u64) -> bool {
        match self.hash_range {
            Some(range) => self.values.contains(&(element_hash % range)),
            None => self.values.contains(&element_hash),
        }
    }
}

/// Full 64-bit hash of an encrypted element's byte representation.
pub(crate) fn element_hash64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Factory for per-call engine instances.
pub trait PsiEngine: Send + Sync + 'static {
    type Client: PsiClient;
    type Server: PsiServer;

    /// Build a client instance from 32 key bytes. The bytes act as the
    /// private key: exporting and re-importing them reconstructs the same
    /// instance, which is how `ComputeIntersection` resumes a handshake.
    fn client_from_key(
        &self,
        key: &[u8; KEY_LEN],
        reveal_intersection: bool,
    ) -> EngineResult<Self::Client>;

    /// Build a server instance from 32 key bytes.
    fn server_from_key(
        &self,
        key: &[u8; KEY_LEN],
        reveal_intersection: bool,
    ) -> EngineResult<Self::Server>;
}

/// Transient client-role instance. Released when dropped.
pub trait PsiClient {
    /// Encrypt the client's items into a request, preserving item order.
    fn create_request(&self, items: &[String]) -> EngineResult<Request>;

    /// Export the private key so the caller can resume later.
    fn private_key_bytes(&self) -> [u8; KEY_LEN];

    /// Compute intersection indices into the original request's item order.
    /// Order of the returned indices is NOT guaranteed.
    fn intersection(&self, setup: &ServerSetup, response: &Response) -> EngineResult<Vec<u64>>;
}

/// Transient server-role instance. Released when dropped.
pub trait PsiServer {
    /// Re-encrypt the client's elements under the server key, in order.
    fn process_request(&self, request: &Request) -> EngineResult<Response>;

    /// Build the setup message over the server's own items.
    ///
    /// `num_client_elements` is the encrypted-element count of the client's
    /// request and controls the corrected per-probe false-positive rate.
    fn create_setup_message(
        &self,
        false_positive_rate: f64,
        num_client_elements: usize,
        items: &[String],
        structure: SetupStructure,
    ) -> EngineResult<ServerSetup>;
}
