//! Psigrid - PSI Handshake Orchestration Service
//!
//! Sidecar process that drives the three-message private-set-intersection
//! handshake for private schedule matching. Two untrusted parties (a client
//! holding a grid of time slots and a server holding another) learn which
//! slots they share without revealing anything else.
//!
//! Key principles:
//! - NO session state (per-request keys are returned to the caller, never kept)
//! - Text-only protocol (JSON envelopes, base64 payloads)
//! - Engine instances are per-call and released deterministically
//! - One reply per command, in arrival order

pub mod codec;
pub mod engine;
pub mod protocol;
pub mod session;
