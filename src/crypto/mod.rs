//! The cryptographic suite driven by the shuffle round.
//!
//! Three primitives, each behind its own module: [ed25519] long-term signing
//! identities, [seal] per-round asymmetric encryption, and [sha256] hashing.
//! Failures are values everywhere; no primitive panics on attacker-controlled
//! input.

pub mod ed25519;
pub mod seal;
pub mod sha256;

pub use sha256::{Digest, Sha256};
