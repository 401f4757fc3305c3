//! Accountable anonymous broadcast over a cryptographic shuffle round.
//!
//! A [ShuffleRound] lets a fixed group of N mutually-distrustful peers each
//! contribute one fixed-size message so that every peer learns the multiset
//! of contributed messages, while no honest peer's message is linkable to
//! its author, as long as at least one peer shuffles honestly. Submissions
//! are onion-encrypted twice (an inner layer protecting the payload and an
//! outer layer protecting the mix), passed through every peer for one peel
//! and one secret permutation each, and only decrypted after the whole
//! group signs off on the shuffled output.
//!
//! Honest-but-failed runs do not end silently: any detected violation
//! (duplicate ciphertexts, an undecryptable block, a NoGo vote, diverging
//! view commitments) escalates into a blame phase in which every peer
//! reveals its outer key and its signed transcript of the run. The
//! transcripts are cross-checked and deterministically replayed
//! ([blame::Blamer]) to accuse at least one provably misbehaving peer.
//!
//! # Integration
//!
//! The round is sans-network: the host supplies a [Transport] for outbound
//! envelopes and a [Reporter] for delivered cleartexts, and feeds every
//! inbound envelope to [ShuffleRound::handle]. The host must serialize
//! those calls (a round is single-threaded) and must provide
//! order-preserving, exactly-once delivery per peer pair. The round never
//! blocks and has no timeouts; discarding a stalled round is the host's
//! decision, and dropping it releases all round keys.
//!
//! # Example
//!
//! Three peers exchange `"a"`, `"b"`, `"c"` over an in-memory transport:
//!
//! ```
//! use bytes::Bytes;
//! use mixcast::crypto::ed25519;
//! use mixcast::mocks::{Mailbox, Relay};
//! use mixcast::{Config, Group, ShuffleRound};
//! use rand_chacha::ChaCha20Rng;
//! use rand_core::SeedableRng;
//!
//! let mut rng = ChaCha20Rng::seed_from_u64(42);
//! let signers: Vec<ed25519::PrivateKey> =
//!     (0..3).map(|_| ed25519::PrivateKey::from_rng(&mut rng)).collect();
//! let group = Group::new(signers.iter().map(|s| s.public_key()).collect());
//! let relay = Relay::new(group.iter().cloned().collect());
//! let mailboxes: Vec<Mailbox> = (0..3).map(|_| Mailbox::new()).collect();
//!
//! let payloads = [&b"a"[..], &b"b"[..], &b"c"[..]];
//! let mut rounds: Vec<_> = signers
//!     .iter()
//!     .enumerate()
//!     .map(|(i, signer)| {
//!         ShuffleRound::new(
//!             ChaCha20Rng::seed_from_u64(i as u64),
//!             Config {
//!                 signer: signer.clone(),
//!                 group: group.clone(),
//!                 session: [0u8; 32],
//!                 round: [1u8; 32],
//!                 block_size: 64,
//!                 message: Some(Bytes::copy_from_slice(payloads[i])),
//!             },
//!             relay.link(i),
//!             mailboxes[i].clone(),
//!         )
//!     })
//!     .collect();
//!
//! for round in &mut rounds {
//!     assert!(round.start());
//! }
//! while let Some((to, from, envelope)) = relay.pop() {
//!     rounds[to].handle(&from, envelope);
//! }
//!
//! for (round, mailbox) in rounds.iter().zip(&mailboxes) {
//!     assert!(round.successful());
//!     let mut delivered = mailbox.delivered();
//!     delivered.sort();
//!     assert_eq!(delivered, vec![Bytes::from(&b"a"[..]), Bytes::from(&b"b"[..]), Bytes::from(&b"c"[..])]);
//! }
//! ```

use bytes::Bytes;

pub mod blame;
pub mod codec;
pub mod crypto;
pub mod group;
pub mod mocks;
pub mod onion;
pub mod round;
pub mod transcript;
pub mod wire;

pub use group::Group;
pub use round::{Config, Error, ShuffleRound, State};
pub use transcript::Transcript;

/// Identifier of one shuffle round, embedded in every signed payload to
/// prevent cross-round replay.
pub type RoundId = [u8; 32];

/// Identifier of the enclosing session.
pub type SessionId = [u8; 32];

/// Outbound half of the host's transport.
///
/// Both calls are non-blocking hand-offs. The transport must deliver
/// envelopes between each pair of peers in order and exactly once; it never
/// carries a peer's messages to itself (the round processes its own copies
/// synchronously).
pub trait Transport {
    /// Hands an envelope to every other peer in the group.
    fn broadcast(&mut self, message: Bytes);

    /// Hands an envelope to one peer.
    fn send(&mut self, to: &crypto::ed25519::PublicKey, message: Bytes);
}

/// The host's view of a round's outcomes.
pub trait Reporter {
    /// An anonymous cleartext recovered by a successful round.
    ///
    /// Called once per delivered message, duplicates included; the round
    /// does not deduplicate on the host's behalf.
    fn deliver(&mut self, message: Bytes);

    /// The round reached a terminal state; no further callbacks follow.
    fn close(&mut self, reason: &str);
}
