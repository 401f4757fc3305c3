//! The shuffle round state machine.
//!
//! One [ShuffleRound] executes one run of the anonymous-broadcast protocol
//! among a fixed group of N peers. Every peer contributes one fixed-size
//! block (possibly the explicit empty block) and, if the run succeeds, every
//! peer learns the multiset of contributed cleartexts without any of them
//! being linkable to its author, as long as at least one peer shuffled
//! honestly.
//!
//! The protocol proceeds through seven phases:
//!
//! 1. **Key sharing**: every peer broadcasts a fresh inner and outer
//!    encryption key pair for this round.
//! 2. **Submission**: every peer onion-encrypts its block under all inner
//!    keys, then under all outer keys, and sends the result to peer 0.
//! 3. **Shuffle**: each peer in ring order peels one outer layer off every
//!    block, permutes the blocks secretly, and passes them on; the last peer
//!    broadcasts the fully outer-peeled common view.
//! 4. **Verification**: every peer checks that its own inner ciphertext
//!    survived and votes Go (with a commitment to the whole view) or NoGo.
//! 5. **Reveal**: after a unanimous Go with matching commitments, every peer
//!    broadcasts its inner private key.
//! 6. **Decryption**: every peer peels the inner layers locally and hands
//!    each non-empty cleartext to the host.
//! 7. **Blame** (on any detected violation): peers exchange signed
//!    transcripts and outer keys, cross-check the attestations, and replay
//!    the run to name at least one culprit (see [crate::blame]).
//!
//! The round is a single-threaded, message-driven state machine: the host
//! serializes [ShuffleRound::handle] calls and the round never blocks.
//! Messages the round sends to itself are processed synchronously, never
//! through the transport.

use crate::blame::Blamer;
use crate::codec::{self, Codec};
use crate::crypto::{ed25519, seal, Digest, Sha256};
use crate::group::Group;
use crate::onion;
use crate::transcript::Transcript;
use crate::wire::{self, Message, Payload};
use crate::{Reporter, RoundId, SessionId, Transport};
use bytes::Bytes;
use rand_core::{CryptoRng, RngCore};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Protocol phase of a [ShuffleRound].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Offline,
    KeySharing,
    DataSubmission,
    WaitingForShuffle,
    Shuffling,
    ShuffleDone,
    Verification,
    PrivateKeySharing,
    Decryption,
    Finished,
    BlameInit,
    BlameShare,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::KeySharing => "key sharing",
            Self::DataSubmission => "data submission",
            Self::WaitingForShuffle => "waiting for shuffle",
            Self::Shuffling => "shuffling",
            Self::ShuffleDone => "shuffle done",
            Self::Verification => "verification",
            Self::PrivateKeySharing => "private key sharing",
            Self::Decryption => "decryption",
            Self::Finished => "finished",
            Self::BlameInit => "blame init",
            Self::BlameShare => "blame share",
        })
    }
}

/// Reasons an envelope is rejected at the dispatch boundary.
///
/// A rejection never mutates the round: the offending envelope is popped
/// from the transcript and the round keeps running, so a faulty sender
/// cannot pollute another peer's evidence.
#[derive(Debug, Error)]
pub enum Error {
    /// The sender is not a member of this round's group.
    #[error("sender is not a group member")]
    UnknownPeer,
    /// The envelope failed signature or structural checks.
    #[error(transparent)]
    Envelope(#[from] wire::Error),
    /// The payload names a different round.
    #[error("message for a different round")]
    WrongRound,
    /// The message cannot be processed in the current state.
    #[error("{kind} message cannot be processed while {state}")]
    Misordered {
        kind: &'static str,
        state: State,
    },
    /// The sender already supplied this message.
    #[error("duplicate {kind} message")]
    Duplicate { kind: &'static str },
    /// The sender supplied different bytes for a slot it already filled.
    #[error("conflicting submission from the same sender")]
    Equivocation,
    /// A submission was sent to a peer other than the collector.
    #[error("submissions are collected by the first peer only")]
    NotCollector,
    /// The message had to come from a specific peer and did not.
    #[error("message from an unexpected sender")]
    WrongSender,
    /// A submission carried no ciphertext at all.
    #[error("empty submission")]
    EmptySubmission,
    /// A revealed private key does not match the announced public key.
    #[error("revealed key does not match the announced public key")]
    KeyMismatch,
    /// A blame attestation signature failed to verify.
    #[error("invalid blame attestation")]
    BadAttestation,
    /// A blame transcript failed to deserialize.
    #[error("malformed blame evidence: {0}")]
    MalformedEvidence(codec::Error),
    /// A blame verification did not cover the whole group.
    #[error("blame verification must carry one slot per peer")]
    IncompleteReport,
}

/// Everything needed to construct a [ShuffleRound].
pub struct Config {
    /// The local peer's long-term signing key; its public half must be a
    /// group member.
    pub signer: ed25519::PrivateKey,
    /// The round's ordered peer directory.
    pub group: Group,
    /// Identifier of the enclosing session, for diagnostics.
    pub session: SessionId,
    /// Identifier of this round, embedded in every signed payload.
    pub round: RoundId,
    /// Plaintext block size; submissions up to this many bytes fit.
    pub block_size: usize,
    /// The local submission, or `None` to participate without a message.
    pub message: Option<Bytes>,
}

/// A single execution of the shuffle protocol for one peer.
pub struct ShuffleRound<E: RngCore + CryptoRng, T: Transport, R: Reporter> {
    rng: E,
    transport: T,
    reporter: R,

    signer: ed25519::PrivateKey,
    group: Group,
    me: usize,
    round: RoundId,
    block_size: usize,

    state: State,
    /// Phase that was interrupted when blame engaged.
    interrupted: Option<State>,

    /// The local submission, framed to the block size.
    data: Bytes,
    inner_key: seal::PrivateKey,
    outer_key: seal::PrivateKey,

    /// Announced public keys, indexed by onion slot (reverse group order).
    public_inner: Vec<Option<seal::PublicKey>>,
    public_outer: Vec<Option<seal::PublicKey>>,
    keys_received: usize,

    inner_ciphertext: Bytes,
    outer_ciphertext: Bytes,

    /// The pipeline entering this peer: gathered submissions at peer 0,
    /// the predecessor's output elsewhere.
    shuffle_input: Vec<Bytes>,
    submissions: usize,

    /// The fully outer-peeled view broadcast by the last peer.
    common_view: Vec<Bytes>,

    vote_received: Vec<bool>,
    votes: Vec<bool>,
    vote_count: usize,
    commitment: Option<Digest>,
    commitments: Vec<Option<Digest>>,

    /// Revealed keys, indexed by natural group order.
    private_inner: Vec<Option<seal::PrivateKey>>,
    reveals: usize,

    transcript: Transcript,

    private_outer: Vec<Option<seal::PrivateKey>>,
    evidence: Vec<Option<Transcript>>,
    attestations: Vec<Option<Bytes>>,
    attestation_signatures: Vec<Option<ed25519::Signature>>,
    blames: usize,
    reports: Vec<Option<(Vec<Bytes>, Vec<ed25519::Signature>)>>,
    report_count: usize,

    successful: bool,
    bad_members: Vec<usize>,
}

impl<E: RngCore + CryptoRng, T: Transport, R: Reporter> ShuffleRound<E, T, R> {
    /// Builds a round for the local peer.
    ///
    /// Fresh inner and outer key pairs are drawn from `rng`; they live
    /// exactly as long as the round and are dropped with it.
    ///
    /// # Panics
    ///
    /// Panics if the signer's public key is not a group member.
    pub fn new(mut rng: E, config: Config, transport: T, reporter: R) -> Self {
        let me = config
            .group
            .index(&config.signer.public_key())
            .expect("local signer must be a group member");
        let n = config.group.len();

        let data = match config.message {
            None => wire::default_block(config.block_size),
            Some(message) if message.len() > config.block_size => {
                warn!(
                    me,
                    len = message.len(),
                    block_size = config.block_size,
                    "submission exceeds the block size, participating empty"
                );
                wire::default_block(config.block_size)
            }
            Some(message) => {
                debug!(me, len = message.len(), "submitting a real message");
                wire::frame(config.block_size, &message)
            }
        };

        let inner_key = seal::PrivateKey::from_rng(&mut rng);
        let outer_key = seal::PrivateKey::from_rng(&mut rng);
        debug!(
            me,
            session = ?config.session,
            round = ?config.round,
            peers = n,
            "round constructed"
        );

        Self {
            rng,
            transport,
            reporter,
            signer: config.signer,
            group: config.group,
            me,
            round: config.round,
            block_size: config.block_size,
            state: State::Offline,
            interrupted: None,
            data,
            inner_key,
            outer_key,
            public_inner: vec![None; n],
            public_outer: vec![None; n],
            keys_received: 0,
            inner_ciphertext: Bytes::new(),
            outer_ciphertext: Bytes::new(),
            shuffle_input: Vec::new(),
            submissions: 0,
            common_view: Vec::new(),
            vote_received: vec![false; n],
            votes: vec![false; n],
            vote_count: 0,
            commitment: None,
            commitments: vec![None; n],
            private_inner: vec![None; n],
            reveals: 0,
            transcript: Transcript::new(),
            private_outer: vec![None; n],
            evidence: vec![None; n],
            attestations: vec![None; n],
            attestation_signatures: vec![None; n],
            blames: 0,
            reports: vec![None; n],
            report_count: 0,
            successful: false,
            bad_members: Vec::new(),
        }
    }

    /// Starts the round by broadcasting the local round keys.
    ///
    /// Returns `false` (and does nothing) if the round already started.
    pub fn start(&mut self) -> bool {
        if self.state != State::Offline {
            warn!(me = self.me, "round started more than once");
            return false;
        }
        if self.me == 0 {
            self.shuffle_input = vec![Bytes::new(); self.group.len()];
        }
        self.state = State::KeySharing;
        self.broadcast(Payload::PublicKeys {
            inner: self.inner_key.public_key(),
            outer: self.outer_key.public_key(),
        });
        true
    }

    /// Whether the round delivered its cleartexts.
    pub const fn successful(&self) -> bool {
        self.successful
    }

    /// Group indexes accused by a completed blame phase.
    pub fn bad_members(&self) -> &[usize] {
        &self.bad_members
    }

    /// Current protocol phase.
    pub const fn state(&self) -> State {
        self.state
    }

    /// Phase that was interrupted when blame engaged, if any.
    pub const fn interrupted(&self) -> Option<State> {
        self.interrupted
    }

    /// Processes one raw envelope received from `from`.
    ///
    /// The envelope is appended to the evidence transcript first; if any
    /// check rejects it, the entry is popped again so rejected envelopes
    /// never become evidence.
    pub fn handle(&mut self, from: &ed25519::PublicKey, envelope: Bytes) {
        self.transcript.append(from.clone(), envelope.clone());
        if let Err(reason) = self.dispatch(from, &envelope) {
            warn!(
                me = self.me,
                peer = ?from,
                state = %self.state,
                %reason,
                "rejected envelope"
            );
            self.transcript.pop();
        }
    }

    fn dispatch(&mut self, from: &ed25519::PublicKey, envelope: &[u8]) -> Result<(), Error> {
        let sender = self.group.index(from).ok_or(Error::UnknownPeer)?;
        let message = wire::open_envelope(self.group.id(sender), envelope)?;
        if message.round != self.round {
            return Err(Error::WrongRound);
        }
        debug!(
            me = self.me,
            sender,
            kind = message.payload.name(),
            state = %self.state,
            "received message"
        );
        match message.payload {
            Payload::PublicKeys { inner, outer } => self.on_public_keys(sender, inner, outer),
            Payload::Data { block } => self.on_data(sender, block),
            Payload::ShuffleData { blocks } => self.on_shuffle_data(sender, blocks),
            Payload::EncryptedData { blocks } => self.on_common_view(sender, blocks),
            Payload::Go { commitment } => self.on_vote(sender, true, Some(commitment)),
            Payload::NoGo => self.on_vote(sender, false, None),
            Payload::PrivateKey { inner } => self.on_private_key(sender, inner),
            Payload::BlameData {
                outer,
                transcript,
                signature,
            } => self.on_blame(sender, outer, transcript, signature),
            Payload::BlameVerification {
                attestations,
                signatures,
            } => self.on_blame_verification(sender, attestations, signatures),
        }
    }

    fn misordered(&self, kind: &'static str) -> Error {
        Error::Misordered {
            kind,
            state: self.state,
        }
    }

    fn on_public_keys(
        &mut self,
        sender: usize,
        inner: seal::PublicKey,
        outer: seal::PublicKey,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::Offline | State::KeySharing) {
            return Err(self.misordered("public keys"));
        }
        let slot = self.group.onion_slot(sender);
        if self.public_inner[slot].is_some() || self.public_outer[slot].is_some() {
            return Err(Error::Duplicate { kind: "public keys" });
        }
        self.public_inner[slot] = Some(inner);
        self.public_outer[slot] = Some(outer);
        self.keys_received += 1;
        if self.keys_received == self.group.len() {
            self.submit_data();
        }
        Ok(())
    }

    fn submit_data(&mut self) {
        self.state = State::DataSubmission;

        let inner_keys = announced(&self.public_inner);
        let outer_keys = announced(&self.public_outer);
        self.inner_ciphertext = onion::encrypt(&mut self.rng, &inner_keys, &self.data);
        self.outer_ciphertext = onion::encrypt(&mut self.rng, &outer_keys, &self.inner_ciphertext);
        debug!(me = self.me, "submitting the onion-encrypted block");

        self.state = State::WaitingForShuffle;
        self.send(
            Payload::Data {
                block: self.outer_ciphertext.clone(),
            },
            0,
        );
    }

    fn on_data(&mut self, sender: usize, block: Bytes) -> Result<(), Error> {
        if !matches!(
            self.state,
            State::KeySharing | State::DataSubmission | State::WaitingForShuffle
        ) {
            return Err(self.misordered("data"));
        }
        if self.me != 0 {
            return Err(Error::NotCollector);
        }
        if block.is_empty() {
            return Err(Error::EmptySubmission);
        }
        let existing = &self.shuffle_input[sender];
        if !existing.is_empty() {
            return Err(if *existing == block {
                Error::Duplicate { kind: "data" }
            } else {
                // Different bytes for the same slot is equivocation, not a
                // retransmission; keep the distinction in the diagnostics.
                Error::Equivocation
            });
        }
        self.shuffle_input[sender] = block;
        self.submissions += 1;
        if self.submissions == self.group.len() {
            self.shuffle();
        }
        Ok(())
    }

    fn on_shuffle_data(&mut self, sender: usize, blocks: Vec<Bytes>) -> Result<(), Error> {
        if self.state != State::WaitingForShuffle {
            return Err(self.misordered("shuffle"));
        }
        if self.me == 0 || sender + 1 != self.me {
            return Err(Error::WrongSender);
        }
        self.shuffle_input = blocks;
        self.shuffle();
        Ok(())
    }

    fn shuffle(&mut self) {
        self.state = State::Shuffling;
        debug!(me = self.me, "shuffling");

        // Byte-equal blocks can never be two independent submissions; one of
        // the submitters copied another, which would let it deanonymize the
        // victim after decryption.
        for i in 0..self.shuffle_input.len() {
            for j in 0..i {
                if self.shuffle_input[i] == self.shuffle_input[j] {
                    warn!(me = self.me, i, j, "duplicate ciphertexts in the pipeline");
                    self.start_blame();
                    return;
                }
            }
        }

        let mut peeled = match onion::peel(&self.outer_key, &self.shuffle_input) {
            Ok(peeled) => peeled,
            Err(failed) => {
                warn!(me = self.me, ?failed, "blocks failed the outer peel");
                self.start_blame();
                return;
            }
        };
        onion::permute(&mut self.rng, &mut peeled);

        self.state = State::ShuffleDone;
        if self.me + 1 == self.group.len() {
            self.broadcast(Payload::EncryptedData { blocks: peeled });
        } else {
            self.send(Payload::ShuffleData { blocks: peeled }, self.me + 1);
        }
    }

    fn on_common_view(&mut self, sender: usize, blocks: Vec<Bytes>) -> Result<(), Error> {
        if self.state != State::ShuffleDone {
            return Err(self.misordered("encrypted data"));
        }
        if sender + 1 != self.group.len() {
            return Err(Error::WrongSender);
        }
        self.common_view = blocks;
        self.verify_view();
        Ok(())
    }

    fn verify_view(&mut self) {
        let n = self.group.len();
        let found =
            self.common_view.len() == n && self.common_view.contains(&self.inner_ciphertext);
        if !found {
            warn!(me = self.me, "own submission missing from the common view");
            self.broadcast(Payload::NoGo);
            return;
        }

        let mut hasher = Sha256::new();
        for ((inner, outer), block) in announced(&self.public_inner)
            .iter()
            .zip(announced(&self.public_outer).iter())
            .zip(self.common_view.iter())
        {
            hasher.update(inner.as_bytes());
            hasher.update(outer.as_bytes());
            hasher.update(block);
        }
        let commitment = hasher.finalize();
        self.commitment = Some(commitment);
        self.state = State::Verification;
        self.broadcast(Payload::Go { commitment });
    }

    fn on_vote(
        &mut self,
        sender: usize,
        go: bool,
        commitment: Option<Digest>,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::Verification | State::ShuffleDone) {
            return Err(self.misordered("vote"));
        }
        if self.vote_received[sender] {
            return Err(Error::Duplicate { kind: "vote" });
        }
        self.vote_received[sender] = true;
        self.votes[sender] = go;
        self.commitments[sender] = commitment;
        self.vote_count += 1;
        if self.vote_count < self.group.len() {
            return Ok(());
        }

        let n = self.group.len();
        let unanimous = (0..n).all(|i| self.votes[i] && self.commitments[i] == self.commitment);
        if unanimous {
            self.reveal_inner_key();
        } else {
            warn!(me = self.me, "verification votes disagree");
            self.start_blame();
        }
        Ok(())
    }

    fn reveal_inner_key(&mut self) {
        debug!(me = self.me, "votes unanimous, revealing the inner key");
        self.state = State::PrivateKeySharing;
        self.broadcast(Payload::PrivateKey {
            inner: self.inner_key.clone(),
        });
    }

    fn on_private_key(&mut self, sender: usize, key: seal::PrivateKey) -> Result<(), Error> {
        if !matches!(self.state, State::Verification | State::PrivateKeySharing) {
            return Err(self.misordered("private key"));
        }
        if self.private_inner[sender].is_some() {
            return Err(Error::Duplicate { kind: "private key" });
        }
        let slot = self.group.onion_slot(sender);
        let Some(expected) = self.public_inner[slot].as_ref() else {
            return Err(Error::KeyMismatch);
        };
        if !key.matches(expected) {
            return Err(Error::KeyMismatch);
        }
        self.private_inner[sender] = Some(key);
        self.reveals += 1;
        if self.reveals == self.group.len() {
            self.decrypt_view();
        }
        Ok(())
    }

    fn decrypt_view(&mut self) {
        self.state = State::Decryption;

        let keys: Vec<seal::PrivateKey> = self.private_inner.iter().flatten().cloned().collect();
        let mut blocks = self.common_view.clone();
        for (layer, key) in keys.iter().enumerate() {
            match onion::peel(key, &blocks) {
                Ok(peeled) => blocks = peeled,
                Err(failed) => {
                    // The group already committed to the shuffle output with
                    // signed, matching commitments, so there is no evidence
                    // left to exchange: the round just fails.
                    warn!(me = self.me, layer, ?failed, "final decryption failed");
                    self.finish(false, "round unsuccessfully finished");
                    return;
                }
            }
        }

        for block in &blocks {
            if let Some(message) = wire::unframe(self.block_size, block) {
                debug!(me = self.me, len = message.len(), "delivering a message");
                self.reporter.deliver(message);
            }
        }
        self.finish(true, "round successfully finished");
    }

    fn start_blame(&mut self) {
        if self.state == State::BlameInit {
            warn!(me = self.me, "already collecting blame evidence");
            return;
        }
        debug!(me = self.me, from = %self.state, "entering blame");
        self.interrupted = Some(self.state);
        self.state = State::BlameInit;

        let evidence = self.transcript.serialize();
        let mut hasher = Sha256::new();
        hasher.update(&self.outer_key.encode());
        hasher.update(&evidence);
        let attestation = wire::blame_attestation(&self.round, &hasher.finalize());
        let signature = self.signer.sign(&attestation);
        self.broadcast(Payload::BlameData {
            outer: self.outer_key.clone(),
            transcript: evidence,
            signature,
        });
    }

    fn on_blame(
        &mut self,
        sender: usize,
        outer: seal::PrivateKey,
        transcript: Bytes,
        signature: ed25519::Signature,
    ) -> Result<(), Error> {
        if self.private_outer[sender].is_some() {
            return Err(Error::Duplicate { kind: "blame" });
        }

        // Recompute the attestation from what was actually sent; the
        // signature binds the key and the transcript together.
        let mut hasher = Sha256::new();
        hasher.update(&outer.encode());
        hasher.update(&transcript);
        let attestation = wire::blame_attestation(&self.round, &hasher.finalize());
        if !self.group.id(sender).verify(&attestation, &signature) {
            return Err(Error::BadAttestation);
        }
        let Some(expected) = self.public_outer[self.group.onion_slot(sender)].as_ref() else {
            return Err(Error::KeyMismatch);
        };
        if !outer.matches(expected) {
            return Err(Error::KeyMismatch);
        }
        let evidence =
            Transcript::deserialize(&transcript).map_err(Error::MalformedEvidence)?;

        self.private_outer[sender] = Some(outer);
        self.evidence[sender] = Some(evidence);
        self.attestations[sender] = Some(attestation);
        self.attestation_signatures[sender] = Some(signature);
        self.blames += 1;
        debug!(me = self.me, sender, received = self.blames, "blame evidence recorded");

        if self.blames == self.group.len() {
            self.share_attestations();
        } else if self.state != State::BlameInit {
            // First blame message seen outside the blame phase drags this
            // peer in as well.
            self.start_blame();
        }
        Ok(())
    }

    fn share_attestations(&mut self) {
        debug!(me = self.me, "sharing collected attestations");
        self.state = State::BlameShare;
        let attestations = self.attestations.iter().flatten().cloned().collect();
        let signatures = self.attestation_signatures.iter().flatten().cloned().collect();
        self.broadcast(Payload::BlameVerification {
            attestations,
            signatures,
        });
    }

    fn on_blame_verification(
        &mut self,
        sender: usize,
        attestations: Vec<Bytes>,
        signatures: Vec<ed25519::Signature>,
    ) -> Result<(), Error> {
        if self.reports[sender].is_some() {
            return Err(Error::Duplicate {
                kind: "blame verification",
            });
        }
        let n = self.group.len();
        if attestations.len() != n || signatures.len() != n {
            return Err(Error::IncompleteReport);
        }
        self.reports[sender] = Some((attestations, signatures));
        self.report_count += 1;
        if self.report_count == n {
            self.conclude_blame();
        }
        Ok(())
    }

    /// Judges the collected evidence once every peer has reported.
    ///
    /// Divergence is evaluated only now, with the full set of attestations
    /// in hand, so the verdict cannot depend on message arrival order. A
    /// divergent claim that verifies under the subject's key proves the
    /// subject issued two distinct attestations; one that does not verify
    /// proves the relayer fabricated it.
    fn conclude_blame(&mut self) {
        debug!(me = self.me, "cross-checking attestations");
        let n = self.group.len();
        let mut accused = vec![false; n];
        for (relayer, report) in self.reports.iter().enumerate() {
            let Some((claims, claim_signatures)) = report else {
                continue;
            };
            for subject in 0..n {
                if self.attestations[subject].as_ref() == Some(&claims[subject]) {
                    continue;
                }
                if self
                    .group
                    .id(subject)
                    .verify(&claims[subject], &claim_signatures[subject])
                {
                    warn!(
                        me = self.me,
                        subject, relayer, "peer issued conflicting attestations"
                    );
                    accused[subject] = true;
                } else {
                    warn!(
                        me = self.me,
                        subject, relayer, "peer relayed a forged attestation"
                    );
                    accused[relayer] = true;
                }
            }
        }

        if !accused.contains(&true) {
            let evidence: Vec<Transcript> = self.evidence.iter().flatten().cloned().collect();
            let outer_keys: Vec<seal::PrivateKey> =
                self.private_outer.iter().flatten().cloned().collect();
            accused = Blamer::new(&self.group, &self.round, &evidence, &outer_keys).judge();
        }

        self.bad_members = accused
            .iter()
            .enumerate()
            .filter_map(|(index, &bad)| bad.then_some(index))
            .collect();
        warn!(me = self.me, accused = ?self.bad_members, "blame concluded");
        self.finish(false, "round finished in blame");
    }

    fn finish(&mut self, successful: bool, reason: &str) {
        self.successful = successful;
        self.state = State::Finished;
        debug!(me = self.me, successful, reason, "round closed");
        self.reporter.close(reason);
    }

    /// Signs and broadcasts a payload.
    ///
    /// The local copy is processed synchronously before the transport sees
    /// the envelope, matching the per-link ordering an external receiver
    /// observes.
    fn broadcast(&mut self, payload: Payload) {
        let envelope = wire::sign_envelope(
            &self.signer,
            &Message {
                round: self.round,
                payload,
            },
        );
        let id = self.group.id(self.me).clone();
        self.handle(&id, envelope.clone());
        self.transport.broadcast(envelope);
    }

    /// Signs and sends a payload to one peer, short-circuiting self-sends.
    fn send(&mut self, payload: Payload, to: usize) {
        let envelope = wire::sign_envelope(
            &self.signer,
            &Message {
                round: self.round,
                payload,
            },
        );
        if to == self.me {
            let id = self.group.id(self.me).clone();
            self.handle(&id, envelope);
        } else {
            self.transport.send(self.group.id(to), envelope);
        }
    }
}

/// Collects announced keys out of their option slots.
///
/// Only called after the key-sharing phase counted all N announcements, so
/// every slot is filled.
fn announced(keys: &[Option<seal::PublicKey>]) -> Vec<seal::PublicKey> {
    keys.iter().flatten().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{Link, Mailbox, Relay};
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    const SESSION: SessionId = [0u8; 32];
    const ROUND: RoundId = [1u8; 32];
    const BLOCK_SIZE: usize = 64;

    type TestRound = ShuffleRound<ChaCha20Rng, Link, Mailbox>;

    /// N rounds wired over an in-memory relay, one mailbox each.
    struct Network {
        rounds: Vec<TestRound>,
        relay: Relay,
        mailboxes: Vec<Mailbox>,
        signers: Vec<ed25519::PrivateKey>,
        group: Group,
    }

    fn network(messages: Vec<Option<Bytes>>) -> Network {
        let n = messages.len();
        let signers: Vec<_> = (0..n)
            .map(|i| ed25519::PrivateKey::from_seed(i as u64))
            .collect();
        let group = Group::new(signers.iter().map(ed25519::PrivateKey::public_key).collect());
        let relay = Relay::new(group.iter().cloned().collect());
        let mailboxes: Vec<Mailbox> = (0..n).map(|_| Mailbox::new()).collect();
        let rounds = signers
            .iter()
            .zip(messages)
            .enumerate()
            .map(|(i, (signer, message))| {
                ShuffleRound::new(
                    ChaCha20Rng::seed_from_u64(100 + i as u64),
                    Config {
                        signer: signer.clone(),
                        group: group.clone(),
                        session: SESSION,
                        round: ROUND,
                        block_size: BLOCK_SIZE,
                        message,
                    },
                    relay.link(i),
                    mailboxes[i].clone(),
                )
            })
            .collect();
        Network {
            rounds,
            relay,
            mailboxes,
            signers,
            group,
        }
    }

    impl Network {
        fn start(&mut self) {
            for round in &mut self.rounds {
                assert!(round.start());
            }
        }

        /// Pumps the relay dry, delivering envelopes in queue order.
        fn run(&mut self) {
            self.run_with(|_, _, envelope| envelope);
        }

        /// Pumps the relay, giving `tamper` a chance to replace each
        /// envelope before delivery.
        fn run_with(
            &mut self,
            mut tamper: impl FnMut(usize, &ed25519::PublicKey, Bytes) -> Bytes,
        ) {
            while let Some((to, from, envelope)) = self.relay.pop() {
                let envelope = tamper(to, &from, envelope);
                self.rounds[to].handle(&from, envelope);
            }
        }

        fn delivered(&self, index: usize) -> Vec<Bytes> {
            let mut delivered = self.mailboxes[index].delivered();
            delivered.sort();
            delivered
        }

        fn assert_success(&self, expected: &[&[u8]]) {
            let mut expected: Vec<Bytes> =
                expected.iter().map(|m| Bytes::copy_from_slice(m)).collect();
            expected.sort();
            for (index, round) in self.rounds.iter().enumerate() {
                assert!(round.successful(), "peer {index} failed");
                assert_eq!(round.state(), State::Finished);
                assert!(round.bad_members().is_empty());
                assert_eq!(self.delivered(index), expected, "peer {index} delivery");
                assert_eq!(
                    self.mailboxes[index].closed().as_deref(),
                    Some("round successfully finished")
                );
            }
        }

        fn assert_blamed(&self, index: usize, accused: &[usize]) {
            let round = &self.rounds[index];
            assert!(!round.successful(), "peer {index} must not succeed");
            assert_eq!(round.state(), State::Finished);
            assert_eq!(round.bad_members(), accused, "peer {index} accusations");
            assert_eq!(
                self.mailboxes[index].closed().as_deref(),
                Some("round finished in blame")
            );
        }
    }

    /// Re-signs a payload as `signer`, producing a valid envelope with
    /// attacker-chosen contents.
    fn forge(signer: &ed25519::PrivateKey, payload: Payload) -> Bytes {
        wire::sign_envelope(
            signer,
            &Message {
                round: ROUND,
                payload,
            },
        )
    }

    #[test]
    fn happy_path_three_peers() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();
        net.run();
        net.assert_success(&[b"a", b"b", b"c"]);
    }

    #[test]
    fn happy_path_two_peers() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"left")),
            Some(Bytes::from_static(b"right")),
        ]);
        net.start();
        net.run();
        net.assert_success(&[b"left", b"right"]);
    }

    #[test]
    fn silent_peer_delivers_the_rest() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            None,
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();
        net.run();
        net.assert_success(&[b"a", b"c"]);
    }

    #[test]
    fn exact_block_size_survives() {
        let full = vec![0xC4u8; BLOCK_SIZE];
        let mut net = network(vec![
            Some(Bytes::from(full.clone())),
            Some(Bytes::from_static(b"small")),
        ]);
        net.start();
        net.run();
        net.assert_success(&[full.as_slice(), b"small"]);
    }

    #[test]
    fn oversized_submission_participates_empty() {
        let mut net = network(vec![
            Some(Bytes::from(vec![0xC4u8; BLOCK_SIZE + 1])),
            Some(Bytes::from_static(b"kept")),
        ]);
        net.start();
        net.run();
        net.assert_success(&[b"kept"]);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut net = network(vec![Some(Bytes::from_static(b"a")), None]);
        assert!(net.rounds[0].start());
        assert!(!net.rounds[0].start());
    }

    #[test]
    fn rejected_envelopes_leave_no_trace() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // Noise: an outsider's garbage, a wrong-round envelope, and a replay
        // of whatever peer 1 said first. All must be rejected, popped from
        // the transcript, and the round must still agree and succeed.
        let outsider = ed25519::PrivateKey::from_seed(977);
        net.relay.inject(
            0,
            outsider.public_key(),
            Bytes::from_static(b"not even an envelope"),
        );
        let stray = wire::sign_envelope(
            &net.signers[1],
            &Message {
                round: [9u8; 32],
                payload: Payload::NoGo,
            },
        );
        net.relay.inject(0, net.signers[1].public_key(), stray);

        let relay = net.relay.clone();
        let from_one = net.signers[1].public_key();
        let mut replayed = false;
        net.run_with(move |to, from, envelope| {
            if !replayed && to == 0 && *from == from_one {
                relay.inject(0, from.clone(), envelope.clone());
                replayed = true;
            }
            envelope
        });
        net.assert_success(&[b"a", b"b", b"c"]);
    }

    #[test]
    fn copied_submission_accuses_the_pair() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // The second submitter to reach the collector copies the bytes of
        // the first, so peer 0 sees two byte-equal blocks in the pipeline.
        let group = net.group.clone();
        let signers = net.signers.clone();
        let mut captured: Option<(usize, Bytes)> = None;
        net.run_with(move |to, from, envelope| {
            if to != 0 {
                return envelope;
            }
            let sender = group.index(from).unwrap();
            if sender == 0 {
                return envelope;
            }
            let Ok(message) = wire::open_envelope(from, &envelope) else {
                return envelope;
            };
            let Payload::Data { block } = message.payload else {
                return envelope;
            };
            match &captured {
                None => {
                    captured = Some((sender, block));
                    envelope
                }
                Some((victim, copied)) if *victim != sender => forge(
                    &signers[sender],
                    Payload::Data {
                        block: copied.clone(),
                    },
                ),
                Some(_) => envelope,
            }
        });

        for index in 0..3 {
            net.assert_blamed(index, &[1, 2]);
        }
    }

    #[test]
    fn causeless_nogo_accuses_the_voter() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // Peer 2 tells everyone else NoGo despite a valid shuffle. Its own
        // transcript still holds its real Go, so the replay catches the
        // conflicting votes.
        let group = net.group.clone();
        let signers = net.signers.clone();
        net.run_with(move |_, from, envelope| {
            if group.index(from) != Some(2) {
                return envelope;
            }
            match wire::open_envelope(from, &envelope) {
                Ok(Message {
                    payload: Payload::Go { .. },
                    ..
                }) => forge(&signers[2], Payload::NoGo),
                _ => envelope,
            }
        });

        for index in 0..3 {
            net.assert_blamed(index, &[2]);
        }
    }

    #[test]
    fn equivocated_commitment_accuses_the_announcer() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // Peer 0 tells peer 2 a different view commitment than everyone
        // else. Peer 2 sees the mismatch and forces blame; the transcripts
        // then hold two validly signed, conflicting votes from peer 0.
        let group = net.group.clone();
        let signers = net.signers.clone();
        net.run_with(move |to, from, envelope| {
            if to != 2 || group.index(from) != Some(0) {
                return envelope;
            }
            match wire::open_envelope(from, &envelope) {
                Ok(Message {
                    payload: Payload::Go { .. },
                    ..
                }) => forge(
                    &signers[0],
                    Payload::Go {
                        commitment: Sha256::hash(b"a view nobody computed"),
                    },
                ),
                _ => envelope,
            }
        });

        for index in 0..3 {
            net.assert_blamed(index, &[0]);
        }
    }

    #[test]
    fn equivocated_keys_stall_the_evidence_exchange() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // Peer 0 announces different round keys to peer 2 than to peer 1.
        // Peer 2 then unknowingly encrypts for keys nobody will peel and
        // the pipeline fails at peer 0. But peer 2 also recorded the forged
        // announcement, so peer 0's genuine key reveal never matches it:
        // peer 2 rejects the reveal, the evidence exchange never completes
        // anywhere, and every round stays parked until the host discards
        // it. Accountability for this corner is the enclosing session's
        // timeout, not the round's.
        let group = net.group.clone();
        let signers = net.signers.clone();
        let mut fake_rng = ChaCha20Rng::seed_from_u64(555);
        let fake_inner = seal::PrivateKey::from_rng(&mut fake_rng);
        let fake_outer = seal::PrivateKey::from_rng(&mut fake_rng);
        net.run_with(move |to, from, envelope| {
            if to != 2 || group.index(from) != Some(0) {
                return envelope;
            }
            match wire::open_envelope(from, &envelope) {
                Ok(Message {
                    payload: Payload::PublicKeys { .. },
                    ..
                }) => forge(
                    &signers[0],
                    Payload::PublicKeys {
                        inner: fake_inner.public_key(),
                        outer: fake_outer.public_key(),
                    },
                ),
                _ => envelope,
            }
        });

        for index in 0..3 {
            assert!(!net.rounds[index].successful());
            assert_ne!(net.rounds[index].state(), State::Finished);
            assert!(net.mailboxes[index].closed().is_none());
        }
    }

    #[test]
    fn truncated_view_accuses_the_broadcaster() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // The last shuffler drops one block from the view it broadcasts,
        // while its own copy stays complete.
        let group = net.group.clone();
        let signers = net.signers.clone();
        net.run_with(move |_, from, envelope| {
            if group.index(from) != Some(2) {
                return envelope;
            }
            match wire::open_envelope(from, &envelope) {
                Ok(Message {
                    payload: Payload::EncryptedData { mut blocks },
                    ..
                }) => {
                    blocks.pop();
                    forge(&signers[2], Payload::EncryptedData { blocks })
                }
                _ => envelope,
            }
        });

        for index in 0..3 {
            net.assert_blamed(index, &[2]);
        }
    }

    #[test]
    fn equivocated_attestation_accuses_without_replay() {
        let mut net = network(vec![
            Some(Bytes::from_static(b"a")),
            Some(Bytes::from_static(b"b")),
            Some(Bytes::from_static(b"c")),
        ]);
        net.start();

        // Peer 2 forces blame with a causeless NoGo; peer 1 then sends
        // peer 0 a doctored transcript (and matching attestation) while
        // everyone else gets the real one. The attestation cross-check must
        // convict peer 1 on the conflicting signatures alone, before any
        // replay could also examine peer 2's vote.
        let group = net.group.clone();
        let signers = net.signers.clone();
        net.run_with(move |to, from, envelope| {
            let sender = group.index(from);
            if sender == Some(2) {
                if let Ok(Message {
                    payload: Payload::Go { .. },
                    ..
                }) = wire::open_envelope(from, &envelope)
                {
                    return forge(&signers[2], Payload::NoGo);
                }
            }
            if sender == Some(1) && to == 0 {
                if let Ok(Message {
                    payload:
                        Payload::BlameData {
                            outer, transcript, ..
                        },
                    ..
                }) = wire::open_envelope(from, &envelope)
                {
                    let mut doctored = Transcript::deserialize(&transcript).unwrap();
                    doctored.pop();
                    let evidence = doctored.serialize();
                    let mut hasher = Sha256::new();
                    hasher.update(&outer.encode());
                    hasher.update(&evidence);
                    let attestation = wire::blame_attestation(&ROUND, &hasher.finalize());
                    let signature = signers[1].sign(&attestation);
                    return forge(
                        &signers[1],
                        Payload::BlameData {
                            outer,
                            transcript: evidence,
                            signature,
                        },
                    );
                }
            }
            envelope
        });

        for index in 0..3 {
            net.assert_blamed(index, &[1]);
        }
    }
}
