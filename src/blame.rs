//! Deterministic replay of a failed round.
//!
//! Once every peer has revealed its outer private key and its signed
//! transcript, the whole run becomes mechanically checkable: every protocol
//! message is signed by its author, the collector's transcript pins the
//! submissions, each shuffler's output is pinned by its successor's
//! transcript (or by the broadcast view), and the revealed keys let anyone
//! peel every submission through every layer. The [Blamer] walks that
//! evidence and accuses every peer whose recorded behavior deviates from
//! the protocol it should have executed.
//!
//! The replay is conservative: it only accuses on signed evidence, and it
//! skips any check whose evidence is missing rather than guess.

use crate::crypto::seal;
use crate::group::Group;
use crate::transcript::Transcript;
use crate::wire::{self, Payload};
use crate::RoundId;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One validly signed transcript entry.
struct Record {
    /// Index of the peer whose transcript held the entry.
    owner: usize,
    /// Index of the peer that signed the envelope.
    sender: usize,
    payload: Payload,
    envelope: Bytes,
}

/// Broadcast classes a peer must never equivocate on.
///
/// `Data` and `ShuffleData` are point-to-point and excluded; votes form one
/// class so a peer cannot tell one neighbor Go and another NoGo.
const fn broadcast_class(payload: &Payload) -> Option<&'static str> {
    match payload {
        Payload::PublicKeys { .. } => Some("public keys"),
        Payload::EncryptedData { .. } => Some("encrypted data"),
        Payload::Go { .. } | Payload::NoGo => Some("vote"),
        Payload::PrivateKey { .. } => Some("private key"),
        _ => None,
    }
}

/// Replays a failed round from all N transcripts and revealed outer keys.
pub struct Blamer<'a> {
    group: &'a Group,
    round: &'a RoundId,
    evidence: &'a [Transcript],
    outer_keys: &'a [seal::PrivateKey],
    accused: Vec<bool>,
}

impl<'a> Blamer<'a> {
    /// Builds a blamer over complete evidence.
    ///
    /// # Panics
    ///
    /// Panics unless one transcript and one outer key per peer is supplied.
    pub fn new(
        group: &'a Group,
        round: &'a RoundId,
        evidence: &'a [Transcript],
        outer_keys: &'a [seal::PrivateKey],
    ) -> Self {
        assert_eq!(evidence.len(), group.len(), "one transcript per peer");
        assert_eq!(outer_keys.len(), group.len(), "one outer key per peer");
        Self {
            group,
            round,
            evidence,
            outer_keys,
            accused: vec![false; group.len()],
        }
    }

    /// Runs every check and returns one accusation flag per peer.
    pub fn judge(mut self) -> Vec<bool> {
        let records = self.validate_transcripts();
        self.check_broadcast_consistency(&records);
        let submissions = self.collect_submissions(&records);

        // Accusations so far rest on conflicting signed statements. When a
        // peer equivocated on its announced keys or its submission, the
        // pipeline's premises are disputed and layer-by-layer attribution
        // would blame the deceived instead of the deceiver.
        if self.accused.contains(&true) {
            return self.accused;
        }

        let n = self.group.len();
        let mut blocks = Vec::with_capacity(n);
        for (index, submission) in submissions.into_iter().enumerate() {
            match submission {
                Some(block) => blocks.push(block),
                None => {
                    warn!(index, "no recorded submission, skipping pipeline replay");
                    return self.accused;
                }
            }
        }

        if let Some(chains) = self.peel_chains(&blocks) {
            self.check_stages(&records, &chains);
        }
        self.accused
    }

    fn accuse(&mut self, index: usize, why: &'static str) {
        if !self.accused[index] {
            warn!(index, why, "accusing peer");
            self.accused[index] = true;
        }
    }

    /// Parses every transcript entry, accusing owners of inadmissible ones.
    ///
    /// An honest peer only records envelopes that verified against its
    /// group and round, so an entry that fails those checks proves the
    /// transcript's owner tampered with its evidence.
    fn validate_transcripts(&mut self) -> Vec<Record> {
        let mut records = Vec::new();
        for (owner, transcript) in self.evidence.iter().enumerate() {
            for entry in transcript.iter() {
                let Some(sender) = self.group.index(&entry.sender) else {
                    self.accuse(owner, "transcript entry from outside the group");
                    continue;
                };
                let message = match wire::open_envelope(self.group.id(sender), &entry.envelope) {
                    Ok(message) => message,
                    Err(_) => {
                        self.accuse(owner, "transcript entry with an invalid envelope");
                        continue;
                    }
                };
                if message.round != *self.round {
                    self.accuse(owner, "transcript entry from another round");
                    continue;
                }
                records.push(Record {
                    owner,
                    sender,
                    payload: message.payload,
                    envelope: entry.envelope.clone(),
                });
            }
        }
        debug!(records = records.len(), "transcripts validated");
        records
    }

    /// Accuses any peer two transcripts caught broadcasting different bytes.
    ///
    /// Signing is deterministic, so the same broadcast reaches every peer
    /// as the same envelope; two distinct validly-signed envelopes of one
    /// class are two conflicting statements by the sender.
    fn check_broadcast_consistency(&mut self, records: &[Record]) {
        let mut seen: HashMap<(usize, &'static str), &Bytes> = HashMap::new();
        for record in records {
            let Some(class) = broadcast_class(&record.payload) else {
                continue;
            };
            let first = *seen
                .entry((record.sender, class))
                .or_insert(&record.envelope);
            if *first != record.envelope {
                self.accuse(record.sender, "conflicting broadcasts");
            }
        }
    }

    /// Extracts each peer's submission from the collector's transcript.
    fn collect_submissions(&mut self, records: &[Record]) -> Vec<Option<Bytes>> {
        let mut submissions: Vec<Option<Bytes>> = vec![None; self.group.len()];
        for record in records {
            let Payload::Data { block } = &record.payload else {
                continue;
            };
            if record.owner != 0 {
                continue;
            }
            match &submissions[record.sender] {
                None => submissions[record.sender] = Some(block.clone()),
                Some(existing) if existing != block => {
                    self.accuse(record.sender, "conflicting submissions");
                }
                Some(_) => {}
            }
        }

        // Byte-equal submissions are a copy attack on the victim's
        // anonymity; both slots are culpable.
        for i in 0..submissions.len() {
            for j in 0..i {
                if let (Some(a), Some(b)) = (&submissions[i], &submissions[j]) {
                    if a == b {
                        self.accuse(i, "duplicate submission");
                        self.accuse(j, "duplicate submission");
                    }
                }
            }
        }
        submissions
    }

    /// Peels every submission through all outer layers.
    ///
    /// `chains[j][k]` is peer j's submission after k layers; a failure at
    /// layer k means peer j crafted a block that was never a well-formed
    /// onion, and ends the replay (later stages cannot be reconstructed).
    fn peel_chains(&mut self, submissions: &[Bytes]) -> Option<Vec<Vec<Bytes>>> {
        let mut chains = Vec::with_capacity(submissions.len());
        let mut broken = false;
        for (index, submission) in submissions.iter().enumerate() {
            let mut current = submission.clone();
            let mut chain = vec![current.clone()];
            for (layer, key) in self.outer_keys.iter().enumerate() {
                match key.decrypt(&current) {
                    Some(clear) => {
                        chain.push(clear.clone());
                        current = clear;
                    }
                    None => {
                        warn!(index, layer, "submission fails to peel");
                        self.accuse(index, "malformed onion");
                        broken = true;
                        break;
                    }
                }
            }
            chains.push(chain);
        }
        (!broken).then_some(chains)
    }

    /// Checks every shuffler's recorded output against the peel of its
    /// input, then audits NoGo votes against the verified view.
    fn check_stages(&mut self, records: &[Record], chains: &[Vec<Bytes>]) {
        let n = self.group.len();
        let mut final_view: Option<Vec<Bytes>> = None;

        for shuffler in 0..n {
            let observed = records.iter().find_map(|record| match &record.payload {
                Payload::ShuffleData { blocks }
                    if record.sender == shuffler && record.owner == shuffler + 1 =>
                {
                    Some(blocks.clone())
                }
                Payload::EncryptedData { blocks }
                    if record.sender == shuffler && shuffler + 1 == n =>
                {
                    Some(blocks.clone())
                }
                _ => None,
            });
            let Some(observed) = observed else {
                warn!(shuffler, "no recorded output, skipping stage");
                continue;
            };

            let mut expected: Vec<Bytes> =
                (0..n).map(|j| chains[j][shuffler + 1].clone()).collect();
            let mut sorted = observed.clone();
            sorted.sort();
            expected.sort();
            if sorted != expected {
                self.accuse(shuffler, "output is not a permutation of the peeled input");
            } else if shuffler + 1 == n {
                final_view = Some(observed);
            }
        }

        // With a verified pipeline, every submission made it into the view;
        // a NoGo against it is a vote without cause.
        let Some(view) = final_view else {
            return;
        };
        if self.accused.contains(&true) {
            return;
        }
        for record in records {
            if matches!(record.payload, Payload::NoGo) && view.contains(&chains[record.sender][n])
            {
                self.accuse(record.sender, "vote without cause");
            }
        }
    }
}
