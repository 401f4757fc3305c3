use crate::crypto::ed25519::PublicKey;
use crate::Transport;
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// An envelope in flight: destination index, sender identity, raw bytes.
pub type InFlight = (usize, PublicKey, Bytes);

struct Queue {
    members: Vec<PublicKey>,
    pending: VecDeque<InFlight>,
}

/// A deterministic in-memory message router for a fixed set of peers.
///
/// Envelopes are queued in send order and handed back through [Relay::pop],
/// so delivery between any pair of peers is order-preserving and
/// exactly-once. Broadcast fans out to every peer except the sender: rounds
/// deliver their own copy synchronously and never see it on the wire.
#[derive(Clone)]
pub struct Relay {
    queue: Rc<RefCell<Queue>>,
}

impl Relay {
    /// Creates a relay for the given peers, in group order.
    pub fn new(members: Vec<PublicKey>) -> Self {
        Self {
            queue: Rc::new(RefCell::new(Queue {
                members,
                pending: VecDeque::new(),
            })),
        }
    }

    /// Returns the transport handle for the peer at `index`.
    pub fn link(&self, index: usize) -> Link {
        Link {
            queue: self.queue.clone(),
            index,
        }
    }

    /// Takes the next undelivered envelope, if any.
    pub fn pop(&self) -> Option<InFlight> {
        self.queue.borrow_mut().pending.pop_front()
    }

    /// Queues an envelope as if `from` had sent it to `to`.
    pub fn inject(&self, to: usize, from: PublicKey, envelope: Bytes) {
        self.queue.borrow_mut().pending.push_back((to, from, envelope));
    }
}

/// One peer's handle onto a [Relay].
pub struct Link {
    queue: Rc<RefCell<Queue>>,
    index: usize,
}

impl Transport for Link {
    fn broadcast(&mut self, message: Bytes) {
        let mut queue = self.queue.borrow_mut();
        let from = queue.members[self.index].clone();
        for to in 0..queue.members.len() {
            if to != self.index {
                queue.pending.push_back((to, from.clone(), message.clone()));
            }
        }
    }

    fn send(&mut self, to: &PublicKey, message: Bytes) {
        let mut queue = self.queue.borrow_mut();
        let from = queue.members[self.index].clone();
        let to = queue
            .members
            .iter()
            .position(|member| member == to)
            .expect("recipient must be a relay member");
        queue.pending.push_back((to, from, message));
    }
}
