//! In-memory doubles for the round's external collaborators.
//!
//! [Relay] stands in for the point-to-point/broadcast transport: it queues
//! envelopes in a single FIFO (which preserves per-link ordering) and lets a
//! test pump, inspect, or tamper with them before delivery. [Mailbox]
//! records everything a round reports to its host.

mod mailbox;
mod relay;

pub use mailbox::Mailbox;
pub use relay::{Link, Relay};
