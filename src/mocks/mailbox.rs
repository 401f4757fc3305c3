use crate::Reporter;
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
struct Record {
    delivered: Vec<Bytes>,
    closed: Option<String>,
}

/// A [Reporter] that records everything for later assertions.
#[derive(Clone, Default)]
pub struct Mailbox {
    record: Rc<RefCell<Record>>,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<Bytes> {
        self.record.borrow().delivered.clone()
    }

    /// The close reason, once the round terminated.
    pub fn closed(&self) -> Option<String> {
        self.record.borrow().closed.clone()
    }
}

impl Reporter for Mailbox {
    fn deliver(&mut self, message: Bytes) {
        self.record.borrow_mut().delivered.push(message);
    }

    fn close(&mut self, reason: &str) {
        let mut record = self.record.borrow_mut();
        assert!(
            record.closed.is_none(),
            "a round must close at most once"
        );
        record.closed = Some(reason.to_string());
    }
}
