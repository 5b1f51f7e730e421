//! Request correlation table
//!
//! Maps the message id of every CALL the station sent to the stored request,
//! so that an incoming CALLRESULT/CALLERROR can be routed back to the action
//! that caused it. Each station owns exactly one outbox.

use std::collections::HashMap;

use super::messages::Call;

/// Outstanding requests keyed by message id
#[derive(Debug, Default)]
pub struct Outbox {
    pending: HashMap<String, Call>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request. A colliding id silently replaces the older entry.
    pub fn enqueue(&mut self, call: Call) {
        self.pending.insert(call.message_id.clone(), call);
    }

    /// Remove and return the request sent under `message_id`
    pub fn take(&mut self, message_id: &str) -> Option<Call> {
        self.pending.remove(message_id)
    }

    /// Remove without returning
    pub fn discard(&mut self, message_id: &str) {
        self.pending.remove(message_id);
    }

    /// Drop every outstanding request (connection teardown)
    pub fn discard_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
