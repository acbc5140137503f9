//! Table of in-flight requests for one connection.

use crate::error::McpError;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// Outcome delivered to whoever is waiting on a request.
pub type CallOutcome = Result<serde_json::Value, McpError>;

/// One outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    pub method: String,
    pub issued_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    /// Settle the call. Consumes it, so a call settles at most once.
    pub fn settle(self, outcome: CallOutcome) {
        // The waiter may already have given up (timeout); nothing to do then.
        let _ = self.tx.send(outcome);
    }
}

/// Most responses a server may send ahead of the request they answer.
const MAX_EARLY: usize = 16;

/// Where a newly registered call stands.
#[derive(Debug)]
pub enum Registration {
    /// Sent nothing yet; the outcome arrives on the receiver.
    Waiting(u64, oneshot::Receiver<CallOutcome>),
    /// The server already answered this id before it was issued.
    Answered(u64, CallOutcome),
}

/// What became of a response handed to [`PendingCalls::deliver`].
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A waiting call was settled.
    Settled,
    /// Kept until a call with this id is registered.
    Buffered,
    /// No call has or will have this id, or it already settled.
    Unmatched,
}

/// Allocates request ids and tracks the calls waiting on them.
///
/// Ids start at 1 and are never reused. Once closed, the table refuses new
/// calls so nothing can slip in after a disconnect drained it. The one
/// exception is an id the server answered before the close: that answer
/// was received while the connection was alive and is still handed out.
#[derive(Debug)]
pub struct PendingCalls {
    next_id: u64,
    calls: HashMap<u64, PendingCall>,
    early: HashMap<u64, CallOutcome>,
    closed: bool,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self {
            next_id: 1,
            calls: HashMap::new(),
            early: HashMap::new(),
            closed: false,
        }
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call under the next id.
    /// Returns `None` once the table has been closed.
    pub fn register(&mut self, method: &str) -> Option<Registration> {
        let id = self.next_id;
        if let Some(outcome) = self.early.remove(&id) {
            self.next_id += 1;
            return Some(Registration::Answered(id, outcome));
        }
        if self.closed {
            return None;
        }
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
            },
        );
        Some(Registration::Waiting(id, rx))
    }

    /// Route a response to its call. With `buffer_early` set, an answer for
    /// an id not issued yet is held for [`register`](Self::register).
    pub fn deliver(&mut self, id: u64, outcome: CallOutcome, buffer_early: bool) -> Delivery {
        if let Some(call) = self.calls.remove(&id) {
            call.settle(outcome);
            return Delivery::Settled;
        }
        if buffer_early && !self.closed && id >= self.next_id && self.early.len() < MAX_EARLY {
            self.early.insert(id, outcome);
            return Delivery::Buffered;
        }
        Delivery::Unmatched
    }

    /// Remove and return the call with `id`, if still outstanding.
    pub fn take(&mut self, id: u64) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Refuse further calls and hand back everything still outstanding.
    pub fn close(&mut self) -> Vec<PendingCall> {
        self.closed = true;
        self.calls.drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
