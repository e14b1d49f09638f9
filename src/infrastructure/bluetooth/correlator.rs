//! Request Correlator
//!
//! Matches response frames to the command that is waiting for them.
//! Correlation is by command kind: at most one request per kind may be
//! outstanding on a connection.
//!
//! The correlator holds no lock of its own. It lives inside the connection's
//! state mutex so that registration and resolution are serialized with
//! notification delivery from the transport callback context.

use crate::error::{InstrumentError, Result};
use crate::infrastructure::bluetooth::protocol::CommandKind;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Completion handle for one pending request
pub type Completion<T> = oneshot::Sender<Result<T>>;

/// Identifies one registration so that a stale handle cannot cancel
/// a newer request of the same kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

struct PendingRequest<T> {
    ticket: Ticket,
    completion: Completion<T>,
}

pub struct RequestCorrelator<T> {
    pending: HashMap<CommandKind, PendingRequest<T>>,
    next_ticket: u64,
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_ticket: 0,
        }
    }

    /// Register a pending request.
    ///
    /// Fails with [`InstrumentError::RequestAlreadyInFlight`] if `kind` is
    /// already pending; the existing entry is left untouched.
    pub fn register(&mut self, kind: CommandKind, completion: Completion<T>) -> Result<Ticket> {
        if self.pending.contains_key(&kind) {
            return Err(InstrumentError::RequestAlreadyInFlight(kind));
        }
        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.pending
            .insert(kind, PendingRequest { ticket, completion });
        Ok(ticket)
    }

    /// Resolve the pending request of `kind` with `value`.
    ///
    /// Returns false if nothing was pending (late or unsolicited response).
    pub fn resolve(&mut self, kind: CommandKind, value: T) -> bool {
        match self.pending.remove(&kind) {
            Some(request) => {
                // The caller may have stopped listening; nothing to do then
                let _ = request.completion.send(Ok(value));
                true
            }
            None => {
                debug!("No pending {:?} request, dropping response", kind);
                false
            }
        }
    }

    /// Remove the request of `kind` registered under `ticket` and resolve it
    /// with [`InstrumentError::Cancelled`]
    pub fn cancel(&mut self, kind: CommandKind, ticket: Ticket) -> bool {
        match self.pending.get(&kind) {
            Some(request) if request.ticket == ticket => {}
            _ => return false,
        }
        match self.pending.remove(&kind) {
            Some(request) => {
                let _ = request.completion.send(Err(InstrumentError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Drain every pending request, failing each with `error`
    pub fn fail_all(&mut self, error: InstrumentError) -> usize {
        let drained = self.pending.len();
        for (kind, request) in self.pending.drain() {
            debug!("Failing pending {:?} request: {}", kind, error);
            let _ = request.completion.send(Err(error.clone()));
        }
        drained
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.pending.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
