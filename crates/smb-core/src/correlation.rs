//! Pending synchronous calls keyed by correlation identifier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::envelope::CorrelationId;
use crate::failure::RemoteFailure;

/// Result delivered to a waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The handler returned a value.
    Completed(Value),
    /// The handler failed.
    Failed(RemoteFailure),
}

#[derive(Debug)]
struct PendingCall {
    message_type: String,
    completion: SyncSender<CallOutcome>,
}

/// Allocates correlation identifiers and tracks calls awaiting a response.
///
/// Each entry owns a single-use completion handle. Completing an entry
/// removes it, so a late or duplicated response finds nothing and is
/// dropped.
#[derive(Debug)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    /// Creates an empty table whose first identifier is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new pending call and returns its identifier with the
    /// receiving half of its completion handle.
    pub fn register(&self, message_type: &str) -> (CorrelationId, Receiver<CallOutcome>) {
        let id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (completion, receiver) = mpsc::sync_channel(1);
        self.lock().insert(
            id,
            PendingCall {
                message_type: message_type.to_owned(),
                completion,
            },
        );
        (id, receiver)
    }

    /// Delivers an outcome to the caller waiting on `id`.
    ///
    /// Returns the message type of the completed call, or `None` when no
    /// call is pending under that identifier.
    pub fn complete(&self, id: CorrelationId, outcome: CallOutcome) -> Option<String> {
        let pending = self.lock().remove(&id)?;
        // The caller may have given up between removal and delivery.
        let _ignored = pending.completion.try_send(outcome);
        Some(pending.message_type)
    }

    /// Removes a pending call without completing it.
    pub fn abandon(&self, id: CorrelationId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
