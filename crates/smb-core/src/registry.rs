//! Listener and synchronous handler registries.
//!
//! Both registries are consulted by the dispatch thread while application
//! threads register and unregister callbacks, so every map sits behind an
//! `RwLock`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::envelope::Envelope;
use crate::errors::RegistrationError;
use crate::failure::{BoxError, HandlerFailure};

/// Error type returned by listener callbacks.
pub type ListenerError = BoxError;

/// Callback invoked for fire-and-forget messages.
pub trait MessageListener: Send + Sync {
    /// Handles one message.
    ///
    /// # Errors
    ///
    /// Returned errors are logged and go no further.
    fn on_message(&self, envelope: &Envelope) -> Result<(), ListenerError>;
}

impl<F> MessageListener for F
where
    F: Fn(&Envelope) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_message(&self, envelope: &Envelope) -> Result<(), ListenerError> {
        self(envelope)
    }
}

/// Callback answering synchronous requests of one message type.
pub trait SynchronousHandler: Send + Sync {
    /// Produces the result for one request.
    ///
    /// # Errors
    ///
    /// Returned failures are sent back to the caller as a remote failure.
    fn on_request(&self, envelope: &Envelope) -> Result<Value, HandlerFailure>;
}

impl<F> SynchronousHandler for F
where
    F: Fn(&Envelope) -> Result<Value, HandlerFailure> + Send + Sync,
{
    fn on_request(&self, envelope: &Envelope) -> Result<Value, HandlerFailure> {
        self(envelope)
    }
}

fn same_listener(left: &Arc<dyn MessageListener>, right: &Arc<dyn MessageListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

/// Permanent listeners keyed by message type plus a catch-all list.
#[derive(Default)]
pub struct ListenerRegistry {
    by_type: RwLock<HashMap<String, Vec<Arc<dyn MessageListener>>>>,
    catch_all: RwLock<Vec<Arc<dyn MessageListener>>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener for one message type.
    pub fn register(&self, message_type: &str, listener: Arc<dyn MessageListener>) {
        self.by_type
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(message_type.to_owned())
            .or_default()
            .push(listener);
    }

    /// Appends a listener receiving every message.
    pub fn register_for_all(&self, listener: Arc<dyn MessageListener>) {
        self.catch_all
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes the first registration of `listener` for `message_type`.
    ///
    /// Returns whether a registration was removed.
    pub fn unregister(&self, message_type: &str, listener: &Arc<dyn MessageListener>) -> bool {
        let mut by_type = self.by_type.write().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = by_type.get_mut(message_type) else {
            return false;
        };
        let Some(position) = listeners
            .iter()
            .position(|candidate| same_listener(candidate, listener))
        else {
            return false;
        };
        listeners.remove(position);
        if listeners.is_empty() {
            by_type.remove(message_type);
        }
        true
    }

    /// Removes the first catch-all registration of `listener`.
    ///
    /// Returns whether a registration was removed.
    pub fn unregister_for_all(&self, listener: &Arc<dyn MessageListener>) -> bool {
        let mut catch_all = self
            .catch_all
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(position) = catch_all
            .iter()
            .position(|candidate| same_listener(candidate, listener))
        else {
            return false;
        };
        catch_all.remove(position);
        true
    }

    /// Snapshot of the listeners interested in `message_type`: type-specific
    /// registrations first, then catch-all ones, each in insertion order.
    #[must_use]
    pub fn listeners_for(&self, message_type: &str) -> Vec<Arc<dyn MessageListener>> {
        let mut listeners = self
            .by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
            .unwrap_or_default();
        listeners.extend(
            self.catch_all
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        listeners
    }
}

/// At most one synchronous handler per message type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn SynchronousHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `message_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateHandler`] when a handler already
    /// claims the type; the existing handler stays active.
    pub fn register(
        &self,
        message_type: &str,
        handler: Arc<dyn SynchronousHandler>,
    ) -> Result<(), RegistrationError> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match handlers.entry(message_type.to_owned()) {
            Entry::Occupied(_) => Err(RegistrationError::DuplicateHandler {
                message_type: message_type.to_owned(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Handler registered for `message_type`, if any.
    #[must_use]
    pub fn handler_for(&self, message_type: &str) -> Option<Arc<dyn SynchronousHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
    }
}
