//! Subscription Handles
//!
//! Per-invocation callback slots: one for text, one per function name, one
//! for errors. Handlers run on the invocation's task, one at a time, in
//! event order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::demux::DispatchEvent;
use crate::error::DispatchError;
use crate::function::FunctionCallPayload;

/// Receives the accumulated text and whether it is final
pub type TextHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Receives the payload of a call to the function it is bound to
pub type FunctionHandler = Arc<dyn Fn(FunctionCallPayload) + Send + Sync>;

pub type ErrorHandler = Arc<dyn Fn(&DispatchError) + Send + Sync>;

/// Handler slots of one invocation.
///
/// Build one up front and pass it to `Dispatcher::invoke_with` to observe
/// every event, or register through the returned `Invocation` and accept
/// that events delivered before registration are not replayed.
#[derive(Default)]
pub struct Subscribers {
    text: RwLock<Option<TextHandler>>,
    functions: RwLock<HashMap<String, FunctionHandler>>,
    error: RwLock<Option<ErrorHandler>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the text handler
    pub fn text<F>(self, handler: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.set_text(Arc::new(handler));
        self
    }

    /// Bind a handler for calls to `name`
    pub fn function<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(FunctionCallPayload) + Send + Sync + 'static,
    {
        self.set_function(name.into(), Arc::new(handler));
        self
    }

    /// Bind the error handler
    pub fn error<F>(self, handler: F) -> Self
    where
        F: Fn(&DispatchError) + Send + Sync + 'static,
    {
        self.set_error(Arc::new(handler));
        self
    }

    pub(crate) fn set_text(&self, handler: TextHandler) {
        *write(&self.text) = Some(handler);
    }

    pub(crate) fn set_function(&self, name: String, handler: FunctionHandler) {
        write(&self.functions).insert(name, handler);
    }

    pub(crate) fn set_error(&self, handler: ErrorHandler) {
        *write(&self.error) = Some(handler);
    }

    /// Hand one event to the matching handler, if any.
    ///
    /// Handlers are cloned out of their slot first so they may register
    /// further handlers without deadlocking.
    pub(crate) fn deliver(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Text { content, is_final } => {
                let handler = read(&self.text).clone();
                if let Some(handler) = handler {
                    handler(content, *is_final);
                }
            }
            DispatchEvent::FunctionCall(payload) => {
                let handler = read(&self.functions).get(&payload.name).cloned();
                match handler {
                    Some(handler) => handler(payload.clone()),
                    None => tracing::debug!(function = %payload.name, "no handler bound, call not delivered"),
                }
            }
            DispatchEvent::Error(err) => {
                let handler = read(&self.error).clone();
                match handler {
                    Some(handler) => handler(err),
                    None => tracing::warn!(error = %err, "dispatch error with no error handler"),
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut functions: Vec<String> = read(&self.functions).keys().cloned().collect();
        functions.sort();
        f.debug_struct("Subscribers")
            .field("text", &read(&self.text).is_some())
            .field("functions", &functions)
            .field("error", &read(&self.error).is_some())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
