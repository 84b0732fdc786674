//! Dispatch table between the SMTP host's lifecycle events and the
//! handlers registered for them.
//!
//! Each handler receives a [`Continuation`] it must resume exactly once.
//! Resuming consumes the continuation, and a continuation dropped without
//! being resumed resumes itself, so the host is never left waiting and is
//! never resumed twice.

use std::{collections::HashMap, fmt::Display, future::Future, pin::Pin, sync::Arc};

use tokio::sync::oneshot;
use tracing::debug;

use crate::ConnectionState;

/// Boxed future type for hook handlers, enabling object safety.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Lifecycle events a handler can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    /// HELO/EHLO received.
    Greeting,
    /// MAIL FROM accepted.
    SenderDeclared,
    /// Message data fully received.
    BodyReceived,
}

impl HookName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::Greeting => "greeting",
            HookName::SenderDeclared => "sender_declared",
            HookName::BodyReceived => "body_received",
        }
    }
}

impl Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Greeting { hostname: String },
    SenderDeclared { sender: String },
    BodyReceived,
}

impl HookEvent {
    pub fn name(&self) -> HookName {
        match self {
            HookEvent::Greeting { .. } => HookName::Greeting,
            HookEvent::SenderDeclared { .. } => HookName::SenderDeclared,
            HookEvent::BodyReceived => HookName::BodyReceived,
        }
    }
}

/// Completion callback handed to a hook handler.
pub struct Continuation {
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl Continuation {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Creates a continuation together with the receiver it signals.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        let continuation = Self::new(move || {
            let _ = sender.send(());
        });
        (continuation, receiver)
    }

    /// Hands control back to the host.
    pub fn resume(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        self.fire();
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Trait for components reacting to lifecycle events.
pub trait HookHandler: Send + Sync {
    /// Handles `event`, resuming `next` exactly once.
    fn call<'a>(
        &'a self,
        next: Continuation,
        connection: &'a mut ConnectionState,
        event: &'a HookEvent,
    ) -> HookFuture<'a>;

    /// Events this handler registers for.
    fn hooks(&self) -> &[HookName];

    /// Returns the name of this handler.
    fn name(&self) -> &str;
}

/// Maps lifecycle events to their handlers, in registration order.
#[derive(Default)]
pub struct HookTable {
    handlers: HashMap<HookName, Vec<Arc<dyn HookHandler>>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every event it declares.
    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        for hook in handler.hooks() {
            self.handlers
                .entry(*hook)
                .or_default()
                .push(handler.clone());
        }
    }

    pub fn handlers(&self, hook: HookName) -> &[Arc<dyn HookHandler>] {
        self.handlers.get(&hook).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Runs every handler registered for `event`, one after the other,
    /// each to the resumption of its continuation.
    pub async fn dispatch(&self, connection: &mut ConnectionState, event: &HookEvent) {
        for handler in self.handlers(event.name()) {
            debug!(hook = %event.name(), handler = handler.name(), "Dispatching hook");
            let (next, resumed) = Continuation::channel();
            handler.call(next, connection, event).await;
            let _ = resumed.await;
        }
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("hooks", &self.handlers.len())
            .finish()
    }
}
