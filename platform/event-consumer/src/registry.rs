//! Dispatch table from `event_type` to handler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::EventHandler;

/// Maps event types to their handlers
///
/// ```rust
/// use event_consumer::{EventContext, EventHandler, HandlerError, HandlerRegistry};
/// use std::sync::Arc;
///
/// struct Noop;
///
/// #[async_trait::async_trait]
/// impl EventHandler for Noop {
///     async fn handle(&self, _: &EventContext, _: &serde_json::Value) -> Result<(), HandlerError> {
///         Ok(())
///     }
/// }
///
/// let mut registry = HandlerRegistry::new();
/// registry.register("Lead.New", Arc::new(Noop));
/// assert!(registry.lookup("Lead.New").is_some());
/// assert!(registry.lookup("Offer.Sent").is_none());
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            tracing::warn!(event_type = %event_type, "Replaced existing handler registration");
        }
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_handler(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn lookup(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
