//! Hook registry: subscriptions and dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::IntentEvent;

/// Async hook handler function type.
pub type HookHandler =
    Arc<dyn Fn(IntentEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Subscribe with this name to receive every event.
pub const WILDCARD: &str = "*";

pub struct HookRegistry {
    /// Event name to handlers.
    handlers: RwLock<HashMap<String, Vec<HookHandler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for one event name, or [`WILDCARD`].
    pub async fn on(&self, event_name: &str, handler: HookHandler) {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    /// Dispatch an event to its subscribers, each on its own task.
    /// Returns without waiting for the handlers.
    pub async fn emit(&self, event: IntentEvent) {
        let handlers = self.handlers.read().await;
        let matching = [event.name(), WILDCARD]
            .into_iter()
            .filter_map(|name| handlers.get(name))
            .flatten();

        let mut dispatched = 0usize;
        for handler in matching {
            let event = event.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(event).await;
            });
            dispatched += 1;
        }
        tracing::debug!(event = event.name(), handlers = dispatched, "Hook event emitted");
    }
}

/// Handler that records each event as a structured log line.
pub fn log_handler() -> HookHandler {
    Arc::new(|event: IntentEvent| {
        Box::pin(async move {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            tracing::info!(event = event.name(), %payload, "Intent completed");
        })
    })
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
