//! dts-hooks: notifications about completed intents.
//!
//! The orchestrator emits an [`events::IntentEvent`] after each intent
//! succeeds and whenever a composite intent stops part-way. Subscribers
//! register on a [`registry::HookRegistry`] by event name or `*`.

pub mod events;
pub mod registry;
