//! # rockbot-proto
//!
//! The wire contracts of the RockBot bus: every payload that crosses a
//! process boundary, and the topic names they travel on. Payloads are
//! plain serde types with camelCase keys; each carries its logical
//! message-type name via [`rockbot_bus::BusMessage`] so the dispatch
//! pipeline can route envelopes to typed handlers.

pub mod messages;
pub mod topics;

pub use messages::*;
