//! Doppel: a persona-driven auto-responder core.
//!
//! Incoming messages from registered transports are recorded per
//! conversation, run through a relationship-aware decision engine, and —
//! when the persona chooses to speak — answered by a local language model
//! and sent back out through the originating transport.

pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod persona;
pub mod store;
pub mod telegram;

pub use engine::{ChannelTransport, EventSink, PersonaEngine, Transport};
pub use error::{DoppelError, Result};
pub use generator::{Generator, OllamaGenerator};
pub use store::{ConversationKey, ConversationStore, Message, Role};
