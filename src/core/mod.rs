//! Client-side conversation engine.

pub mod conversation;
pub mod events;

pub use conversation::{Conversation, ConversationSettings, ConversationState, StopHandle};
pub use events::{ConversationEvent, TurnOutcome};
