//! Core types shared across the relay.

pub mod events;
pub mod jid;

pub use events::{
    AccountIdentity, CloseReason, EngineEvent, MessageRecord, MessageStatus, RawContent, RawMedia,
    RawMessage, RawMessageKey, RelayEvent,
};
pub use jid::{normalize_destination, MessageID, JID};
