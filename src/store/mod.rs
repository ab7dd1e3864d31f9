//! Durable persistence: credential key-value store and message log.

pub mod auth;
pub mod buffer_json;
pub mod sqlite;

pub use auth::AuthState;
pub use sqlite::{Database, StoreError, StoreResult};
