//! WhatsApp relay session manager.
//!
//! warelay keeps one authenticated WhatsApp session alive behind a small
//! HTTP surface: QR pairing, durable credentials in SQLite, a validated send
//! endpoint and normalized message events streamed over WebSocket. The wire
//! protocol itself sits behind the [`engine::ProtocolEngine`] seam, so the
//! session machinery is testable without a network.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod relay;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

pub use config::RelayConfig;
pub use dispatch::{Dispatcher, SendRequest};
pub use error::{RelayError, RelayResult};
pub use relay::EventRelay;
pub use session::{ConnectionState, SessionManager, StatusSnapshot};
pub use store::{AuthState, Database};
