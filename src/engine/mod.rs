//! Protocol engine binding.
//!
//! The wire-level protocol (handshake, encryption, multi-device key
//! agreement) is not implemented here. The relay consumes an engine through
//! these traits: `open` yields a live connection that emits [`EngineEvent`]s
//! and accepts outbound sends. Everything the state machine knows about the
//! protocol flows through this seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::AuthState;
use crate::types::{EngineEvent, RawMedia, RawMessageKey, JID};

pub mod sim;

/// Errors produced by the engine binding.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("media fetch failed: {0}")]
    MediaFailed(String),
}

/// Content accepted by the engine for outbound sends.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    Text(String),
    Image {
        bytes: Vec<u8>,
        caption: Option<String>,
        mimetype: String,
        file_name: String,
    },
}

/// Acknowledgment returned by the engine for a delivered message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub timestamp: i64,
}

/// Send/side-lookup surface of a live connection.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    async fn send(
        &self,
        to: &JID,
        content: OutboundContent,
    ) -> Result<DeliveryReceipt, EngineError>;

    /// Mark a message as read. Best-effort; callers discard failures.
    async fn mark_read(&self, key: &RawMessageKey) -> Result<(), EngineError>;

    /// Resolve a profile photo URL. Best-effort; callers discard failures.
    async fn profile_picture_url(&self, jid: &JID) -> Result<Option<String>, EngineError>;

    /// Download the payload behind an inline media reference.
    async fn fetch_media(&self, media: &RawMedia) -> Result<Vec<u8>, EngineError>;
}

/// A live connection: an event stream plus a transport handle.
pub struct EngineConnection {
    pub transport: Arc<dyn EngineTransport>,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Factory for connections. The session state machine holds exactly one
/// implementation and opens at most one connection at a time.
#[async_trait]
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Open a connection using persisted auth state.
    ///
    /// Resolves once the connection attempt is underway; pairing, opened and
    /// closed outcomes arrive later as events on the returned stream.
    async fn open(&self, auth: AuthState) -> Result<EngineConnection, EngineError>;
}
