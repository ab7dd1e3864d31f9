//! Event types exchanged with the protocol engine and relayed to subscribers.
//!
//! Two layers live here: the raw shapes the engine delivers (`EngineEvent`
//! and friends) and the normalized, broadcastable envelope (`RelayEvent`)
//! together with the durable `MessageRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MessageID, JID};

/// Reason for a connection closure, as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Session was logged out on the companion device. Terminal: credentials
    /// are invalid and must be wiped.
    LoggedOut,
    /// Connection replaced by another client instance.
    Replaced,
    /// Server requested the disconnect.
    ServerRequested,
    /// Network-level failure.
    NetworkError(String),
    /// Unknown reason
    Unknown,
}

impl CloseReason {
    /// Only a logout invalidates the stored credentials.
    pub fn is_logged_out(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }

    pub fn as_str(&self) -> &str {
        match self {
            CloseReason::LoggedOut => "logged-out",
            CloseReason::Replaced => "replaced",
            CloseReason::ServerRequested => "server-requested",
            CloseReason::NetworkError(_) => "network-error",
            CloseReason::Unknown => "unknown",
        }
    }
}

/// Identity of the account once the connection opens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// Normalized account address.
    pub jid: JID,
    /// Display name, if the engine knows it.
    pub name: Option<String>,
    /// Profile photo URL, resolved best-effort after connect.
    pub photo_url: Option<String>,
}

/// Key identifying a message on the wire, used for read receipts.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessageKey {
    pub id: MessageID,
    /// Chat the message arrived in (user JID for 1:1, group JID for groups).
    pub remote_jid: JID,
    /// Actual sender inside a group chat.
    pub participant: Option<JID>,
    pub from_me: bool,
}

/// Media attachment as delivered by the engine, before normalization.
///
/// Exactly one of `inline` / `url` is expected to be set; the engine decides
/// whether it hands over bytes or a remote reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMedia {
    pub caption: Option<String>,
    pub inline: Option<Vec<u8>>,
    pub url: Option<String>,
    pub mimetype: Option<String>,
    pub file_name: Option<String>,
}

/// Message content shapes the engine can deliver.
///
/// Mirrors the protocol's message union; the normalizer picks the best
/// available text across these fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContent {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image: Option<RawMedia>,
    pub video: Option<RawMedia>,
    pub document: Option<RawMedia>,
    /// Selected display text of a template button reply.
    pub template_reply: Option<String>,
}

/// An inbound message exactly as the engine delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub key: RawMessageKey,
    /// Push (display) name of the sender, if present on the frame.
    pub push_name: Option<String>,
    /// Message timestamp in unix seconds.
    pub timestamp: i64,
    pub content: RawContent,
}

/// Events delivered by the protocol engine binding.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pairing challenge that must be rendered as a QR code and scanned.
    PairingChallenge(String),
    /// The connection is open and authenticated.
    Opened(AccountIdentity),
    /// The connection closed.
    Closed(CloseReason),
    /// Credential material changed and must be persisted before the engine
    /// proceeds.
    CredsUpdated(serde_json::Value),
    /// An inbound message arrived.
    InboundMessage(RawMessage),
}

/// Delivery/ingestion status of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Received,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Received => "received",
            MessageStatus::Failed => "failed",
        }
    }
}

/// Durable message-log entry. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    /// Destination address for outbound, source address for inbound.
    pub address: String,
    pub body: Option<String>,
    /// Remote media reference. Mutually exclusive with `image_base64`.
    pub image_url: Option<String>,
    /// Inline media payload, base64-encoded. Mutually exclusive with `image_url`.
    pub image_base64: Option<String>,
    pub file_name: Option<String>,
    pub sender_name: Option<String>,
    pub sender_id: Option<String>,
    /// Best-effort profile photo of the sender; absent when the lookup
    /// failed or was skipped.
    pub sender_photo_url: Option<String>,
    /// Client-supplied ordering hint, passed through untouched.
    pub ordering_hint: Option<i64>,
    pub status: MessageStatus,
    /// Only set when `status` is `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Starts a record with a fresh id and timestamp; callers fill the rest.
    pub fn new(address: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address: address.into(),
            body: None,
            image_url: None,
            image_base64: None,
            file_name: None,
            sender_name: None,
            sender_id: None,
            sender_photo_url: None,
            ordering_hint: None,
            status,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// True when the media invariant holds: at most one of url/inline.
    pub fn media_exclusive(&self) -> bool {
        !(self.image_url.is_some() && self.image_base64.is_some())
    }
}

/// Normalized envelope broadcast to subscribers. Not persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
    QrIssued {
        challenge: String,
        issued_at: DateTime<Utc>,
        /// Pre-rendered SVG, when rendering succeeded.
        svg: Option<String>,
    },
    Connected {
        account: AccountIdentity,
    },
    Disconnected {
        reason: String,
    },
    MessageReceived {
        message: MessageRecord,
    },
    MessageSent {
        message: MessageRecord,
    },
}
