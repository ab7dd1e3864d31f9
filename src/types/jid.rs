//! WhatsApp JID (Jabber ID) types.
//!
//! JIDs identify users and groups on the protocol. The relay only ever deals
//! with plain user/server pairs; device-specific AD-JIDs stay inside the
//! protocol engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
}

/// MessageID is the internal ID of a WhatsApp message.
pub type MessageID = String;

/// JID represents a WhatsApp user or group address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct JID {
    pub user: String,
    pub server: String,
}

impl JID {
    /// Creates a new JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// Returns true if this JID addresses a group chat.
    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJIDError(pub String);

impl fmt::Display for ParseJIDError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse JID: {}", self.0)
    }
}

impl std::error::Error for ParseJIDError {}

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            None => Ok(JID::new("", s)),
            Some((user, server)) => {
                // Strip any device/agent suffix the engine may attach.
                let user = user.split_once(':').map(|(u, _)| u).unwrap_or(user);
                let user = user.split_once('.').map(|(u, _)| u).unwrap_or(user);
                Ok(JID::new(user, server))
            }
        }
    }
}

/// Normalizes a caller-supplied destination into a protocol-addressable JID.
///
/// Accepts anything with digits in it (`+55 11 99999-9999`, `5511999999999`);
/// everything else is rejected. Digits are sent to the default user server.
pub fn normalize_destination(input: &str) -> Option<JID> {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    Some(JID::new(digits, servers::DEFAULT_USER))
}
