//! Crate-level error kinds.
//!
//! Each variant maps to a distinct caller-visible failure mode; the HTTP
//! layer relies on the variants staying distinguishable (validation vs
//! not-connected vs transport), so never collapse them into a catch-all.

use thiserror::Error;

/// Errors surfaced by the relay core.
///
/// Clone is required because initialization failures are observed by every
/// caller attached to the shared in-flight future.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    /// Malformed caller input. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The session is not connected; the caller should trigger pairing.
    #[error("not connected; scan the QR code first")]
    NotConnected,

    /// No pairing challenge has been issued yet.
    #[error("no QR code available yet")]
    QrUnavailable,

    /// The pairing challenge outlived its time-to-live.
    #[error("QR code expired; wait for a fresh pairing challenge")]
    QrExpired,

    /// QR artifact could not be rendered.
    #[error("failed to render QR code: {0}")]
    QrRender(String),

    /// The protocol engine rejected or failed an outbound send.
    #[error("send failed: {0}")]
    Transport(String),

    /// Durable store failure that gates correctness.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Protocol engine failure outside of sends (open, event delivery).
    #[error("protocol engine error: {0}")]
    Engine(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
