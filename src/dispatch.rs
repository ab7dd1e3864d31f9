//! Outbound message dispatcher.
//!
//! Validates send requests, normalizes the destination, hands the content to
//! the live transport and records the outcome in the message log.

use std::io::Read;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::engine::{DeliveryReceipt, OutboundContent};
use crate::error::{RelayError, RelayResult};
use crate::session::SessionManager;
use crate::types::{normalize_destination, MessageRecord, MessageStatus};

const DEFAULT_MIMETYPE: &str = "image/jpeg";
const DEFAULT_FILE_NAME: &str = "image.jpg";

/// Caller-facing send request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub to: String,
    pub message: Option<String>,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub file_name: Option<String>,
    pub ordering_hint: Option<i64>,
}

pub struct Dispatcher {
    session: Arc<SessionManager>,
}

impl Dispatcher {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Validate and transmit one message.
    ///
    /// Fails with a validation error before touching the session, with a
    /// not-connected error when there is no live transport, and with a
    /// transport error when the engine rejects the send. Failed attempts are
    /// logged best-effort; the transport error always wins.
    pub async fn send(&self, request: SendRequest) -> RelayResult<DeliveryReceipt> {
        let to = normalize_destination(&request.to).ok_or_else(|| {
            RelayError::Validation("field \"to\" is required, e.g. +5511999999999".into())
        })?;

        let text = request.message.clone().filter(|m| !m.is_empty());
        if text.is_none() && request.image_url.is_none() && request.image_base64.is_none() {
            return Err(RelayError::Validation(
                "provide \"message\" and/or \"imageUrl\"/\"imageBase64\"".into(),
            ));
        }

        let transport = self.session.transport()?;
        let content = build_content(&request, text.clone()).await?;

        // The URL wins when both media fields arrive; the logged record
        // carries exactly one of them.
        let image_url = request.image_url;
        let image_base64 = if image_url.is_some() {
            None
        } else {
            request.image_base64
        };

        match transport.send(&to, content).await {
            Ok(receipt) => {
                let mut record = MessageRecord::new(to.to_string(), MessageStatus::Sent);
                record.body = text;
                record.image_url = image_url;
                record.image_base64 = image_base64;
                record.file_name = request.file_name;
                record.ordering_hint = request.ordering_hint;
                self.session.relay().record_outbound(record);
                Ok(receipt)
            }
            Err(e) => {
                let mut record = MessageRecord::new(to.to_string(), MessageStatus::Failed);
                record.body = text;
                record.image_url = image_url;
                record.image_base64 = image_base64;
                record.file_name = request.file_name;
                record.ordering_hint = request.ordering_hint;
                record.error = Some(e.to_string());
                self.session.relay().record_failure(record);
                Err(RelayError::Transport(e.to_string()))
            }
        }
    }
}

async fn build_content(
    request: &SendRequest,
    caption: Option<String>,
) -> RelayResult<OutboundContent> {
    if let Some(url) = &request.image_url {
        let bytes = fetch_image(url.clone()).await?;
        return Ok(OutboundContent::Image {
            bytes,
            caption,
            mimetype: DEFAULT_MIMETYPE.into(),
            file_name: request
                .file_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FILE_NAME.into()),
        });
    }

    if let Some(encoded) = &request.image_base64 {
        let bytes = BASE64
            .decode(strip_data_url_prefix(encoded))
            .map_err(|e| RelayError::Validation(format!("invalid imageBase64: {e}")))?;
        return Ok(OutboundContent::Image {
            bytes,
            caption,
            mimetype: DEFAULT_MIMETYPE.into(),
            file_name: request
                .file_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FILE_NAME.into()),
        });
    }

    Ok(OutboundContent::Text(caption.unwrap_or_default()))
}

/// Drop a `data:image/jpeg;base64,` style prefix if present.
fn strip_data_url_prefix(encoded: &str) -> &str {
    if !encoded.starts_with("data:") {
        return encoded;
    }
    match encoded.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => encoded,
    }
}

/// Download a remote image into memory. ureq is blocking, so the fetch runs
/// on the blocking pool.
async fn fetch_image(url: String) -> RelayResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let response = ureq::get(&url)
            .call()
            .map_err(|e| RelayError::Transport(format!("failed to fetch imageUrl: {e}")))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| RelayError::Transport(format!("failed to read imageUrl body: {e}")))?;
        Ok(bytes)
    })
    .await
    .map_err(|e| RelayError::Transport(format!("image fetch task failed: {e}")))?
}
