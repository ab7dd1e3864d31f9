//! Event normalization and relay.
//!
//! Converts raw engine events into the stable [`RelayEvent`] envelope, writes
//! the durable message log, and fans events out to subscribers. Broadcast is
//! fire-and-forget: no delivery confirmation, no replay for subscribers that
//! attach later. Log writes never block relay delivery.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::broadcast;

use crate::engine::EngineTransport;
use crate::store::Database;
use crate::types::{MessageRecord, MessageStatus, RawContent, RawMedia, RawMessage, RelayEvent};

/// Subscribers further behind than this lose events, by design.
const CHANNEL_CAPACITY: usize = 256;

/// Persists message records and broadcasts normalized events.
pub struct EventRelay {
    db: Database,
    events: broadcast::Sender<RelayEvent>,
}

impl EventRelay {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Deliver an event to all current subscribers, exactly once each.
    pub fn broadcast(&self, event: RelayEvent) {
        // Err means no subscribers right now; that is fine.
        let _ = self.events.send(event);
    }

    /// Persist and announce a delivered outbound message.
    pub fn record_outbound(&self, record: MessageRecord) {
        if let Err(e) = self.db.insert_message(&record) {
            log::warn!("failed to persist outbound message: {e}");
        }
        self.broadcast(RelayEvent::MessageSent { message: record });
    }

    /// Persist a failed send attempt. Best-effort only: a log failure here
    /// must never mask the transport error the caller is about to surface.
    pub fn record_failure(&self, record: MessageRecord) {
        if let Err(e) = self.db.insert_message(&record) {
            log::warn!("failed to persist failed-send record: {e}");
        }
    }

    /// Normalize, persist and relay one inbound message.
    pub async fn handle_inbound(
        &self,
        transport: Option<Arc<dyn EngineTransport>>,
        raw: RawMessage,
    ) {
        if raw.key.from_me {
            return;
        }

        let chat = raw.key.remote_jid.clone();
        // In a group chat the interesting sender is the participant, not the
        // group address.
        let sender = if chat.is_group() {
            raw.key.participant.clone().unwrap_or_else(|| chat.clone())
        } else {
            chat.clone()
        };

        let mut record = MessageRecord::new(chat.to_string(), MessageStatus::Received);
        record.body = extract_text(&raw.content);
        record.sender_id = Some(sender.to_string());
        record.sender_name = raw.push_name.clone();

        if let Some(transport) = &transport {
            // Read receipt and profile photo are optional enrichments;
            // failures are discarded on purpose.
            let _ = transport.mark_read(&raw.key).await;
            if let Ok(url) = transport.profile_picture_url(&sender).await {
                record.sender_photo_url = url;
            }
        }

        if let Some(media) = first_media(&raw.content) {
            record.file_name = media.file_name.clone();
            if media.inline.is_some() {
                if let Some(transport) = &transport {
                    match transport.fetch_media(media).await {
                        Ok(bytes) => record.image_base64 = Some(BASE64.encode(bytes)),
                        Err(e) => log::warn!("failed to fetch inline media: {e}"),
                    }
                }
            } else {
                record.image_url = media.url.clone();
            }
        }

        if let Err(e) = self.db.insert_message(&record) {
            log::warn!("failed to persist inbound message: {e}");
        }
        self.broadcast(RelayEvent::MessageReceived { message: record });
    }
}

/// Best available text across the content shapes, first non-empty wins.
fn extract_text(content: &RawContent) -> Option<String> {
    let caption = |media: &Option<RawMedia>| media.as_ref().and_then(|m| m.caption.clone());
    [
        content.conversation.clone(),
        content.extended_text.clone(),
        caption(&content.image),
        caption(&content.video),
        caption(&content.document),
        content.template_reply.clone(),
    ]
    .into_iter()
    .flatten()
    .find(|text| !text.is_empty())
}

fn first_media(content: &RawContent) -> Option<&RawMedia> {
    content
        .image
        .as_ref()
        .or(content.video.as_ref())
        .or(content.document.as_ref())
}
