//! Simulated protocol engine.
//!
//! Stands in for a real wire implementation during development and in tests:
//! connections open instantly, sends are recorded instead of transmitted,
//! and lifecycle events are driven from the outside through [`SimEngine::emit`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

use crate::engine::{
    DeliveryReceipt, EngineConnection, EngineError, EngineTransport, OutboundContent,
    ProtocolEngine,
};
use crate::store::AuthState;
use crate::types::{EngineEvent, RawMedia, RawMessageKey, JID};

const EVENT_BUFFER: usize = 32;

struct SimInner {
    open_count: AtomicUsize,
    fail_opens: AtomicBool,
    fail_sends: AtomicBool,
    auto_challenge: bool,
    event_tx: Mutex<Option<mpsc::Sender<EngineEvent>>>,
    sent: Mutex<Vec<(JID, OutboundContent)>>,
}

/// In-process engine double. Clone handles share state.
#[derive(Clone)]
pub struct SimEngine {
    inner: Arc<SimInner>,
}

impl SimEngine {
    /// Engine that issues a pairing challenge as soon as a connection opens.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Engine that stays silent until events are emitted manually.
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(auto_challenge: bool) -> Self {
        Self {
            inner: Arc::new(SimInner {
                open_count: AtomicUsize::new(0),
                fail_opens: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                auto_challenge,
                event_tx: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deliver an event on the most recently opened connection.
    ///
    /// Returns false when no connection is open or the receiver is gone.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        let tx = self.inner.event_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// How many connections have been opened so far.
    pub fn open_count(&self) -> usize {
        self.inner.open_count.load(Ordering::SeqCst)
    }

    /// Everything sent through the transport, in order.
    pub fn sent(&self) -> Vec<(JID, OutboundContent)> {
        self.inner.sent.lock().clone()
    }

    /// Make subsequent sends fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent connection attempts fail.
    pub fn fail_opens(&self, fail: bool) {
        self.inner.fail_opens.store(fail, Ordering::SeqCst);
    }

    fn challenge() -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        format!("sim-ref,{token}")
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolEngine for SimEngine {
    async fn open(&self, _auth: AuthState) -> Result<EngineConnection, EngineError> {
        self.inner.open_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_opens.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionFailed("simulated open failure".into()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        if self.inner.auto_challenge {
            let _ = tx.try_send(EngineEvent::PairingChallenge(Self::challenge()));
        }
        *self.inner.event_tx.lock() = Some(tx);

        Ok(EngineConnection {
            transport: Arc::new(SimTransport {
                inner: Arc::clone(&self.inner),
            }),
            events: rx,
        })
    }
}

struct SimTransport {
    inner: Arc<SimInner>,
}

#[async_trait]
impl EngineTransport for SimTransport {
    async fn send(
        &self,
        to: &JID,
        content: OutboundContent,
    ) -> Result<DeliveryReceipt, EngineError> {
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::SendFailed("simulated send failure".into()));
        }
        self.inner.sent.lock().push((to.clone(), content));
        Ok(DeliveryReceipt {
            message_id: format!("{:X}", rand::random::<u64>()),
            timestamp: Utc::now().timestamp(),
        })
    }

    async fn mark_read(&self, _key: &RawMessageKey) -> Result<(), EngineError> {
        Ok(())
    }

    async fn profile_picture_url(&self, _jid: &JID) -> Result<Option<String>, EngineError> {
        Ok(None)
    }

    async fn fetch_media(&self, media: &RawMedia) -> Result<Vec<u8>, EngineError> {
        media
            .inline
            .clone()
            .ok_or_else(|| EngineError::MediaFailed("no inline payload".into()))
    }
}
