//! Session state machine.
//!
//! Owns the single live connection to the protocol engine and every mutation
//! of session state. The machine walks
//! `Idle → Connecting → {QrPending, Connected} → Closed → (Connecting | Terminated)`;
//! `Terminated` (explicit logout) is the only state that suppresses automatic
//! reconnection. All engine events funnel through [`SessionManager::handle_engine_event`],
//! so there is no shared mutable state outside the guarded `SessionInner`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::{EngineTransport, ProtocolEngine};
use crate::error::{RelayError, RelayResult};
use crate::relay::EventRelay;
use crate::store::{AuthState, Database};
use crate::types::{AccountIdentity, CloseReason, EngineEvent, RelayEvent};

pub mod qr;

/// How long a pairing challenge stays scannable, from issue time.
pub const QR_TTL_SECONDS: i64 = 20;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    QrPending,
    Connected,
    Closed,
    /// Logged out. Auto-reconnect is suppressed; a fresh `ensure_connected`
    /// call starts a clean pairing.
    Terminated,
}

/// The currently scannable pairing challenge.
#[derive(Debug, Clone)]
pub struct QrArtifact {
    pub challenge: String,
    pub issued_at: DateTime<Utc>,
}

impl QrArtifact {
    fn age(&self) -> Duration {
        Utc::now() - self.issued_at
    }

    fn is_stale(&self) -> bool {
        self.age() > Duration::seconds(QR_TTL_SECONDS)
    }
}

/// Snapshot of session state for status queries. Read without coordination
/// with event handlers; millisecond staleness is acceptable.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    #[serde(rename = "hasQR")]
    pub has_qr: bool,
    #[serde(rename = "qrAgeSeconds")]
    pub qr_age_seconds: Option<i64>,
}

type InitFuture = Shared<BoxFuture<'static, RelayResult<()>>>;

struct SessionInner {
    state: ConnectionState,
    active_qr: Option<QrArtifact>,
    account: Option<AccountIdentity>,
    transport: Option<Arc<dyn EngineTransport>>,
    /// At most one initialization in flight; doubles as the concurrency
    /// guard — late callers attach to this future instead of racing.
    in_flight: Option<InitFuture>,
}

/// Process-wide owner of the one logical session.
pub struct SessionManager {
    engine: Arc<dyn ProtocolEngine>,
    auth: AuthState,
    relay: EventRelay,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        db: Database,
        session_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            auth: AuthState::new(db.clone(), session_id),
            relay: EventRelay::new(db),
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Idle,
                active_qr: None,
                account: None,
                transport: None,
                in_flight: None,
            }),
        })
    }

    pub fn relay(&self) -> &EventRelay {
        &self.relay
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.relay.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn account(&self) -> Option<AccountIdentity> {
        self.inner.lock().account.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        let inner = self.inner.lock();
        StatusSnapshot {
            connected: inner.state == ConnectionState::Connected,
            has_qr: inner.active_qr.is_some(),
            qr_age_seconds: inner.active_qr.as_ref().map(|qr| qr.age().num_seconds()),
        }
    }

    /// Current pairing challenge, if one is scannable.
    ///
    /// A missing challenge and a stale one are distinct failures: the former
    /// means pairing has not produced a code yet, the latter that the caller
    /// must wait for the engine to rotate in a fresh one.
    pub fn qr_challenge(&self) -> RelayResult<String> {
        let inner = self.inner.lock();
        match &inner.active_qr {
            None => Err(RelayError::QrUnavailable),
            Some(qr) if qr.is_stale() => Err(RelayError::QrExpired),
            Some(qr) => Ok(qr.challenge.clone()),
        }
    }

    /// Transport of the live connection; requires `Connected`.
    pub fn transport(&self) -> RelayResult<Arc<dyn EngineTransport>> {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return Err(RelayError::NotConnected);
        }
        inner.transport.clone().ok_or(RelayError::NotConnected)
    }

    /// Connect if not already connected.
    ///
    /// Idempotent under concurrency: while an initialization is in flight
    /// every caller awaits the same shared future, and once it settles the
    /// attempt is still considered live through `Connecting` and `QrPending`,
    /// so exactly one underlying connection is opened per attempt. Only a
    /// closed or terminated session starts a fresh one.
    ///
    /// Boxed rather than `async fn` because the close handler schedules a
    /// reconnect through this same entry point; the recursion needs a
    /// nameable future type.
    pub fn ensure_connected(self: &Arc<Self>) -> BoxFuture<'static, RelayResult<()>> {
        let this = Arc::clone(self);
        async move { this.ensure_connected_inner().await }.boxed()
    }

    async fn ensure_connected_inner(self: Arc<Self>) -> RelayResult<()> {
        let init = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connected {
                return Ok(());
            }
            if let Some(init) = &inner.in_flight {
                init.clone()
            } else if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::QrPending
            ) {
                // An earlier attempt already opened the engine and is waiting
                // for pairing to finish; starting another would open a second
                // connection.
                return Ok(());
            } else {
                let this = Arc::clone(&self);
                let init: InitFuture = async move { this.initialize().await }.boxed().shared();
                inner.in_flight = Some(init.clone());
                init
            }
        };

        let outcome = init.await;

        let mut inner = self.inner.lock();
        if let Some(current) = &inner.in_flight {
            // Only retire a settled marker; a newer attempt may already be
            // in flight.
            if current.peek().is_some() {
                inner.in_flight = None;
            }
        }
        if outcome.is_err()
            && inner.in_flight.is_none()
            && inner.state == ConnectionState::Connecting
        {
            // A failed attempt must not wedge the machine mid-connect; drop
            // back so a later call can start over.
            inner.state = ConnectionState::Idle;
        }
        outcome
    }

    async fn initialize(self: Arc<Self>) -> RelayResult<()> {
        self.inner.lock().state = ConnectionState::Connecting;

        // Credential load gates the open; a store failure aborts the attempt.
        let creds = self
            .auth
            .load_creds()
            .map_err(|e| RelayError::Persistence(e.to_string()))?;
        if creds.is_some() {
            log::info!("resuming session {}", self.auth.session_id());
        } else {
            log::info!(
                "no stored credentials for session {}; pairing required",
                self.auth.session_id()
            );
        }

        let conn = self
            .engine
            .open(self.auth.clone())
            .await
            .map_err(|e| RelayError::Engine(e.to_string()))?;

        self.inner.lock().transport = Some(Arc::clone(&conn.transport));

        let this = Arc::clone(&self);
        let mut events = conn.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_engine_event(event).await;
            }
        });

        Ok(())
    }

    /// Interpret one engine event into a state transition.
    pub(crate) async fn handle_engine_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::PairingChallenge(challenge) => self.handle_pairing_challenge(challenge),
            EngineEvent::Opened(account) => self.handle_opened(account).await,
            EngineEvent::Closed(reason) => self.handle_closed(reason).await,
            EngineEvent::CredsUpdated(value) => self.handle_creds_updated(&value),
            EngineEvent::InboundMessage(raw) => {
                let transport = self.inner.lock().transport.clone();
                self.relay.handle_inbound(transport, raw).await;
            }
        }
    }

    fn handle_pairing_challenge(&self, challenge: String) {
        let issued_at = Utc::now();
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connected {
                // Engines can re-emit challenges; a live session wins.
                log::debug!("ignoring stale pairing challenge while connected");
                return;
            }
            inner.active_qr = Some(QrArtifact {
                challenge: challenge.clone(),
                issued_at,
            });
            inner.state = ConnectionState::QrPending;
        }
        log::info!("pairing challenge issued");

        let svg = match qr::render_svg(&challenge) {
            Ok(svg) => Some(svg),
            Err(e) => {
                log::warn!("failed to render QR code: {e}");
                None
            }
        };
        self.relay.broadcast(RelayEvent::QrIssued {
            challenge,
            issued_at,
            svg,
        });
    }

    async fn handle_opened(&self, mut account: AccountIdentity) {
        let transport = {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Connected;
            inner.active_qr = None;
            inner.transport.clone()
        };

        // Optional enrichment; lookup failure is discarded on purpose.
        if account.photo_url.is_none() {
            if let Some(transport) = transport {
                if let Ok(url) = transport.profile_picture_url(&account.jid).await {
                    account.photo_url = url;
                }
            }
        }

        self.inner.lock().account = Some(account.clone());
        log::info!("connected as {}", account.jid);
        self.relay.broadcast(RelayEvent::Connected { account });
    }

    async fn handle_closed(self: &Arc<Self>, reason: CloseReason) {
        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Closed;
            inner.active_qr = None;
            inner.transport = None;
            inner.account = None;
        }
        log::warn!("connection closed: {}", reason.as_str());
        self.relay.broadcast(RelayEvent::Disconnected {
            reason: reason.as_str().to_string(),
        });

        if reason.is_logged_out() {
            // Credentials are invalid now; wipe so the next attempt re-pairs.
            if let Err(e) = self.auth.wipe() {
                log::error!("failed to wipe credentials after logout: {e}");
            }
            self.inner.lock().state = ConnectionState::Terminated;
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.ensure_connected().await {
                log::error!("reconnect attempt failed: {e}");
            }
        });
    }

    fn handle_creds_updated(&self, value: &serde_json::Value) {
        // Losing this write can cost the session on the next restart.
        if let Err(e) = self.auth.save_creds(value) {
            log::error!("failed to persist credential update: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_qr(&self, seconds: i64) {
        if let Some(qr) = self.inner.lock().active_qr.as_mut() {
            qr.issued_at -= Duration::seconds(seconds);
        }
    }

    #[cfg(test)]
    pub(crate) fn auth(&self) -> &AuthState {
        &self.auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::types::jid::servers;
    use crate::types::JID;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn setup() -> (Arc<SessionManager>, SimEngine, Database) {
        let db = Database::in_memory().unwrap();
        let engine = SimEngine::manual();
        let session = SessionManager::new(Arc::new(engine.clone()), db.clone(), "default");
        (session, engine, db)
    }

    fn account() -> AccountIdentity {
        AccountIdentity {
            jid: JID::new("5511999999999", servers::DEFAULT_USER),
            name: Some("Test Account".into()),
            photo_url: None,
        }
    }

    async fn wait_for_opens(engine: &SimEngine, expected: usize) {
        for _ in 0..100 {
            if engine.open_count() >= expected {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!(
            "engine never reached {expected} opens (got {})",
            engine.open_count()
        );
    }

    #[tokio::test]
    async fn test_concurrent_ensure_connected_opens_once() {
        let (session, engine, _db) = setup();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.ensure_connected().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(engine.open_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_ensure_connected_during_pairing_opens_once() {
        let (session, engine, _db) = setup();
        session.ensure_connected().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);

        // The first attempt has settled but pairing has not finished;
        // follow-up calls must not open a second connection.
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref".into()))
            .await;
        session.ensure_connected().await.unwrap();

        assert_eq!(engine.open_count(), 1);
        assert_eq!(session.state(), ConnectionState::QrPending);
    }

    #[tokio::test]
    async fn test_ensure_connected_short_circuits_when_connected() {
        let (session, engine, _db) = setup();
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::Opened(account()))
            .await;

        session.ensure_connected().await.unwrap();
        assert_eq!(engine.open_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_challenge_transitions_and_broadcasts() {
        let (session, _engine, _db) = setup();
        let mut rx = session.subscribe();

        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref,abc".into()))
            .await;

        assert_eq!(session.state(), ConnectionState::QrPending);
        let status = session.status();
        assert!(!status.connected);
        assert!(status.has_qr);
        assert_eq!(status.qr_age_seconds, Some(0));

        match rx.try_recv().unwrap() {
            RelayEvent::QrIssued { challenge, svg, .. } => {
                assert_eq!(challenge, "ref,abc");
                assert!(svg.is_some());
            }
            other => panic!("expected qr-issued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_pairing_challenge_ignored_when_connected() {
        let (session, _engine, _db) = setup();
        session
            .handle_engine_event(EngineEvent::Opened(account()))
            .await;

        session
            .handle_engine_event(EngineEvent::PairingChallenge("stale".into()))
            .await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!session.status().has_qr);
        assert_eq!(session.qr_challenge(), Err(RelayError::QrUnavailable));
    }

    #[tokio::test]
    async fn test_qr_absent_vs_expired_are_distinct() {
        let (session, _engine, _db) = setup();
        assert_eq!(session.qr_challenge(), Err(RelayError::QrUnavailable));

        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref,abc".into()))
            .await;
        assert_eq!(session.qr_challenge(), Ok("ref,abc".into()));

        session.backdate_qr(QR_TTL_SECONDS + 1);
        assert_eq!(session.qr_challenge(), Err(RelayError::QrExpired));
    }

    #[tokio::test]
    async fn test_opened_clears_qr_and_broadcasts_account() {
        let (session, _engine, _db) = setup();
        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref,abc".into()))
            .await;
        let mut rx = session.subscribe();

        session
            .handle_engine_event(EngineEvent::Opened(account()))
            .await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!session.status().has_qr);
        assert_eq!(
            session.account().unwrap().jid.to_string(),
            "5511999999999@s.whatsapp.net"
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            RelayEvent::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_logout_wipes_credentials_and_terminates() {
        let (session, engine, db) = setup();
        session.ensure_connected().await.unwrap();
        session.auth().save_creds(&json!({"a": 1})).unwrap();
        session.auth().set_key("pre-key", "1", &json!(2)).unwrap();

        session
            .handle_engine_event(EngineEvent::Closed(CloseReason::LoggedOut))
            .await;

        assert_eq!(session.state(), ConnectionState::Terminated);
        assert_eq!(db.kv_count_prefix("default:").unwrap(), 0);

        // No automatic reconnection from Terminated.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(engine.open_count(), 1);
    }

    #[tokio::test]
    async fn test_non_logout_close_reconnects_once() {
        let (session, engine, _db) = setup();
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref".into()))
            .await;

        session
            .handle_engine_event(EngineEvent::Closed(CloseReason::NetworkError(
                "reset".into(),
            )))
            .await;

        wait_for_opens(&engine, 2).await;
        assert!(!session.status().has_qr);

        // Exactly one reconnect per closure.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test]
    async fn test_close_broadcasts_disconnected() {
        let (session, _engine, _db) = setup();
        let mut rx = session.subscribe();

        session
            .handle_engine_event(EngineEvent::Closed(CloseReason::Replaced))
            .await;

        match rx.try_recv().unwrap() {
            RelayEvent::Disconnected { reason } => assert_eq!(reason, "replaced"),
            other => panic!("expected disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_creds_update_persists_through_auth_state() {
        let (session, _engine, _db) = setup();
        let creds = json!({
            "noiseKey": { "private": { "type": "Buffer", "data": [9, 9, 9] } }
        });

        session
            .handle_engine_event(EngineEvent::CredsUpdated(creds.clone()))
            .await;

        assert_eq!(session.auth().load_creds().unwrap(), Some(creds));
    }

    #[tokio::test]
    async fn test_failed_open_allows_retry() {
        let (session, engine, _db) = setup();
        engine.fail_opens(true);

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(err, RelayError::Engine(_)));
        assert_eq!(session.state(), ConnectionState::Idle);

        engine.fail_opens(false);
        session.ensure_connected().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_initialization_allows_retry() {
        // An engine whose events channel is replaced on each open still
        // counts opens; force a failure path by ensuring after terminate.
        let (session, engine, _db) = setup();
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::Closed(CloseReason::LoggedOut))
            .await;
        assert_eq!(session.state(), ConnectionState::Terminated);

        // An explicit call from Terminated starts a fresh pairing attempt.
        session.ensure_connected().await.unwrap();
        assert_eq!(engine.open_count(), 2);
    }
}
