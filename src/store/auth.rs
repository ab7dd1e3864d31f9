//! Session-scoped credential store adapter.
//!
//! Wraps the key-value table with the namespacing scheme the engine expects:
//! `"{session_id}:creds"` for the credential blob and
//! `"{session_id}:keys:{type}:{id}"` for key material. All values pass
//! through the binary-safe encoding in [`buffer_json`](super::buffer_json).

use serde_json::Value;

use crate::store::buffer_json;
use crate::store::sqlite::{Database, StoreResult};

/// Legacy unscoped credential key from before sessions were namespaced.
const LEGACY_CREDS_KEY: &str = "creds";

#[derive(Clone)]
pub struct AuthState {
    db: Database,
    session_id: String,
}

impl AuthState {
    pub fn new(db: Database, session_id: impl Into<String>) -> Self {
        Self {
            db,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn creds_key(&self) -> String {
        format!("{}:creds", self.session_id)
    }

    fn key_name(&self, kind: &str, id: &str) -> String {
        format!("{}:keys:{}:{}", self.session_id, kind, id)
    }

    /// Load the credential blob.
    ///
    /// Falls back to the legacy unscoped key when the scoped key is absent.
    /// The fallback applies to the creds record only — key material was
    /// never stored unscoped, so [`get_key`](Self::get_key) has none.
    pub fn load_creds(&self) -> StoreResult<Option<Value>> {
        if let Some(raw) = self.db.kv_get(&self.creds_key())? {
            return Ok(Some(buffer_json::decode(raw)));
        }
        if let Some(raw) = self.db.kv_get(LEGACY_CREDS_KEY)? {
            return Ok(Some(buffer_json::decode(raw)));
        }
        Ok(None)
    }

    /// Overwrite the credential blob.
    pub fn save_creds(&self, value: &Value) -> StoreResult<()> {
        self.db
            .kv_set(&self.creds_key(), &buffer_json::encode(value.clone()))
    }

    /// Fetch one piece of key material.
    pub fn get_key(&self, kind: &str, id: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .db
            .kv_get(&self.key_name(kind, id))?
            .map(buffer_json::decode))
    }

    /// Store one piece of key material.
    pub fn set_key(&self, kind: &str, id: &str, value: &Value) -> StoreResult<()> {
        self.db.kv_set(
            &self.key_name(kind, id),
            &buffer_json::encode(value.clone()),
        )
    }

    /// Invalidate all key material for this session, keeping the creds blob.
    pub fn clear_keys(&self) -> StoreResult<usize> {
        self.db
            .kv_delete_prefix(&format!("{}:keys:", self.session_id))
    }

    /// Wipe everything stored for this session. Used on logout.
    pub fn wipe(&self) -> StoreResult<usize> {
        self.db.kv_delete_prefix(&format!("{}:", self.session_id))
    }
}
