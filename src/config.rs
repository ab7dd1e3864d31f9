//! Runtime configuration for the relay.

use std::path::PathBuf;

/// Configuration consumed by the binary and the server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// SQLite database file; parent directories are created on open.
    pub database_path: PathBuf,
    /// Scope for stored credentials, allowing several accounts to share one
    /// database file.
    pub session_id: String,
    /// Exact origin allowed by CORS; `None` means permissive.
    pub frontend_origin: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            database_path: PathBuf::from("data/warelay.db"),
            session_id: "default".into(),
            frontend_origin: None,
        }
    }
}

impl RelayConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_frontend_origin(mut self, origin: impl Into<String>) -> Self {
        self.frontend_origin = Some(origin.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = RelayConfig::default()
            .with_bind_addr("127.0.0.1:9000")
            .with_session_id("alt")
            .with_frontend_origin("http://localhost:5173");

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.session_id, "alt");
        assert_eq!(
            config.frontend_origin.as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(config.database_path, PathBuf::from("data/warelay.db"));
    }
}
