use std::time::Duration;

use url::Url;

use crate::config::SessionMode;

use super::ConnectionError;

/// Configuration for the agent socket connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Base URL of the agent endpoint (scheme optional).
    pub base_url: String,
    /// User identity the connection is keyed by.
    pub user_id: String,
    /// Live vs test agent mode.
    pub mode: SessionMode,
    /// Resume an existing session when known.
    pub session_id: Option<String>,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
}

impl SocketConfig {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_id: user_id.into(),
            mode: SessionMode::Live,
            session_id: None,
            ping_interval: Duration::from_secs(30),
        }
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Build the full WebSocket URL with identity query parameters.
    pub fn build_url(&self) -> Result<Url, ConnectionError> {
        let mut base = self.base_url.clone();

        if !base.starts_with("ws://") && !base.starts_with("wss://") {
            base = if let Some(rest) = base.strip_prefix("https://") {
                format!("wss://{rest}")
            } else if let Some(rest) = base.strip_prefix("http://") {
                format!("ws://{rest}")
            } else if base.contains("127.0.0.1") || base.contains("localhost") {
                format!("ws://{base}")
            } else {
                format!("wss://{base}")
            };
        }

        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference.
        if base.contains("localhost") {
            base = base.replace("localhost", "127.0.0.1");
        }

        let mut url = Url::parse(&base)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", &self.user_id);
            query.append_pair("mode", self.mode.as_str());
            if let Some(session_id) = &self.session_id {
                query.append_pair("session_id", session_id);
            }
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_plain_scheme_for_localhost() {
        let url = SocketConfig::new("localhost:8000/ws", "user-1")
            .build_url()
            .unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.host_str(), Some("127.0.0.1"));
    }

    #[test]
    fn infers_tls_scheme_for_remote_hosts() {
        let url = SocketConfig::new("agent.example.com/ws", "user-1")
            .build_url()
            .unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn rewrites_http_schemes() {
        let url = SocketConfig::new("https://agent.example.com/ws", "user-1")
            .build_url()
            .unwrap();
        assert_eq!(url.scheme(), "wss");
        let url = SocketConfig::new("http://localhost:8000/ws", "user-1")
            .build_url()
            .unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn appends_identity_query_parameters() {
        let url = SocketConfig::new("ws://127.0.0.1:8000/ws", "user-7")
            .with_mode(SessionMode::Test)
            .with_session_id("sess-42")
            .build_url()
            .unwrap();
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("user_id".into(), "user-7".into())));
        assert!(query.contains(&("mode".into(), "test".into())));
        assert!(query.contains(&("session_id".into(), "sess-42".into())));
    }

    #[test]
    fn omits_session_id_when_absent() {
        let url = SocketConfig::new("ws://127.0.0.1:8000/ws", "user-7")
            .build_url()
            .unwrap();
        assert!(!url.query().unwrap_or_default().contains("session_id"));
    }
}
