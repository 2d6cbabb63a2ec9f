use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use clap::ValueEnum;

/// Agent conversation mode, forwarded as a query parameter on connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SessionMode {
    #[default]
    Live,
    Test,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Live => "live",
            SessionMode::Test => "test",
        }
    }
}

/// Bounded exponential backoff settings for the reconnect loop.
///
/// The defaults are carried values, not invariants; callers may tune them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(15_000),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Agent WebSocket endpoint (scheme optional).
    pub agent_url: String,
    /// History REST base URL (scheme optional).
    pub history_url: String,
    /// User identity the connection is keyed by.
    pub user_id: String,
    pub mode: SessionMode,
    /// Resume an existing session when known.
    pub session_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Cadence of the derived "assistant is typing" signal.
    pub typing_interval: Duration,
    /// Page size for history fetches.
    pub history_page_size: u32,
    /// Keepalive ping cadence on the socket.
    pub ping_interval: Duration,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// localhost defaults.
    pub fn from_env() -> Self {
        let agent_url = env::var("AISLE_AGENT_URL")
            .unwrap_or_else(|_| "127.0.0.1:8000/ws".to_string());
        let history_url =
            env::var("AISLE_HISTORY_URL").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
        let user_id = env::var("AISLE_USER_ID").unwrap_or_else(|_| "guest".to_string());
        let mode = match env::var("AISLE_MODE").ok().as_deref() {
            Some("test") => SessionMode::Test,
            _ => SessionMode::Live,
        };
        let session_id = env::var("AISLE_SESSION_ID").ok().filter(|s| !s.is_empty());

        Self {
            agent_url,
            history_url,
            user_id,
            mode,
            session_id,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_url: "127.0.0.1:8000/ws".to_string(),
            history_url: "127.0.0.1:8000".to_string(),
            user_id: "guest".to_string(),
            mode: SessionMode::Live,
            session_id: None,
            reconnect: ReconnectPolicy::default(),
            typing_interval: Duration::from_millis(800),
            history_page_size: 20,
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(8000));
        assert_eq!(policy.delay(5), Duration::from_millis(15_000));
        assert_eq!(policy.delay(8), Duration::from_millis(15_000));
    }

    #[test]
    fn default_config_targets_localhost() {
        let config = EngineConfig::default();
        assert_eq!(config.agent_url, "127.0.0.1:8000/ws");
        assert_eq!(config.history_page_size, 20);
        assert_eq!(config.typing_interval, Duration::from_millis(800));
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original = env::var("AISLE_AGENT_URL").ok();
        unsafe {
            env::set_var("AISLE_AGENT_URL", "wss://agent.example.com/ws");
            env::set_var("AISLE_MODE", "test");
        }
        let config = EngineConfig::from_env();
        assert_eq!(config.agent_url, "wss://agent.example.com/ws");
        assert_eq!(config.mode, SessionMode::Test);

        unsafe {
            if let Some(orig) = original {
                env::set_var("AISLE_AGENT_URL", orig);
            } else {
                env::remove_var("AISLE_AGENT_URL");
            }
            env::remove_var("AISLE_MODE");
        }
    }
}
