use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug)]
pub struct HistoryConfig {
    base_url: Url,
}

impl HistoryConfig {
    pub fn new(server_base_url: impl AsRef<str>) -> Result<Self, HistoryError> {
        // Allow a centralized override so callers and env stay consistent.
        let mut base = std::env::var("AISLE_HISTORY_BASE")
            .ok()
            .and_then(|s| {
                let trimmed = s.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
            .unwrap_or_else(|| server_base_url.as_ref().trim().to_string());
        if base.is_empty() {
            return Err(HistoryError::InvalidConfig(
                "history server base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        let parsed = Url::parse(&base).map_err(|err| {
            HistoryError::InvalidConfig(format!("invalid history server url: {err}"))
        })?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

fn infer_scheme(base: &str) -> &'static str {
    if base.starts_with("127.0.0.1") || base.starts_with("localhost") {
        "http://"
    } else {
        "https://"
    }
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("invalid history configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("session not found or no messages available")]
    SessionNotFound,
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Query parameters for one history page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub limit: u32,
    pub offset: u32,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub event_types_filter: Option<String>,
}

impl HistoryQuery {
    pub fn page(limit: u32, offset: u32) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventMetadata {
    pub timestamp: String,
    pub event_type: String,
    #[serde(default)]
    pub wedding_id: Option<String>,
}

/// One raw history event as returned by the server. The content shape is
/// dispatched by `metadata.event_type` via [`RawEvent::content`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    pub metadata: EventMetadata,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatMessageContent {
    pub message_id: String,
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ArtifactUploadContent {
    pub artifact_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SystemEventContent {
    pub event_name: String,
    #[serde(default)]
    pub details: Option<String>,
}

/// Typed view of a raw event's content.
#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Message(ChatMessageContent),
    ArtifactUpload(ArtifactUploadContent),
    SystemEvent(SystemEventContent),
}

impl RawEvent {
    pub fn content(&self) -> Result<EventContent, HistoryError> {
        let parsed = match self.metadata.event_type.as_str() {
            "message" => EventContent::Message(
                serde_json::from_value(self.content.clone())
                    .map_err(|err| HistoryError::InvalidResponse(err.to_string()))?,
            ),
            "artifact_upload" => EventContent::ArtifactUpload(
                serde_json::from_value(self.content.clone())
                    .map_err(|err| HistoryError::InvalidResponse(err.to_string()))?,
            ),
            "system_event" => EventContent::SystemEvent(
                serde_json::from_value(self.content.clone())
                    .map_err(|err| HistoryError::InvalidResponse(err.to_string()))?,
            ),
            other => {
                return Err(HistoryError::InvalidResponse(format!(
                    "unknown event type {other}"
                )));
            }
        };
        Ok(parsed)
    }
}

/// One server-returned batch of history events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub total_events: u64,
    #[serde(default)]
    pub has_more: bool,
}

#[async_trait]
pub(crate) trait HistoryBackend: Send + Sync {
    async fn fetch_history(
        &self,
        base_url: &Url,
        session_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, HistoryError>;
}

struct ReqwestHistoryBackend {
    client: reqwest::Client,
}

impl ReqwestHistoryBackend {
    fn new() -> Result<Self, HistoryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HistoryBackend for ReqwestHistoryBackend {
    async fn fetch_history(
        &self,
        base_url: &Url,
        session_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, HistoryError> {
        let mut endpoint = base_url
            .join(&format!("sessions/{session_id}/history"))
            .map_err(|err| {
                HistoryError::InvalidConfig(format!(
                    "invalid history endpoint for session {session_id}: {err}"
                ))
            })?;
        {
            let mut pairs = endpoint.query_pairs_mut();
            pairs.append_pair("limit", &query.limit.to_string());
            pairs.append_pair("offset", &query.offset.to_string());
            if let Some(start_date) = &query.start_date {
                pairs.append_pair("start_date", start_date);
            }
            if let Some(end_date) = &query.end_date {
                pairs.append_pair("end_date", end_date);
            }
            if let Some(filter) = &query.event_types_filter {
                pairs.append_pair("event_types_filter", filter);
            }
        }
        let response = self.client.get(endpoint).send().await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(HistoryError::SessionNotFound),
            status => return Err(HistoryError::HttpStatus(status)),
        }
        let payload = response.json::<HistoryPage>().await?;
        Ok(payload)
    }
}

/// Paginated REST client for past session events.
///
/// No retry policy lives here; a failed fetch surfaces to the caller, who
/// decides whether to ask again.
#[derive(Clone)]
pub struct HistoryClient {
    config: Arc<HistoryConfig>,
    backend: Arc<dyn HistoryBackend>,
}

impl HistoryClient {
    pub fn new(config: HistoryConfig) -> Result<Self, HistoryError> {
        let backend = Arc::new(ReqwestHistoryBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backend(config: HistoryConfig, backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Fetch one page of session history.
    pub async fn get_history(
        &self,
        session_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage, HistoryError> {
        self.get_history_with(session_id, &HistoryQuery::page(limit, offset))
            .await
    }

    pub async fn get_history_with(
        &self,
        session_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, HistoryError> {
        tracing::debug!(
            target: "aisle::history",
            session_id,
            limit = query.limit,
            offset = query.offset,
            "fetching history page"
        );
        let page = self
            .backend
            .fetch_history(self.config.base_url(), session_id, query)
            .await?;
        tracing::debug!(
            target: "aisle::history",
            session_id,
            events = page.events.len(),
            has_more = page.has_more,
            "history page received"
        );
        Ok(page)
    }
}

#[cfg(test)]
pub(crate) fn message_event(
    event_id: &str,
    sender: &str,
    text: &str,
    timestamp: &str,
) -> RawEvent {
    RawEvent {
        metadata: EventMetadata {
            timestamp: timestamp.to_string(),
            event_type: "message".to_string(),
            wedding_id: None,
        },
        content: serde_json::json!({
            "message_id": event_id,
            "sender": sender,
            "content": text,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MockHistoryBackend {
        pages: Mutex<HashMap<u32, HistoryPage>>,
        requests: Mutex<Vec<HistoryQuery>>,
    }

    impl MockHistoryBackend {
        fn new() -> Self {
            Self {
                pages: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn insert_page(&self, offset: u32, page: HistoryPage) {
            self.pages.lock().insert(offset, page);
        }

        fn requests(&self) -> Vec<HistoryQuery> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl HistoryBackend for MockHistoryBackend {
        async fn fetch_history(
            &self,
            _base_url: &Url,
            _session_id: &str,
            query: &HistoryQuery,
        ) -> Result<HistoryPage, HistoryError> {
            self.requests.lock().push(query.clone());
            self.pages
                .lock()
                .get(&query.offset)
                .cloned()
                .ok_or(HistoryError::SessionNotFound)
        }
    }

    fn config() -> HistoryConfig {
        HistoryConfig::new("http://127.0.0.1:8000").unwrap()
    }

    #[test]
    fn config_infers_scheme() {
        let config = HistoryConfig::new("127.0.0.1:9000").unwrap();
        assert_eq!(config.base_url().scheme(), "http");
        let config = HistoryConfig::new("planner.example.com").unwrap();
        assert_eq!(config.base_url().scheme(), "https");
    }

    #[test]
    fn dispatches_content_by_event_type() {
        let event = message_event("ev-1", "user", "hello", "2025-01-01T00:00:00Z");
        match event.content().unwrap() {
            EventContent::Message(content) => {
                assert_eq!(content.message_id, "ev-1");
                assert_eq!(content.content, "hello");
            }
            other => panic!("unexpected content: {other:?}"),
        }

        let artifact = RawEvent {
            metadata: EventMetadata {
                timestamp: "2025-01-01T00:00:00Z".into(),
                event_type: "artifact_upload".into(),
                wedding_id: Some("w-1".into()),
            },
            content: serde_json::json!({
                "artifact_id": "a-1",
                "filename": "venue.jpg",
                "file_url": "https://cdn.example.com/venue.jpg",
            }),
        };
        assert!(matches!(
            artifact.content().unwrap(),
            EventContent::ArtifactUpload(_)
        ));

        let unknown = RawEvent {
            metadata: EventMetadata {
                timestamp: "2025-01-01T00:00:00Z".into(),
                event_type: "mystery".into(),
                wedding_id: None,
            },
            content: Value::Null,
        };
        assert!(matches!(
            unknown.content(),
            Err(HistoryError::InvalidResponse(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn fetches_page_with_requested_window() {
        let backend = Arc::new(MockHistoryBackend::new());
        backend.insert_page(
            20,
            HistoryPage {
                events: vec![message_event("ev-9", "user", "hi", "2025-01-01T00:00:00Z")],
                total_events: 21,
                has_more: false,
            },
        );
        let client = HistoryClient::with_backend(config(), backend.clone());

        let page = client.get_history("sess-1", 20, 20).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert!(!page.has_more);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].limit, 20);
        assert_eq!(requests[0].offset, 20);
    }

    #[test_timeout::tokio_timeout_test]
    async fn surfaces_fetch_errors_without_retry() {
        let backend = Arc::new(MockHistoryBackend::new());
        let client = HistoryClient::with_backend(config(), backend.clone());

        let err = client.get_history("sess-1", 20, 0).await.unwrap_err();
        assert!(matches!(err, HistoryError::SessionNotFound));
        assert_eq!(backend.requests().len(), 1);
    }
}
