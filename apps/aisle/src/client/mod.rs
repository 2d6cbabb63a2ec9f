//! Top-level assistant client tying the session, history, transcript, and
//! media subsystems together.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::history::{HistoryClient, HistoryConfig, HistoryError};
use crate::media::{
    FrameSink, MediaAcquisitionError, MediaController, MediaSettings, MediaSourceFactory,
    MediaTrack, SyntheticMediaFactory,
};
use crate::protocol::VideoMode;
use crate::session::{ConnectionState, SessionManager};
use crate::transcript::{EngineInput, TranscriptEngine, TranscriptSnapshot};
use crate::transport::config::SocketConfig;

struct ClientInner {
    config: EngineConfig,
    session: SessionManager,
    history: HistoryClient,
    transcript: Arc<TranscriptEngine>,
    media: MediaController,
    history_offset: AtomicU32,
    router: JoinHandle<()>,
    history_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.router.abort();
        if let Some(task) = self.history_task.lock().take() {
            task.abort();
        }
    }
}

/// Always-on assistant engine: one socket session, optimistic transcript,
/// paged history, and capture adapters behind a single surface.
#[derive(Clone)]
pub struct AssistantClient {
    inner: Arc<ClientInner>,
}

impl AssistantClient {
    pub fn new(config: EngineConfig) -> Result<Self, HistoryError> {
        let history = HistoryClient::new(HistoryConfig::new(&config.history_url)?)?;
        Ok(Self::with_parts(
            config,
            history,
            Arc::new(SyntheticMediaFactory),
        ))
    }

    /// Assemble from pre-built parts; used to swap in alternate history
    /// backends and capture factories.
    pub fn with_parts(
        config: EngineConfig,
        history: HistoryClient,
        media_factory: Arc<dyn MediaSourceFactory>,
    ) -> Self {
        let mut socket_config = SocketConfig::new(&config.agent_url, &config.user_id)
            .with_mode(config.mode)
            .with_ping_interval(config.ping_interval);
        if let Some(session_id) = &config.session_id {
            socket_config = socket_config.with_session_id(session_id);
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = SessionManager::new(socket_config, config.reconnect, events_tx);
        let transcript = Arc::new(TranscriptEngine::spawn(config.typing_interval));

        let router_transcript = Arc::clone(&transcript);
        let router = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                router_transcript.submit(EngineInput::Socket(event));
            }
        });

        let sink_session = session.clone();
        let sink: FrameSink = Arc::new(move |frame| match frame.track {
            MediaTrack::Microphone => {
                sink_session.send_audio_chunk(frame.data, Some(frame.mime));
            }
            MediaTrack::Camera => {
                sink_session.send_video_frame(frame.data, VideoMode::Camera, frame.mime);
            }
            MediaTrack::Screen => {
                sink_session.send_video_frame(frame.data, VideoMode::Screen, frame.mime);
            }
        });
        let media = MediaController::new(media_factory, MediaSettings::default(), sink);

        let session_rx = session.session_id();
        let inner = Arc::new(ClientInner {
            config,
            session,
            history,
            transcript,
            media,
            history_offset: AtomicU32::new(0),
            router,
            history_task: Mutex::new(None),
        });

        let loader = tokio::spawn(run_history_loader(Arc::downgrade(&inner), session_rx));
        *inner.history_task.lock() = Some(loader);
        Self { inner }
    }

    /// Dial the agent and keep the session alive.
    pub async fn connect(&self) {
        self.inner.session.connect().await;
    }

    /// Clear backoff state and retry immediately.
    pub fn reconnect_now(&self) {
        self.inner.session.reconnect_now();
    }

    /// Tear everything down; no further reconnects are attempted.
    pub async fn close(&self) {
        self.inner.media.stop_all().await;
        self.inner.session.close();
    }

    /// Send a chat message. Silently dropped while disconnected. If the
    /// assistant is mid-reply the turn is interrupted first.
    pub fn send_text_message(&self, text: &str) {
        if !self.inner.session.is_connected() {
            tracing::debug!(target: "aisle::client", "dropping text message while disconnected");
            return;
        }
        if self.inner.transcript.snapshot().is_assistant_speaking {
            self.interrupt_assistant();
        }
        self.inner.session.send_text(text);
        self.inner
            .transcript
            .submit(EngineInput::LocalUserText(text.to_string()));
    }

    /// Cut the assistant off mid-reply.
    pub fn interrupt_assistant(&self) {
        self.inner.transcript.submit(EngineInput::LocalInterrupt);
        self.inner.session.interrupt();
    }

    pub async fn start_recording(&self) -> Result<(), MediaAcquisitionError> {
        self.inner.media.start_microphone().await?;
        self.inner.transcript.submit(EngineInput::RecordingStarted);
        Ok(())
    }

    pub async fn stop_recording(&self) {
        self.inner.media.stop_microphone().await;
        self.inner.transcript.submit(EngineInput::RecordingStopped);
    }

    pub async fn initialize_webcam(&self) -> Result<(), MediaAcquisitionError> {
        self.inner.media.start_video(VideoMode::Camera).await
    }

    pub async fn initialize_screen_share(&self) -> Result<(), MediaAcquisitionError> {
        self.inner.media.start_video(VideoMode::Screen).await
    }

    pub async fn stop_video(&self) {
        self.inner.media.stop_video().await;
    }

    /// Fetch the next older history page and prepend it to the transcript.
    /// No-op while a fetch is in flight or when no session is known.
    pub async fn load_more_history(&self) {
        let Some(session_id) = self.inner.session.current_session_id() else {
            return;
        };
        let snapshot = self.inner.transcript.snapshot();
        if snapshot.is_loading_history || !snapshot.has_more_history {
            return;
        }
        let offset = self.inner.history_offset.load(Ordering::SeqCst);
        self.fetch_page(&session_id, offset).await;
    }

    async fn fetch_page(&self, session_id: &str, offset: u32) {
        let limit = self.inner.config.history_page_size;
        self.inner.transcript.submit(EngineInput::HistoryLoading);
        match self.inner.history.get_history(session_id, limit, offset).await {
            Ok(page) => {
                let fetched = page.events.len() as u32;
                self.inner
                    .history_offset
                    .store(offset + fetched, Ordering::SeqCst);
                self.inner.transcript.submit(EngineInput::HistoryPage {
                    events: page.events,
                    has_more: page.has_more,
                });
            }
            Err(err) => {
                tracing::warn!(target: "aisle::client", error = %err, "history fetch failed");
                self.inner
                    .transcript
                    .submit(EngineInput::HistoryFailed(err.to_string()));
            }
        }
    }

    pub fn transcript(&self) -> TranscriptSnapshot {
        self.inner.transcript.snapshot()
    }

    /// Wait until every input submitted so far has been folded.
    pub async fn flush_transcript(&self) {
        self.inner.transcript.flush().await;
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.session.connection_state()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.session.current_state()
    }

    pub fn session_id(&self) -> watch::Receiver<Option<String>> {
        self.inner.session.session_id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.media.is_recording().await
    }

    pub async fn active_video(&self) -> Option<VideoMode> {
        self.inner.media.active_video().await
    }

    pub fn register_on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.session.register_on_disconnect(hook);
    }

    pub fn register_on_reconnect_success(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.session.register_on_reconnect_success(hook);
    }
}

/// Watches the session id and loads the first history page whenever a new
/// session is announced. Holds only a weak handle so the client can drop
/// while this task is parked on the watch channel.
async fn run_history_loader(
    inner: Weak<ClientInner>,
    mut session_rx: watch::Receiver<Option<String>>,
) {
    let mut last_loaded: Option<String> = None;
    loop {
        let current = session_rx.borrow_and_update().clone();
        if let Some(session_id) = current {
            if last_loaded.as_deref() != Some(session_id.as_str()) {
                let Some(strong) = inner.upgrade() else {
                    break;
                };
                let client = AssistantClient { inner: strong };
                client.inner.history_offset.store(0, Ordering::SeqCst);
                client.fetch_page(&session_id, 0).await;
                last_loaded = Some(session_id);
            }
        }
        if session_rx.changed().await.is_err() {
            break;
        }
    }
}
