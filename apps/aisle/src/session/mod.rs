use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::ReconnectPolicy;
use crate::transport::{SocketClient, SocketConfig, SocketEvent};

/// Lifecycle of the agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

type Hook = Box<dyn Fn() + Send + Sync>;

struct Inner {
    socket_config: SocketConfig,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    session_id_tx: watch::Sender<Option<String>>,
    events_out: mpsc::UnboundedSender<SocketEvent>,
    client: Mutex<Option<SocketClient>>,
    attempt: AtomicU32,
    manual_reconnect: AtomicBool,
    connecting: AtomicBool,
    closed: AtomicBool,
    on_disconnect: Mutex<Vec<Hook>>,
    on_reconnect_success: Mutex<Vec<Hook>>,
}

/// Owns the lifecycle of the one live [`SocketClient`].
///
/// Connection policy lives here: bounded exponential backoff on drops,
/// manual reconnect, and the terminal `Failed` state. Dependents subscribe
/// through registration hooks instead of being reached into.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// `events_out` receives every socket event in delivery order, across
    /// reconnects, for the transcript layer to fold.
    pub fn new(
        socket_config: SocketConfig,
        policy: ReconnectPolicy,
        events_out: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (session_id_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                socket_config,
                policy,
                state_tx,
                session_id_tx,
                events_out,
                client: Mutex::new(None),
                attempt: AtomicU32::new(0),
                manual_reconnect: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                on_disconnect: Mutex::new(Vec::new()),
                on_reconnect_success: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn session_id(&self) -> watch::Receiver<Option<String>> {
        self.inner.session_id_tx.subscribe()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.inner.session_id_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    /// Number of connection attempts made since the counter was last reset.
    pub fn attempts(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    pub fn register_on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.on_disconnect.lock().push(Box::new(hook));
    }

    pub fn register_on_reconnect_success(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.on_reconnect_success.lock().push(Box::new(hook));
    }

    /// Initiate a connection attempt. A no-op while an instance is already
    /// open or an attempt is in flight.
    pub async fn connect(&self) {
        let already_open = self
            .inner
            .client
            .lock()
            .as_ref()
            .map(|client| client.is_connected())
            .unwrap_or(false);
        if already_open {
            return;
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner
            .state_tx
            .send_replace(ConnectionState::Connecting);
        attempt_connect(&self.inner).await;
    }

    /// Reset the attempt counter and force an immediate new attempt,
    /// regardless of the current state. Clears `Failed`.
    pub fn reconnect_now(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.inner.manual_reconnect.store(true, Ordering::SeqCst);
        self.inner
            .state_tx
            .send_replace(ConnectionState::Connecting);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            attempt_connect(&inner).await;
        });
    }

    /// Sends are silent no-ops while disconnected; callers are expected to
    /// check `is_connected` first.
    pub fn send_text(&self, text: &str) {
        if let Some(client) = &*self.inner.client.lock() {
            if client.send_text(text).is_err() {
                tracing::debug!(target: "aisle::session", "dropping text send while disconnected");
            }
        }
    }

    pub fn send_audio_chunk(&self, data: String, mime: Option<String>) {
        if let Some(client) = &*self.inner.client.lock() {
            if client.send_audio_chunk(data, mime).is_err() {
                tracing::debug!(target: "aisle::session", "dropping audio chunk while disconnected");
            }
        }
    }

    pub fn send_video_frame(
        &self,
        data: String,
        mode: crate::protocol::VideoMode,
        mime: String,
    ) {
        if let Some(client) = &*self.inner.client.lock() {
            if client.send_video_frame(data, mode, mime).is_err() {
                tracing::debug!(target: "aisle::session", "dropping video frame while disconnected");
            }
        }
    }

    pub fn interrupt(&self) {
        if let Some(client) = &*self.inner.client.lock() {
            if client.interrupt().is_err() {
                tracing::debug!(target: "aisle::session", "dropping interrupt while disconnected");
            }
        }
    }

    /// Tear down the connection and stop reconnecting.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.client.lock().take();
        self.inner.state_tx.send_replace(ConnectionState::Idle);
    }
}

async fn attempt_connect(inner: &Arc<Inner>) {
    if inner.connecting.swap(true, Ordering::SeqCst) {
        return;
    }
    try_connect(inner).await;
    inner.connecting.store(false, Ordering::SeqCst);
}

async fn try_connect(inner: &Arc<Inner>) {
    // Discard the previous instance before dialing a replacement; two live
    // clients must never coexist.
    inner.client.lock().take();

    let mut config = inner.socket_config.clone();
    if let Some(session_id) = inner.session_id_tx.borrow().clone() {
        config = config.with_session_id(session_id);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    match SocketClient::connect(config, events_tx).await {
        Ok(client) => {
            *inner.client.lock() = Some(client);
            tokio::spawn(monitor(inner.clone(), events_rx));
        }
        Err(err) => {
            tracing::warn!(target: "aisle::session", error = %err, "connection attempt failed");
            inner.manual_reconnect.store(false, Ordering::SeqCst);
            on_attempt_failed(inner);
        }
    }
}

async fn monitor(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            SocketEvent::Ready => {
                tracing::debug!(target: "aisle::session", "agent ready");
                inner.attempt.store(0, Ordering::SeqCst);
                inner.manual_reconnect.store(false, Ordering::SeqCst);
                inner.state_tx.send_replace(ConnectionState::Connected);
                for hook in inner.on_reconnect_success.lock().iter() {
                    hook();
                }
            }
            SocketEvent::SessionId(session_id) => {
                tracing::debug!(target: "aisle::session", session_id, "session assigned");
                inner.session_id_tx.send_replace(Some(session_id.clone()));
            }
            SocketEvent::Error(message) => {
                tracing::warn!(target: "aisle::session", message, "agent error");
            }
            SocketEvent::Closed => {
                let _ = inner.events_out.send(event);
                handle_disconnect(&inner);
                return;
            }
            _ => {}
        }
        let _ = inner.events_out.send(event);
    }
}

fn handle_disconnect(inner: &Arc<Inner>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    // A pending manual reconnect drives its own attempt.
    if inner.manual_reconnect.load(Ordering::SeqCst) {
        return;
    }
    if *inner.state_tx.borrow() == ConnectionState::Failed {
        return;
    }
    on_attempt_failed(inner);
}

fn on_attempt_failed(inner: &Arc<Inner>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    let failures = inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
    if failures >= inner.policy.max_attempts {
        tracing::warn!(
            target: "aisle::session",
            attempts = failures,
            "retry budget exhausted, giving up"
        );
        inner.state_tx.send_replace(ConnectionState::Failed);
        for hook in inner.on_disconnect.lock().iter() {
            hook();
        }
        return;
    }

    let delay = inner.policy.delay(failures);
    tracing::debug!(
        target: "aisle::session",
        attempt = failures,
        delay_ms = delay.as_millis() as u64,
        "scheduling reconnect"
    );
    inner.state_tx.send_replace(ConnectionState::Reconnecting);
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if inner.manual_reconnect.load(Ordering::SeqCst) || inner.closed.load(Ordering::SeqCst) {
            return;
        }
        attempt_connect(&inner).await;
    });
}
