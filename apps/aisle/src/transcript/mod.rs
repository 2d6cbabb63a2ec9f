use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::history::{EventContent, RawEvent};
use crate::transport::{SocketEvent, TextKind};

/// Placeholder text shown for a voice utterance until its transcription
/// echoes back.
pub const RECORDING_PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    ArtifactUpload,
    SystemEvent,
}

/// A single unit of the reconciled transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub is_markdown: bool,
    pub timestamp: String,
    pub kind: MessageKind,
    pub artifact_url: Option<String>,
    pub artifact_type: Option<String>,
    pub system_event_type: Option<String>,
}

impl Message {
    fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            text: text.into(),
            is_markdown: sender == Sender::Assistant,
            timestamp: now_timestamp(),
            kind: MessageKind::Message,
            artifact_url: None,
            artifact_type: None,
            system_event_type: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Sender::Assistant, text)
    }

    /// Map a raw history event into a transcript message. Events whose
    /// content fails to parse are skipped with a warning.
    pub fn from_history(event: &RawEvent) -> Option<Self> {
        let content = match event.content() {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(target: "aisle::transcript", error = %err, "skipping unparseable history event");
                return None;
            }
        };
        let timestamp = event.metadata.timestamp.clone();
        let message = match content {
            EventContent::Message(message) => {
                let sender = match message.sender.as_str() {
                    "user" => Sender::User,
                    "assistant" | "agent" => Sender::Assistant,
                    _ => Sender::System,
                };
                Self {
                    id: message.message_id,
                    sender,
                    text: message.content,
                    is_markdown: sender == Sender::Assistant,
                    timestamp,
                    kind: MessageKind::Message,
                    artifact_url: None,
                    artifact_type: None,
                    system_event_type: None,
                }
            }
            EventContent::ArtifactUpload(artifact) => Self {
                id: artifact.artifact_id,
                sender: Sender::User,
                text: artifact.filename.unwrap_or_default(),
                is_markdown: false,
                timestamp,
                kind: MessageKind::ArtifactUpload,
                artifact_url: artifact.file_url,
                artifact_type: None,
                system_event_type: None,
            },
            EventContent::SystemEvent(system) => Self {
                id: Uuid::new_v4().to_string(),
                sender: Sender::System,
                text: system.details.unwrap_or_default(),
                is_markdown: false,
                timestamp,
                kind: MessageKind::SystemEvent,
                artifact_url: None,
                artifact_type: None,
                system_event_type: Some(system.event_name),
            },
        };
        Some(message)
    }
}

fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (
        OffsetDateTime::parse(a, &Rfc3339),
        OffsetDateTime::parse(b, &Rfc3339),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Inputs folded into the transcript, drained one at a time by a single
/// consumer so event processing never overlaps.
#[derive(Debug)]
pub enum EngineInput {
    Socket(SocketEvent),
    /// A fetched history page, in server order (newest-relevant-first).
    HistoryPage {
        events: Vec<RawEvent>,
        has_more: bool,
    },
    HistoryLoading,
    HistoryFailed(String),
    /// Optimistic local send.
    LocalUserText(String),
    RecordingStarted,
    RecordingStopped,
    /// User-initiated barge-in; the socket signal is sent separately.
    LocalInterrupt,
}

enum Command {
    Input(EngineInput),
    TypingTick,
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct LastSent {
    text: String,
    message_id: String,
}

#[derive(Default)]
struct TranscriptState {
    historical: Vec<Message>,
    realtime: Vec<Message>,
    open_assistant: Option<String>,
    last_sent: Option<LastSent>,
    is_assistant_speaking: bool,
    is_assistant_typing: bool,
    has_more_history: bool,
    is_loading_history: bool,
    history_error: Option<String>,
}

impl TranscriptState {
    fn contains_id(&self, id: &str) -> bool {
        self.historical.iter().any(|m| m.id == id) || self.realtime.iter().any(|m| m.id == id)
    }

    fn close_open_assistant(&mut self) {
        self.open_assistant = None;
        self.is_assistant_speaking = false;
        self.is_assistant_typing = false;
    }

    fn fold(&mut self, input: EngineInput) {
        match input {
            EngineInput::Socket(event) => self.fold_socket(event),
            EngineInput::HistoryPage { events, has_more } => {
                let mut page: Vec<Message> =
                    events.iter().filter_map(Message::from_history).collect();
                // Server order is newest-first within the window; flip it so
                // the historical list stays chronologically ascending, with
                // older pages in front.
                page.reverse();
                page.append(&mut self.historical);
                self.historical = page;
                self.has_more_history = has_more;
                self.is_loading_history = false;
                self.history_error = None;
            }
            EngineInput::HistoryLoading => {
                self.is_loading_history = true;
                self.history_error = None;
            }
            EngineInput::HistoryFailed(message) => {
                self.is_loading_history = false;
                self.history_error = Some(message);
            }
            EngineInput::LocalUserText(text) => {
                self.close_open_assistant();
                let message = Message::user(text.clone());
                self.last_sent = Some(LastSent {
                    text,
                    message_id: message.id.clone(),
                });
                self.realtime.push(message);
            }
            EngineInput::RecordingStarted => {
                self.realtime.push(Message::user(RECORDING_PLACEHOLDER));
            }
            EngineInput::RecordingStopped => {
                // Drop the placeholder if no transcription replaced it.
                if let Some(last) = self.realtime.last() {
                    if last.sender == Sender::User && last.text == RECORDING_PLACEHOLDER {
                        self.realtime.pop();
                    }
                }
            }
            EngineInput::LocalInterrupt => self.close_open_assistant(),
        }
    }

    fn fold_socket(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Text {
                data,
                kind,
                event_id,
            } => match kind {
                TextKind::UserInput => self.fold_user_input(data, event_id),
                TextKind::Assistant => self.fold_assistant_delta(data, event_id),
            },
            SocketEvent::Audio => {
                self.is_assistant_speaking = true;
            }
            SocketEvent::TurnComplete | SocketEvent::Interrupted => {
                self.close_open_assistant();
            }
            SocketEvent::Ready
            | SocketEvent::SessionId(_)
            | SocketEvent::Error(_)
            | SocketEvent::Closed => {}
        }
    }

    fn fold_user_input(&mut self, data: String, event_id: Option<String>) {
        if let Some(id) = &event_id {
            if self.contains_id(id) {
                return;
            }
        }

        // A user message event always ends the assistant's open turn.
        self.close_open_assistant();

        // Echo of an optimistic local send: adopt the server id instead of
        // appending a duplicate.
        if let Some(last_sent) = self.last_sent.take() {
            if is_echo_of(&last_sent.text, &data) {
                if let Some(event_id) = event_id {
                    if let Some(message) =
                        self.realtime.iter_mut().find(|m| m.id == last_sent.message_id)
                    {
                        message.id = event_id;
                    }
                }
                return;
            }
            self.last_sent = Some(last_sent);
        }

        // Transcription arriving for a pending voice placeholder overwrites
        // it in place.
        if let Some(last) = self.realtime.last_mut() {
            if last.sender == Sender::User && last.text == RECORDING_PLACEHOLDER {
                last.text = data;
                if let Some(event_id) = event_id {
                    last.id = event_id;
                }
                return;
            }
        }

        let mut message = Message::user(data);
        if let Some(event_id) = event_id {
            message.id = event_id;
        }
        self.realtime.push(message);
    }

    fn fold_assistant_delta(&mut self, data: String, event_id: Option<String>) {
        if let Some(id) = &event_id {
            if self.open_assistant.as_deref() != Some(id.as_str()) && self.contains_id(id) {
                return;
            }
        }

        match self.open_assistant.clone() {
            Some(open_id) => {
                if let Some(message) = self.realtime.iter_mut().find(|m| m.id == open_id) {
                    message.text.push_str(&data);
                    if let Some(event_id) = event_id {
                        message.id = event_id.clone();
                        self.open_assistant = Some(event_id);
                    }
                }
            }
            None => {
                let mut message = Message::assistant(data);
                if let Some(event_id) = event_id {
                    message.id = event_id;
                }
                self.open_assistant = Some(message.id.clone());
                self.realtime.push(message);
            }
        }
        self.is_assistant_speaking = true;
    }

    /// Union of historical and realtime messages, deduplicated by id with
    /// later entries winning, sorted ascending by timestamp.
    fn merged(&self) -> Vec<Message> {
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, Message> = HashMap::new();
        for message in self.historical.iter().chain(self.realtime.iter()) {
            if !by_id.contains_key(&message.id) {
                order.push(message.id.clone());
            }
            by_id.insert(message.id.clone(), message.clone());
        }
        let mut merged: Vec<Message> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        merged.sort_by(|a, b| compare_timestamps(&a.timestamp, &b.timestamp));
        merged
    }
}

/// Echo recognition for optimistic sends. Exact equality today; the agent
/// service echoes the raw client string. Centralized here so a normalized
/// comparison (or a client-generated id round-trip) can replace it without
/// touching the fold.
fn is_echo_of(sent: &str, echoed: &str) -> bool {
    sent == echoed
}

/// Read-only view of the reconciled transcript.
#[derive(Debug, Clone)]
pub struct TranscriptSnapshot {
    pub messages: Vec<Message>,
    pub is_assistant_speaking: bool,
    pub is_assistant_typing: bool,
    pub has_more_history: bool,
    pub is_loading_history: bool,
    pub history_error: Option<String>,
}

/// Merges optimistic local sends, live socket events, and historical pages
/// into one transcript. All inputs go through one queue with a single
/// consumer, so folds never overlap and ordering is explicit.
pub struct TranscriptEngine {
    state: Arc<RwLock<TranscriptState>>,
    tx: mpsc::UnboundedSender<Command>,
    consumer: Option<tokio::task::JoinHandle<()>>,
    typing_task: Option<tokio::task::JoinHandle<()>>,
}

impl TranscriptEngine {
    pub fn spawn(typing_interval: Duration) -> Self {
        let state = Arc::new(RwLock::new(TranscriptState::default()));
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        let fold_state = state.clone();
        let consumer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Input(input) => fold_state.write().fold(input),
                    Command::TypingTick => {
                        let mut state = fold_state.write();
                        state.is_assistant_typing = state.open_assistant.is_some();
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        let typing_tx = tx.clone();
        let typing_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(typing_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if typing_tx.send(Command::TypingTick).is_err() {
                    break;
                }
            }
        });

        Self {
            state,
            tx,
            consumer: Some(consumer),
            typing_task: Some(typing_task),
        }
    }

    pub fn submit(&self, input: EngineInput) {
        let _ = self.tx.send(Command::Input(input));
    }

    /// Wait until every previously submitted input has been folded.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        let state = self.state.read();
        TranscriptSnapshot {
            messages: state.merged(),
            is_assistant_speaking: state.is_assistant_speaking,
            is_assistant_typing: state.is_assistant_typing,
            has_more_history: state.has_more_history,
            is_loading_history: state.is_loading_history,
            history_error: state.history_error.clone(),
        }
    }
}

impl Drop for TranscriptEngine {
    fn drop(&mut self) {
        if let Some(task) = self.typing_task.take() {
            task.abort();
        }
        if let Some(task) = self.consumer.take() {
            task.abort();
        }
    }
}
