use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientMessage, ControlAction, ServerMessage, VideoMode};

pub mod config;
pub use config::SocketConfig;

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("invalid agent url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("socket is not connected")]
    NotConnected,
}

/// Whether a server text event echoes the user's own input or carries an
/// assistant delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    UserInput,
    Assistant,
}

/// Events surfaced to the single consumer of the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Ready,
    SessionId(String),
    Text {
        data: String,
        kind: TextKind,
        event_id: Option<String>,
    },
    Audio,
    TurnComplete,
    Interrupted,
    Error(String),
    Closed,
}

/// One live connection to the agent endpoint.
///
/// The client never reconnects on its own; it reports `Error`/`Closed` and
/// leaves lifecycle policy to its owner.
pub struct SocketClient {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
    ws_task: Option<tokio::task::JoinHandle<()>>,
}

impl SocketClient {
    /// Dial the agent endpoint and start the reader/writer tasks. Server
    /// events are delivered in arrival order on `events`.
    pub async fn connect(
        config: SocketConfig,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<Self, ConnectionError> {
        let url = config.build_url()?;
        tracing::debug!(target: "aisle::transport", %url, "dialing agent endpoint");

        let (ws_stream, _) = connect_async(url.as_str()).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let connected = Arc::new(AtomicBool::new(true));

        let ws_task = tokio::spawn(run_socket(
            ws_stream,
            out_rx,
            events,
            connected.clone(),
            config.ping_interval,
        ));

        Ok(Self {
            out_tx,
            connected,
            ws_task: Some(ws_task),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(ClientMessage::Text { data: text.into() })
    }

    pub fn send_audio_chunk(
        &self,
        data: impl Into<String>,
        mime: Option<String>,
    ) -> Result<(), ConnectionError> {
        self.send(ClientMessage::Audio {
            data: data.into(),
            mime,
        })
    }

    pub fn send_video_frame(
        &self,
        data: impl Into<String>,
        mode: VideoMode,
        mime: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.send(ClientMessage::Video {
            data: data.into(),
            mode,
            mime: mime.into(),
        })
    }

    /// Ask the server to stop the current assistant turn. Best-effort; a
    /// trailing event or two may still arrive.
    pub fn interrupt(&self) -> Result<(), ConnectionError> {
        self.send(ClientMessage::Control {
            action: ControlAction::Interrupt,
        })
    }

    fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.out_tx
            .send(message)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Close the connection and stop the socket task.
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.ws_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.ws_task.take() {
            task.abort();
        }
    }
}

async fn run_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<SocketEvent>,
    connected: Arc<AtomicBool>,
    ping_interval: std::time::Duration,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        // First tick fires immediately; skip it.
        ping.tick().await;
        loop {
            let message = tokio::select! {
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => message,
                    None => break,
                },
                _ = ping.tick() => ClientMessage::Ping,
            };
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    tracing::warn!(target: "aisle::transport", error = %err, "dropping unencodable outbound message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    if forward_server_message(&events, message).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "aisle::transport", error = %err, "ignoring unparseable server frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Err(err) => {
                let _ = events.send(SocketEvent::Error(err.to_string()));
                break;
            }
            _ => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
    let _ = events.send(SocketEvent::Closed);

    send_task.abort();
    let _ = send_task.await;
}

fn forward_server_message(
    events: &mpsc::UnboundedSender<SocketEvent>,
    message: ServerMessage,
) -> Result<(), mpsc::error::SendError<SocketEvent>> {
    let event = match message {
        ServerMessage::SessionId { data } => SocketEvent::SessionId(data),
        ServerMessage::AgentReady => SocketEvent::Ready,
        ServerMessage::UserInput { data, event_id } => SocketEvent::Text {
            data,
            kind: TextKind::UserInput,
            event_id,
        },
        ServerMessage::Text { data, event_id } => SocketEvent::Text {
            data,
            kind: TextKind::Assistant,
            event_id,
        },
        ServerMessage::Audio { .. } => SocketEvent::Audio,
        ServerMessage::TurnComplete => SocketEvent::TurnComplete,
        ServerMessage::Interrupted => SocketEvent::Interrupted,
        ServerMessage::Error { data } => SocketEvent::Error(data),
    };
    events.send(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_event(message: ServerMessage) -> SocketEvent {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_server_message(&tx, message).unwrap();
        rx.try_recv().unwrap()
    }

    #[test]
    fn maps_ready_and_session_id() {
        assert_eq!(collect_event(ServerMessage::AgentReady), SocketEvent::Ready);
        assert_eq!(
            collect_event(ServerMessage::SessionId {
                data: "sess-1".into()
            }),
            SocketEvent::SessionId("sess-1".into())
        );
    }

    #[test]
    fn distinguishes_echo_from_assistant_delta() {
        let echo = collect_event(ServerMessage::UserInput {
            data: "hi".into(),
            event_id: None,
        });
        assert_eq!(
            echo,
            SocketEvent::Text {
                data: "hi".into(),
                kind: TextKind::UserInput,
                event_id: None,
            }
        );
        let delta = collect_event(ServerMessage::Text {
            data: "Hel".into(),
            event_id: Some("ev-9".into()),
        });
        assert_eq!(
            delta,
            SocketEvent::Text {
                data: "Hel".into(),
                kind: TextKind::Assistant,
                event_id: Some("ev-9".into()),
            }
        );
    }
}
