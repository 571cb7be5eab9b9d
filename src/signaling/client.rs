//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Automatische Reconnection (begrenzte Versuche, gedeckelter Backoff)
//! - Heartbeat per WebSocket-Ping
//! - Dokument-Räume (join/leave, Re-Join nach Reconnect)
//! - Benannte Message-Handler

use super::messages::*;
use crate::config::SignalingConfig;
use crate::error_handler::RawError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

type MessageHandler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    ConnectionFailed(String),

    #[error("websocket connect timed out")]
    Timeout,

    #[error("signaling channel not connected")]
    NotConnected,

    #[error("signaling send failed: {0}")]
    SendFailed(String),

    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
}

impl From<SignalingError> for RawError {
    fn from(e: SignalingError) -> Self {
        RawError::new("SignalingError", e.to_string())
    }
}

impl From<&SignalingError> for RawError {
    fn from(e: &SignalingError) -> Self {
        RawError::new("SignalingError", e.to_string())
    }
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

/// Lifecycle-Events des SignalingClient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected { reason: String },

    /// Neuer Verbindungsversuch
    Reconnecting { attempt: u32 },

    /// Alle Verbindungsversuche fehlgeschlagen
    ReconnectFailed,
}

/// Ausgehende Seite des Signaling-Kanals, wie der Controller sie sieht
pub trait SignalingSink: Send + Sync {
    /// Nicht-blockierend; schlägt ohne Verbindung fehl statt zu paniken
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    fn status(&self) -> ConnectionStatus;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    status: ConnectionStatus,
    room: Option<String>,
}

struct Shared {
    config: SignalingConfig,
    state: RwLock<ClientState>,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl Shared {
    /// Relay-URL inklusive Authentifizierung (userId, documentId)
    fn endpoint(&self) -> Result<Url, SignalingError> {
        let mut url = Url::parse(&self.config.server_url)
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(self.config.server_url.clone()))?;

        let room = self
            .state
            .read()
            .room
            .clone()
            .or_else(|| self.config.document_id.clone());

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("userId", &self.config.user_id);
            if let Some(room) = room {
                query.append_pair("documentId", &room);
            }
        }

        Ok(url)
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        let outbound = self.outbound.read();
        let tx = match outbound.as_ref() {
            Some(tx) if self.state.read().status == ConnectionStatus::Connected => tx,
            _ => {
                tracing::error!("Cannot send message: signaling channel not connected");
                return Err(SignalingError::NotConnected);
            }
        };

        let text =
            serde_json::to_string(frame).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(text))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet ein eingehendes Text-Frame
    fn dispatch_text(&self, text: &str) {
        let frame = match serde_json::from_str::<RelayFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Ignoring relay frame: {}", e);
                return;
            }
        };

        let message = frame.into_message();
        tracing::debug!(
            "Received {} for call {} from {}",
            message.kind.as_str(),
            message.call_id,
            message.from_user_id
        );

        // Handler ausserhalb des Locks aufrufen
        let handlers: Vec<MessageHandler> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(message.clone());
        }
    }

    /// Übernimmt eine frische Verbindung: Writer starten, Status setzen, Raum betreten
    fn activate(self: &Arc<Self>, ws: WsStream) -> WsReader {
        let (write, read) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(write_loop(write, rx, self.config.heartbeat_period()));

        *self.outbound.write() = Some(tx);
        let room = {
            let mut state = self.state.write();
            state.status = ConnectionStatus::Connected;
            state.room.clone().or_else(|| self.config.document_id.clone())
        };

        tracing::info!("Connected to signaling server");
        let _ = self.event_tx.send(SignalingEvent::Connected);

        if let Some(room) = room {
            if self.send_frame(&ClientFrame::JoinDocument(room.clone())).is_ok() {
                self.state.write().room = Some(room);
            }
        }

        read
    }

    fn mark_disconnected(&self, reason: String) {
        self.outbound.write().take();
        self.state.write().status = ConnectionStatus::Disconnected;
        tracing::info!("Disconnected from signaling server: {}", reason);
        let _ = self.event_tx.send(SignalingEvent::Disconnected { reason });
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
///
/// Lebt so lange wie die Collaboration-Session, nicht wie ein einzelner Anruf.
pub struct SignalingClient {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient (noch nicht verbunden)
    pub fn new(config: SignalingConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ClientState::default()),
                outbound: RwLock::new(None),
                handlers: RwLock::new(HashMap::new()),
                event_tx,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.read().status
    }

    /// Aktueller Dokument-Raum
    pub fn room(&self) -> Option<String> {
        self.shared.state.read().room.clone()
    }

    /// Verbindet mit dem Relay und betritt den konfigurierten Raum
    pub async fn connect(&self) -> Result<(), SignalingError> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let url = self.shared.endpoint()?;
        tracing::info!("Connecting to signaling server: {}", url);

        let ws = open(&url, self.shared.config.connect_timeout).await?;
        let reader = self.shared.activate(ws);

        let handle = tokio::spawn(supervise(Arc::clone(&self.shared), reader));
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Trennt die Verbindung ohne Reconnect
    pub fn disconnect(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }

        let outbound = self.shared.outbound.write().take();
        if let Some(tx) = outbound {
            let _ = tx.send(Message::Close(None));
        }

        let was_connected = {
            let mut state = self.shared.state.write();
            let was = state.status == ConnectionStatus::Connected;
            state.status = ConnectionStatus::Disconnected;
            was
        };

        if was_connected {
            tracing::info!("Disconnected from signaling server");
            let _ = self.shared.event_tx.send(SignalingEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Sendet eine Call-Nachricht; ohne Verbindung nur Log + Fehlerwert
    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!(
            "Sending {} for call {}",
            message.kind.as_str(),
            message.call_id
        );
        self.shared.send_frame(&ClientFrame::from_message(message))
    }

    /// Registriert einen Handler; gleiche ID ersetzt den vorherigen
    pub fn on_message<F>(&self, handler_id: impl Into<String>, handler: F) -> bool
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .insert(handler_id.into(), Arc::new(handler))
            .is_some()
    }

    /// Entfernt einen Handler
    pub fn off(&self, handler_id: &str) -> bool {
        self.shared.handlers.write().remove(handler_id).is_some()
    }

    /// Betritt einen Dokument-Raum
    pub fn join_room(&self, room_id: &str) -> Result<(), SignalingError> {
        tracing::info!("Joining document room: {}", room_id);
        self.shared
            .send_frame(&ClientFrame::JoinDocument(room_id.to_string()))?;
        self.shared.state.write().room = Some(room_id.to_string());
        Ok(())
    }

    /// Verlässt einen Dokument-Raum
    pub fn leave_room(&self, room_id: &str) -> Result<(), SignalingError> {
        tracing::info!("Leaving document room: {}", room_id);
        self.shared
            .send_frame(&ClientFrame::LeaveDocument(room_id.to_string()))?;
        let mut state = self.shared.state.write();
        if state.room.as_deref() == Some(room_id) {
            state.room = None;
        }
        Ok(())
    }
}

impl SignalingSink for SignalingClient {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        SignalingClient::send(self, message)
    }

    fn status(&self) -> ConnectionStatus {
        SignalingClient::status(self)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.shared.config.server_url)
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

// ============================================================================
// CONNECTION TASKS
// ============================================================================

async fn open(url: &Url, timeout: Duration) -> Result<WsStream, SignalingError> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(SignalingError::ConnectionFailed(e.to_string())),
        Err(_) => Err(SignalingError::Timeout),
    }
}

/// Hält die Verbindung am Leben und verbindet nach Abbruch neu
async fn supervise(shared: Arc<Shared>, mut reader: WsReader) {
    loop {
        let reason = read_loop(&shared, &mut reader).await;
        shared.mark_disconnected(reason);

        match reconnect(&shared).await {
            Some(ws) => reader = shared.activate(ws),
            None => {
                tracing::error!("Giving up on signaling server after reconnect attempts");
                let _ = shared.event_tx.send(SignalingEvent::ReconnectFailed);
                return;
            }
        }
    }
}

async fn read_loop(shared: &Shared, reader: &mut WsReader) -> String {
    while let Some(msg_result) = reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => shared.dispatch_text(&text),
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                return "closed by server".to_string();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                return e.to_string();
            }
        }
    }
    "stream ended".to_string()
}

async fn reconnect(shared: &Shared) -> Option<WsStream> {
    let policy = &shared.config.reconnect;

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        tracing::info!(
            "Reconnecting to signaling server (attempt {}/{}) in {}ms",
            attempt,
            policy.max_attempts,
            delay.as_millis()
        );
        let _ = shared
            .event_tx
            .send(SignalingEvent::Reconnecting { attempt });
        tokio::time::sleep(delay).await;

        let url = match shared.endpoint() {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Cannot reconnect: {}", e);
                return None;
            }
        };

        match open(&url, shared.config.connect_timeout).await {
            Ok(ws) => return Some(ws),
            Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }

    None
}

async fn write_loop(
    mut write: WsWriter,
    mut rx: mpsc::UnboundedReceiver<Message>,
    heartbeat: Duration,
) {
    let mut interval = tokio::time::interval(heartbeat);
    interval.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = write.send(msg).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            _ = interval.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
