//! Collaboration Session - verbindet Signaling-Kanal und Call Controller
//!
//! Ersetzt globalen Zustand: jede Anwendungssitzung besitzt genau ein
//! `CollaborationSession` mit explizitem `start` und `shutdown`.

use crate::call_engine::{CallController, MediaDevices, PeerConnector, WebRtcConnector};
use crate::config::CallConfig;
use crate::signaling::{SignalingClient, SignalingEvent, SignalingSink};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const CONTROLLER_HANDLER: &str = "call-controller";

pub struct CollaborationSession {
    signaling: Arc<SignalingClient>,
    controller: CallController,
    room: Option<String>,
    forwarder: JoinHandle<()>,
}

impl CollaborationSession {
    /// Verbindet mit dem Relay und registriert den Controller als Empfänger
    pub async fn start(
        config: CallConfig,
        media: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> anyhow::Result<Self> {
        tracing::info!("Starting collaboration session for {}", config.local_user_id());

        match config.ice.validate() {
            Ok(coverage) if !coverage.has_turn => {
                tracing::warn!("No TURN server configured, restrictive NATs may fail")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("ICE configuration problem: {}", e),
        }

        let signaling = Arc::new(SignalingClient::new(config.signaling.clone()));
        let controller = CallController::new(
            &config,
            Arc::clone(&signaling) as Arc<dyn SignalingSink>,
            media,
            connector,
        );
        signaling.on_message(CONTROLLER_HANDLER, controller.inbox());

        let forwarder = tokio::spawn(forward_interruptions(
            signaling.subscribe(),
            controller.clone(),
        ));

        if let Err(e) = signaling.connect().await {
            forwarder.abort();
            signaling.off(CONTROLLER_HANDLER);
            return Err(e).context("failed to connect to signaling relay");
        }

        Ok(Self {
            room: config.signaling.document_id.clone(),
            signaling,
            controller,
            forwarder,
        })
    }

    /// Wie [`start`](Self::start), mit dem webrtc-rs Backend aus `config.ice`
    pub async fn start_with_webrtc(
        config: CallConfig,
        media: Arc<dyn MediaDevices>,
    ) -> anyhow::Result<Self> {
        let connector =
            WebRtcConnector::new(&config.ice).context("failed to set up WebRTC API")?;
        Self::start(config, media, Arc::new(connector)).await
    }

    pub fn controller(&self) -> &CallController {
        &self.controller
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    /// Beendet den Anruf, verlässt den Raum und trennt die Verbindung
    pub async fn shutdown(self) {
        tracing::info!("Shutting down collaboration session");

        self.controller.end_call().await;
        self.forwarder.abort();
        self.signaling.off(CONTROLLER_HANDLER);

        if let Some(room) = self.signaling.room().or(self.room) {
            if let Err(e) = self.signaling.leave_room(&room) {
                tracing::debug!("Could not leave room {}: {}", room, e);
            }
        }
        self.signaling.disconnect();
    }
}

/// Leitet Verbindungsabbrüche des Kanals an den Controller weiter
async fn forward_interruptions(
    mut events: tokio::sync::broadcast::Receiver<SignalingEvent>,
    controller: CallController,
) {
    loop {
        match events.recv().await {
            Ok(SignalingEvent::Disconnected { reason }) => {
                controller.report_signaling_interruption(&reason)
            }
            Ok(SignalingEvent::ReconnectFailed) => {
                controller.report_signaling_interruption("reconnect attempts exhausted")
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Signaling event forwarder lagged by {} events", n)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{FakeConnector, FakeMediaDevices};
    use crate::call_engine::{CallEvent, CallPhase};
    use crate::signaling::ConnectionStatus;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    const WAIT: Duration = Duration::from_secs(5);

    async fn relay() -> (String, mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    let _ = tx.send(ws);
                }
            }
        });

        (format!("http://{}", addr), rx)
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        loop {
            let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn config(server_url: String) -> CallConfig {
        let mut config = CallConfig::default();
        config.signaling.server_url = server_url;
        config.signaling.user_id = "alice".to_string();
        config.signaling.document_id = Some("doc-1".to_string());
        config
    }

    #[tokio::test]
    async fn test_incoming_call_reaches_controller() {
        let (url, mut accepted) = relay().await;
        let session = CollaborationSession::start(
            config(url),
            Arc::new(FakeMediaDevices::default()),
            Arc::new(FakeConnector::default()),
        )
        .await
        .unwrap();
        let mut events = session.controller().subscribe();

        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(next_json(&mut server).await["event"], "join-document");

        server
            .send(Message::Text(
                json!({
                    "event": "call-request",
                    "data": { "callId": "call-9", "fromUserId": "bob", "fromUserName": "Bob" }
                })
                .to_string(),
            ))
            .await
            .unwrap();

        let received = timeout(WAIT, async {
            loop {
                if let Ok(CallEvent::CallReceived { call_id, from_user_name, .. }) =
                    events.recv().await
                {
                    return (call_id, from_user_name);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, ("call-9".to_string(), Some("Bob".to_string())));
        assert_eq!(session.controller().phase(), CallPhase::Receiving);

        session.controller().reject_call("call-9").await.unwrap();
        let response = next_json(&mut server).await;
        assert_eq!(response["event"], "call-response");
        assert_eq!(response["data"]["accepted"], false);
        assert_eq!(response["data"]["targetUserId"], "bob");

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = CollaborationSession::start(
            config(format!("http://{}", addr)),
            Arc::new(FakeMediaDevices::default()),
            Arc::new(FakeConnector::default()),
        )
        .await;

        let err = result.err().unwrap();
        assert!(err.to_string().contains("signaling relay"));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (url, mut accepted) = relay().await;
        let session = CollaborationSession::start(
            config(url),
            Arc::new(FakeMediaDevices::default()),
            Arc::new(FakeConnector::default()),
        )
        .await
        .unwrap();
        let _server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(session.signaling().status(), ConnectionStatus::Connected);

        let signaling = Arc::clone(&session.signaling);
        session.shutdown().await;
        assert_eq!(signaling.status(), ConnectionStatus::Disconnected);
        assert!(!signaling.off(CONTROLLER_HANDLER));
    }
}
