//! Peer Connection Manager - eine Negotiation pro entferntem Teilnehmer

use super::media::{MediaStream, MediaTrack, TrackKind};
use super::negotiation::{
    ConnectionState, IceConnectionState, NegotiationError, PeerConnection, PeerConnector,
    PeerEvent, PeerEventKind, PeerEvents,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct NegotiationState {
    connection_state: ConnectionState,
    ice_connection_state: IceConnectionState,
    local_stream: Option<MediaStream>,
}

/// Negotiation mit einem Teilnehmer
///
/// Besitzt das Negotiation-Objekt exklusiv; `close` ist der einzige Weg, es freizugeben.
pub struct PeerNegotiation {
    pub id: String,
    pub user_id: String,
    pub generation: u64,
    connection: Arc<dyn PeerConnection>,
    state: Mutex<NegotiationState>,
}

impl PeerNegotiation {
    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_connection_state
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.state.lock().local_stream.clone()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Failed to close negotiation {}: {}", self.id, e);
        }
        self.state.lock().connection_state = ConnectionState::Closed;
        tracing::debug!("Closed negotiation {}", self.id);
    }
}

impl std::fmt::Debug for PeerNegotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNegotiation")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("generation", &self.generation)
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// PEER CONNECTION MANAGER
// ============================================================================

pub struct PeerConnectionManager {
    connector: Arc<dyn PeerConnector>,
    negotiations: RwLock<HashMap<String, Arc<PeerNegotiation>>>,
    /// Kleinste Generation, die noch Negotiations anlegen darf
    floor: AtomicU64,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnectionManager {
    /// Events aller Negotiations landen in `event_tx`
    pub fn new(connector: Arc<dyn PeerConnector>, event_tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            connector,
            negotiations: RwLock::new(HashMap::new()),
            floor: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Erstellt eine Negotiation und hängt alle lokalen Tracks an
    ///
    /// Eine bestehende Negotiation für denselben Benutzer wird ersetzt und geschlossen,
    /// sofern sie nicht zu einer neueren Generation gehört. Ist `generation` inzwischen
    /// überholt, wird die neue Verbindung geschlossen und `Superseded` zurückgegeben.
    pub async fn create(
        &self,
        user_id: &str,
        local_stream: Option<&MediaStream>,
        generation: u64,
    ) -> Result<Arc<PeerNegotiation>, NegotiationError> {
        let events = PeerEvents::new(user_id, generation, self.event_tx.clone());
        let connection = self.connector.connect(events).await?;

        if let Some(stream) = local_stream {
            for track in stream.tracks() {
                if let Err(e) = connection.add_track(track, stream.id()).await {
                    let _ = connection.close().await;
                    return Err(e);
                }
            }
        }

        let negotiation = Arc::new(PeerNegotiation {
            id: format!("peer-{}-{}", user_id, chrono::Utc::now().timestamp_millis()),
            user_id: user_id.to_string(),
            generation,
            connection,
            state: Mutex::new(NegotiationState {
                local_stream: local_stream.cloned(),
                ..NegotiationState::default()
            }),
        });

        let previous = {
            let mut negotiations = self.negotiations.write();
            let stale = generation < self.floor.load(Ordering::SeqCst)
                || negotiations
                    .get(user_id)
                    .is_some_and(|current| current.generation > generation);
            if stale {
                None
            } else {
                Some(negotiations.insert(user_id.to_string(), Arc::clone(&negotiation)))
            }
        };

        let Some(previous) = previous else {
            tracing::debug!("Dropping stale negotiation {}", negotiation.id);
            negotiation.close().await;
            return Err(NegotiationError::Superseded);
        };
        if let Some(previous) = previous {
            tracing::info!("Replacing negotiation for {}", user_id);
            previous.close().await;
        }

        tracing::info!("Created negotiation {}", negotiation.id);
        Ok(negotiation)
    }

    /// Ab jetzt gelten nur noch Negotiations mit mindestens dieser Generation
    pub fn advance(&self, generation: u64) {
        self.floor.fetch_max(generation, Ordering::SeqCst);
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<PeerNegotiation>> {
        self.negotiations.read().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.negotiations.read().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.negotiations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.negotiations.read().is_empty()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.negotiations.read().keys().cloned().collect()
    }

    /// Schliesst und entfernt die Negotiation eines Benutzers
    pub async fn close_and_remove(&self, user_id: &str) -> bool {
        let removed = self.negotiations.write().remove(user_id);
        match removed {
            Some(negotiation) => {
                negotiation.close().await;
                true
            }
            None => false,
        }
    }

    /// Entfernt genau diese Negotiation, falls sie noch registriert ist, und schliesst sie
    pub async fn discard(&self, negotiation: &Arc<PeerNegotiation>) {
        {
            let mut negotiations = self.negotiations.write();
            if negotiations
                .get(&negotiation.user_id)
                .is_some_and(|current| Arc::ptr_eq(current, negotiation))
            {
                negotiations.remove(&negotiation.user_id);
            }
        }
        negotiation.close().await;
    }

    /// Entfernt alle Negotiations synchron; schliessen muss der Aufrufer
    pub fn take_all(&self) -> Vec<Arc<PeerNegotiation>> {
        self.negotiations.write().drain().map(|(_, n)| n).collect()
    }

    /// Übernimmt Zustandsänderungen; `false` wenn das Event zu keiner aktuellen Negotiation gehört
    pub fn record(&self, event: &PeerEvent) -> bool {
        let Some(negotiation) = self.get(&event.user_id) else {
            return false;
        };
        if negotiation.generation != event.generation {
            return false;
        }

        let mut state = negotiation.state.lock();
        match &event.kind {
            PeerEventKind::ConnectionStateChanged(s) => state.connection_state = *s,
            PeerEventKind::IceConnectionStateChanged(s) => state.ice_connection_state = *s,
            _ => {}
        }
        true
    }

    /// Hängt einen lokalen Stream an alle Negotiations an, die noch keinen haben
    ///
    /// Gibt die betroffenen Negotiations zurück; sie müssen neu verhandelt werden.
    pub async fn attach_stream(
        &self,
        stream: &MediaStream,
    ) -> Result<Vec<Arc<PeerNegotiation>>, NegotiationError> {
        let pending: Vec<_> = self
            .negotiations
            .read()
            .values()
            .filter(|n| n.state.lock().local_stream.is_none())
            .cloned()
            .collect();

        for negotiation in &pending {
            for track in stream.tracks() {
                negotiation.connection.add_track(track, stream.id()).await?;
            }
            negotiation.state.lock().local_stream = Some(stream.clone());
        }
        Ok(pending)
    }

    /// Tauscht den ausgehenden Track einer Art in allen Negotiations
    ///
    /// Alles-oder-nichts: schlägt ein Sender fehl, werden die bereits ersetzten
    /// auf `previous` zurückgesetzt.
    pub async fn replace_track(
        &self,
        kind: TrackKind,
        track: &MediaTrack,
        previous: Option<&MediaTrack>,
    ) -> Result<usize, NegotiationError> {
        let negotiations: Vec<_> = self.negotiations.read().values().cloned().collect();

        let mut senders = Vec::new();
        for negotiation in &negotiations {
            for sender in negotiation.connection.senders().await {
                if sender.kind().await == Some(kind) {
                    senders.push(sender);
                }
            }
        }

        let results = join_all(senders.iter().map(|s| s.replace_track(Some(track)))).await;

        let Some(error) = results.iter().find_map(|r| r.as_ref().err()).cloned() else {
            return Ok(senders.len());
        };

        tracing::warn!("Rolling back track replacement: {}", error);
        let replaced = senders
            .iter()
            .zip(&results)
            .filter(|(_, r)| r.is_ok())
            .map(|(s, _)| s.replace_track(previous));
        for rollback in join_all(replaced).await {
            if let Err(e) = rollback {
                tracing::error!("Track rollback failed: {}", e);
            }
        }

        Err(error)
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("negotiations", &self.user_ids())
            .finish()
    }
}

/// Schliesst Negotiations parallel
pub(crate) async fn close_all(negotiations: Vec<Arc<PeerNegotiation>>) {
    join_all(negotiations.iter().map(|n| n.close())).await;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::FakeConnector;

    fn stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "camera"),
        ])
    }

    fn manager(connector: &Arc<FakeConnector>) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerConnectionManager::new(connector.clone(), tx), rx)
    }

    #[tokio::test]
    async fn test_create_attaches_local_tracks() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        let local = stream();

        let negotiation = peers.create("bob", Some(&local), 1).await.unwrap();
        assert!(negotiation.id.starts_with("peer-bob-"));
        assert_eq!(connector.peer("bob").unwrap().tracks().len(), 2);
        assert!(peers.contains("bob"));
        assert_eq!(negotiation.connection_state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_duplicate_create_closes_previous() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);

        peers.create("bob", None, 1).await.unwrap();
        let first = connector.peer("bob").unwrap();
        peers.create("bob", None, 1).await.unwrap();

        assert!(first.is_closed());
        assert_eq!(peers.len(), 1);
        assert!(!connector.peer("bob").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_and_remove() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        peers.create("bob", None, 1).await.unwrap();

        assert!(peers.close_and_remove("bob").await);
        assert!(!peers.close_and_remove("bob").await);
        assert!(connector.peer("bob").unwrap().is_closed());
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_record_ignores_stale_generation() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        let negotiation = peers.create("bob", None, 2).await.unwrap();

        let stale = PeerEvent {
            user_id: "bob".into(),
            generation: 1,
            kind: PeerEventKind::ConnectionStateChanged(ConnectionState::Failed),
        };
        assert!(!peers.record(&stale));

        let current = PeerEvent { generation: 2, ..stale };
        assert!(peers.record(&current));
        assert_eq!(negotiation.connection_state(), ConnectionState::Failed);

        let ice = PeerEvent {
            user_id: "bob".into(),
            generation: 2,
            kind: PeerEventKind::IceConnectionStateChanged(IceConnectionState::Checking),
        };
        assert!(peers.record(&ice));
        assert_eq!(negotiation.ice_connection_state(), IceConnectionState::Checking);
    }

    #[tokio::test]
    async fn test_older_generation_never_replaces_newer() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        let fresh = peers.create("bob", None, 3).await.unwrap();
        let fresh_peer = connector.peer("bob").unwrap();

        let result = peers.create("bob", None, 1).await;
        assert_eq!(result.err(), Some(NegotiationError::Superseded));
        assert!(connector.peer("bob").unwrap().is_closed());

        assert!(!fresh_peer.is_closed());
        assert!(Arc::ptr_eq(&peers.get("bob").unwrap(), &fresh));
    }

    #[tokio::test]
    async fn test_create_below_floor_is_rejected() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        peers.advance(2);

        let result = peers.create("bob", None, 1).await;
        assert_eq!(result.err(), Some(NegotiationError::Superseded));
        assert!(peers.is_empty());
        assert!(connector.peer("bob").unwrap().is_closed());

        assert!(peers.create("bob", None, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_replace_track_rolls_back_on_failure() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        let local = stream();
        let camera = local.first_track(TrackKind::Video).unwrap().clone();
        peers.create("bob", Some(&local), 1).await.unwrap();
        peers.create("carol", Some(&local), 1).await.unwrap();

        let screen = MediaTrack::new(TrackKind::Video, "screen");
        assert_eq!(peers.replace_track(TrackKind::Video, &screen, Some(&camera)).await, Ok(2));
        assert!(connector.peer("bob").unwrap().video_track().unwrap().same_track(&screen));

        connector.peer("carol").unwrap().fail_replace(true);
        let next = MediaTrack::new(TrackKind::Video, "screen-2");
        assert!(peers.replace_track(TrackKind::Video, &next, Some(&screen)).await.is_err());
        assert!(connector.peer("bob").unwrap().video_track().unwrap().same_track(&screen));
        assert!(connector.peer("carol").unwrap().video_track().unwrap().same_track(&screen));
    }

    #[tokio::test]
    async fn test_attach_stream_to_bare_negotiations() {
        let connector = Arc::new(FakeConnector::default());
        let (peers, _rx) = manager(&connector);
        let negotiation = peers.create("bob", None, 1).await.unwrap();

        let attached = peers.attach_stream(&stream()).await.unwrap();
        assert_eq!(attached.len(), 1);
        assert!(negotiation.local_stream().is_some());
        assert!(peers.attach_stream(&stream()).await.unwrap().is_empty());
        assert_eq!(connector.peer("bob").unwrap().tracks().len(), 2);

        let taken = peers.take_all();
        assert_eq!(taken.len(), 1);
        close_all(taken).await;
        assert!(connector.peer("bob").unwrap().is_closed());
    }
}
