//! Test-Fakes für Medien, Negotiation und Signaling

use super::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind};
use super::negotiation::{
    NegotiationError, OfferOptions, PeerConnection, PeerConnector, PeerEventKind, PeerEvents,
    TrackSender,
};
use crate::signaling::{
    ConnectionStatus, IceCandidate, SessionDescription, SignalType, SignalingError,
    SignalingMessage, SignalingSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Default)]
pub struct FakeMediaDevices {
    failures: Mutex<VecDeque<MediaError>>,
    display_failure: Mutex<Option<MediaError>>,
    delay: Mutex<Option<Duration>>,
    user_media_calls: AtomicUsize,
    issued: Mutex<Vec<MediaStream>>,
    displays: Mutex<Vec<MediaStream>>,
}

impl FakeMediaDevices {
    /// Die nächsten `get_user_media`-Aufrufe schlagen in dieser Reihenfolge fehl
    pub fn fail_next(&self, errors: impl IntoIterator<Item = MediaError>) {
        self.failures.lock().extend(errors);
    }

    pub fn fail_display(&self, error: MediaError) {
        *self.display_failure.lock() = Some(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().clone()
    }

    pub fn last_display_track(&self) -> Option<MediaTrack> {
        self.displays
            .lock()
            .last()
            .and_then(|s| s.first_track(TrackKind::Video).cloned())
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(MediaTrack::new(TrackKind::Audio, "microphone"));
        }
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(TrackKind::Video, "camera"));
        }
        let stream = MediaStream::new(tracks);
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        let failure = self.display_failure.lock().take();
        if let Some(error) = failure {
            return Err(error);
        }

        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "screen")]);
        self.displays.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// NEGOTIATION
// ============================================================================

pub struct FakeSender {
    track: Mutex<Option<MediaTrack>>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl TrackSender for FakeSender {
    async fn kind(&self) -> Option<TrackKind> {
        self.track.lock().as_ref().map(MediaTrack::kind)
    }

    async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<(), NegotiationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NegotiationError::ReplaceTrack("fake sender failure".into()));
        }
        *self.track.lock() = track.cloned();
        Ok(())
    }
}

/// Zeichnet alle Aufrufe auf; Events können aus Tests ausgelöst werden
pub struct FakePeer {
    events: PeerEvents,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    negotiated: Mutex<Vec<usize>>,
    closed: AtomicBool,
    fail_replace: Arc<AtomicBool>,
    fail_offer: Arc<AtomicBool>,
}

impl FakePeer {
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.senders
            .lock()
            .iter()
            .filter_map(|s| s.track.lock().clone())
            .collect()
    }

    pub fn video_track(&self) -> Option<MediaTrack> {
        self.tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Video)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Anzahl lokaler Tracks bei jedem erstellten Offer oder Answer
    pub fn negotiated_track_counts(&self) -> Vec<usize> {
        self.negotiated.lock().clone()
    }

    fn note_negotiation(&self) {
        let tracks = self.tracks().len();
        self.negotiated.lock().push(tracks);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    pub fn emit(&self, kind: PeerEventKind) {
        self.events.emit(kind);
    }

    fn check_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &MediaTrack, _stream_id: &str) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.senders.lock().push(Arc::new(FakeSender {
            track: Mutex::new(Some(track.clone())),
            fail: Arc::clone(&self.fail_replace),
        }));
        Ok(())
    }

    async fn create_offer(
        &self,
        _options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError> {
        self.check_open()?;
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(NegotiationError::IceFailed("no candidates gathered".into()));
        }
        self.note_negotiation();
        Ok(SessionDescription::offer(format!("offer-for-{}", self.events.user_id())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check_open()?;
        if self.remote.lock().is_none() {
            return Err(NegotiationError::InvalidDescription("no remote offer".into()));
        }
        self.note_negotiation();
        Ok(SessionDescription::answer(format!("answer-for-{}", self.events.user_id())))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check_open()?;
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check_open()?;
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn TrackSender>)
            .collect()
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    peers: Mutex<HashMap<String, Arc<FakePeer>>>,
    fail_offers: Arc<AtomicBool>,
    delays: Mutex<VecDeque<Duration>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    /// Zuletzt erstellter Peer für diesen Benutzer
    pub fn peer(&self, user_id: &str) -> Option<Arc<FakePeer>> {
        self.peers.lock().get(user_id).cloned()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Verzögert den nächsten `connect`-Aufruf
    pub fn delay_next(&self, delay: Duration) {
        self.delays.lock().push_back(delay);
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let user_id = events.user_id().to_string();
        let peer = Arc::new(FakePeer {
            events,
            senders: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            negotiated: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_replace: Arc::new(AtomicBool::new(false)),
            fail_offer: Arc::clone(&self.fail_offers),
        });
        self.peers.lock().insert(user_id, Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalingMessage>>,
    connected: AtomicBool,
}

impl Default for RecordingSignaling {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl RecordingSignaling {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn kinds(&self) -> Vec<SignalType> {
        self.sent.lock().iter().map(|m| m.kind).collect()
    }

    pub fn count(&self, kind: SignalType) -> usize {
        self.sent.lock().iter().filter(|m| m.kind == kind).count()
    }

    /// Entnimmt alle bisher gesendeten Nachrichten
    pub fn take(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SignalingSink for RecordingSignaling {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}
