//! Call Session Controller
//!
//! Zustandsmaschine für genau einen Anruf (Idle → Initiating/Receiving → InCall → Idle).
//! Besitzt lokale Medien, Teilnehmerliste und Anrufdauer. Negotiation läuft über den
//! [`PeerConnectionManager`], Nachrichten über einen [`SignalingSink`].
//!
//! Jeder Anruf bekommt eine Generation. Asynchrone Fortsetzungen prüfen sie nach jedem
//! `await` und verwerfen ihr Ergebnis, wenn der Anruf inzwischen beendet wurde.

use super::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use super::negotiation::{
    IceConnectionState, NegotiationError, OfferOptions, PeerConnector, PeerEvent, PeerEventKind,
};
use super::peers::{close_all, PeerConnectionManager, PeerNegotiation};
use super::session::{CallPhase, CallSession, LocalMediaState, Participant};
use crate::config::CallConfig;
use crate::error_handler::{ErrorHandler, RawError, RecoveryOutcome, WebRtcError};
use crate::signaling::{
    CallRequestData, IceCandidate, ParticipantUpdate, SessionDescription, SignalType,
    SignalingMessage, SignalingSink,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No pending call with id {0}")]
    NoPendingCall(String),

    #[error("Call ended before the operation completed")]
    Superseded,

    #[error(transparent)]
    Failed(#[from] WebRtcError),
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events die vom CallController ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    /// Eingehender Anruf (nicht bei automatischer Busy-Ablehnung)
    CallReceived {
        call_id: String,
        from_user_id: String,
        from_user_name: Option<String>,
    },
    CallRejected { call_id: String, by_user_id: String },
    CallEnded { call_id: String },
    ParticipantJoined(Participant),
    ParticipantLeft { user_id: String },
    ParticipantUpdated(Participant),
    RemoteStream { user_id: String, stream: MediaStream },
    DurationTick(u64),
    /// Anzeigbare Fehlermeldung
    Error(String),
}

// ============================================================================
// CONTROLLER STATE
// ============================================================================

#[derive(Default)]
struct ControllerState {
    generation: u64,
    session: CallSession,
    /// Gegenüber des Anrufs (Ziel oder Anrufer)
    remote_user: Option<String>,
    participants: Vec<Participant>,
    local_stream: Option<MediaStream>,
    screen_stream: Option<MediaStream>,
    remote_streams: HashMap<String, MediaStream>,
    started: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
}

impl ControllerState {
    fn upsert_participant(&mut self, participant: Participant) {
        match self
            .participants
            .iter_mut()
            .find(|p| p.user_id == participant.user_id)
        {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    fn camera_track(&self) -> Option<MediaTrack> {
        self.local_stream
            .as_ref()
            .and_then(|s| s.first_track(TrackKind::Video))
            .cloned()
    }

    fn is_call(&self, call_id: &str) -> bool {
        self.session.call_id.as_deref() == Some(call_id)
    }
}

/// Ergebnis des synchronen Abbaus
struct Teardown {
    call_id: Option<String>,
    phase: CallPhase,
    remote_user: Option<String>,
    negotiations: Vec<Arc<PeerNegotiation>>,
}

struct Inner {
    local_user_id: String,
    local_user_name: Option<String>,
    state: Mutex<ControllerState>,
    peers: PeerConnectionManager,
    errors: ErrorHandler,
    signaling: Arc<dyn SignalingSink>,
    media: Arc<dyn MediaDevices>,
    inbox: mpsc::UnboundedSender<SignalingMessage>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Neue Generation; ältere Negotiations werden danach nicht mehr angenommen
    fn next_generation(&self, state: &mut ControllerState) -> u64 {
        state.generation += 1;
        self.peers.advance(state.generation);
        state.generation
    }

    /// Setzt `last_error` und meldet den Fehler an die Anwendung
    fn surface(&self, error: &WebRtcError) {
        self.state.lock().session.last_error = Some(error.clone());
        self.emit(CallEvent::Error(error.user_message.clone()));
    }

    /// Klassifiziert, speichert in der Historie und meldet
    fn fail(&self, raw: RawError, context: &str) -> WebRtcError {
        let error = self.errors.handle(&raw, Some(context));
        self.surface(&error);
        error
    }

    /// Sendet eine Nachricht; Ausfälle des Kanals werden gemeldet, nicht propagiert
    fn send(&self, message: SignalingMessage) -> bool {
        let kind = message.kind;
        match self.signaling.send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not send {}: {}", kind.as_str(), e);
                self.fail(e.into(), "signaling");
                false
            }
        }
    }

    fn message(&self, kind: SignalType, call_id: &str) -> SignalingMessage {
        SignalingMessage::new(kind, call_id, &self.local_user_id)
    }

    fn local_participant(&self, media: &LocalMediaState) -> Participant {
        Participant::from_local(&self.local_user_id, media)
    }

    /// Stoppt Medien, entfernt alle Negotiations und setzt die Session zurück
    ///
    /// Läuft vollständig synchron; die entfernten Negotiations schliesst der Aufrufer.
    fn teardown(&self) -> Teardown {
        let teardown = {
            let mut state = self.state.lock();
            self.next_generation(&mut state);

            if let Some(stream) = state.local_stream.take() {
                stream.stop();
            }
            if let Some(stream) = state.screen_stream.take() {
                stream.stop();
            }
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }

            state.participants.clear();
            state.remote_streams.clear();
            state.started = None;

            let teardown = Teardown {
                call_id: state.session.call_id.clone(),
                phase: state.session.phase,
                remote_user: state.remote_user.take(),
                negotiations: self.peers.take_all(),
            };
            state.session.reset();
            teardown
        };

        if teardown.phase != CallPhase::Idle {
            tracing::info!(
                "Call {} torn down",
                teardown.call_id.as_deref().unwrap_or("-")
            );
            self.emit(CallEvent::PhaseChanged(CallPhase::Idle));
        }
        teardown
    }

    fn teardown_if_current(&self, generation: u64) -> Option<Teardown> {
        if self.is_current(generation) {
            Some(self.teardown())
        } else {
            None
        }
    }

    fn spawn_ticker(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };

                let seconds = {
                    let mut state = inner.state.lock();
                    if state.generation != generation || state.session.phase != CallPhase::InCall {
                        break;
                    }
                    let seconds = state.started.map_or(0, |s| s.elapsed().as_secs());
                    state.session.duration_seconds = seconds;
                    seconds
                };
                inner.emit(CallEvent::DurationTick(seconds));
            }
        })
    }

    /// Übergang nach InCall mit Startzeit und Ticker
    fn enter_call(self: &Arc<Self>, state: &mut ControllerState) {
        state.session.phase = CallPhase::InCall;
        state.session.started_at = Some(Utc::now());
        state.session.duration_seconds = 0;
        state.started = Some(Instant::now());
        if let Some(ticker) = state.ticker.replace(self.spawn_ticker(state.generation)) {
            ticker.abort();
        }
    }
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

/// Handle auf den Controller einer Collaboration-Session
///
/// Klone teilen denselben Zustand. Muss innerhalb einer Tokio-Runtime erstellt werden.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

impl CallController {
    pub fn new(
        config: &CallConfig,
        signaling: Arc<dyn SignalingSink>,
        media: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            local_user_id: config.signaling.user_id.clone(),
            local_user_name: config.signaling.user_name.clone(),
            state: Mutex::new(ControllerState::default()),
            peers: PeerConnectionManager::new(connector, peer_tx),
            errors: ErrorHandler::new(config.error_history_capacity, config.recovery.clone()),
            signaling,
            media,
            inbox: inbox_tx,
            event_tx,
        });

        tokio::spawn(dispatch_inbox(Arc::downgrade(&inner), inbox_rx));
        tokio::spawn(pump_peer_events(Arc::downgrade(&inner), peer_rx));

        Self { inner }
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local_user_id
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.state.lock().session.phase
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.state.lock().session.call_id.clone()
    }

    pub fn session(&self) -> CallSession {
        self.inner.state.lock().session.clone()
    }

    pub fn local_media(&self) -> LocalMediaState {
        self.inner.state.lock().session.local_media
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.state.lock().participants.clone()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.state.lock().local_stream.clone()
    }

    pub fn screen_stream(&self) -> Option<MediaStream> {
        self.inner.state.lock().screen_stream.clone()
    }

    pub fn remote_streams(&self) -> HashMap<String, MediaStream> {
        self.inner.state.lock().remote_streams.clone()
    }

    /// Anrufdauer in Sekunden (0 ausserhalb von InCall)
    pub fn duration(&self) -> u64 {
        self.inner.state.lock().session.duration_seconds
    }

    pub fn last_error(&self) -> Option<WebRtcError> {
        self.inner.state.lock().session.last_error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.state.lock().session.last_error = None;
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.inner.errors
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.inner.peers
    }

    // ========================================================================
    // INBOUND DISPATCH
    // ========================================================================

    /// Handler für `SignalingClient::on_message`
    pub fn inbox(&self) -> impl Fn(SignalingMessage) + Send + Sync + 'static {
        let inbox = self.inner.inbox.clone();
        move |message| {
            let _ = inbox.send(message);
        }
    }

    /// Meldet einen Ausfall des Signaling-Kanals, ohne den Anruf abzubauen
    pub fn report_signaling_interruption(&self, reason: &str) {
        if self.phase() == CallPhase::Idle {
            tracing::debug!("Signaling interrupted while idle: {}", reason);
            return;
        }
        self.inner.fail(
            RawError::new("SignalingError", format!("signaling connection lost: {}", reason)),
            "signaling",
        );
    }

    // ========================================================================
    // CALL LIFECYCLE
    // ========================================================================

    /// Startet einen ausgehenden Anruf und gibt die neue Call-ID zurück
    pub async fn start_call(&self, target_user_id: &str) -> Result<String, CallError> {
        let inner = &self.inner;

        let (generation, call_id, media) = {
            let mut state = inner.state.lock();
            if state.session.phase != CallPhase::Idle {
                tracing::warn!("Cannot start call to {}: already in a call", target_user_id);
                return Err(CallError::AlreadyInCall);
            }

            let generation = inner.next_generation(&mut state);
            let call_id = new_call_id();
            state.session.call_id = Some(call_id.clone());
            state.session.phase = CallPhase::Initiating;
            state.session.last_error = None;
            state.remote_user = Some(target_user_id.to_string());
            (generation, call_id, state.session.local_media)
        };
        inner.emit(CallEvent::PhaseChanged(CallPhase::Initiating));
        tracing::info!("Starting call {} to {}", call_id, target_user_id);

        let stream = match self
            .acquire_media(media, "call_initiation", generation)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(teardown) = inner.teardown_if_current(generation) {
                    close_all(teardown.negotiations).await;
                }
                return Err(e);
            }
        };

        let local = {
            let mut state = inner.state.lock();
            let local = inner.local_participant(&state.session.local_media);
            state.upsert_participant(local.clone());
            local
        };
        inner.emit(CallEvent::ParticipantJoined(local));

        inner.send(
            inner
                .message(SignalType::CallRequest, &call_id)
                .to(target_user_id)
                .with_data(&CallRequestData {
                    from_user_name: inner.local_user_name.clone(),
                }),
        );

        let negotiation = match inner
            .peers
            .create(target_user_id, Some(&stream), generation)
            .await
        {
            Ok(negotiation) => negotiation,
            Err(NegotiationError::Superseded) => return Err(CallError::Superseded),
            Err(e) => {
                let error = self.negotiation_failed(e, "call_initiation", generation).await;
                return Err(CallError::Failed(error));
            }
        };

        if !inner.is_current(generation) {
            inner.peers.discard(&negotiation).await;
            return Err(CallError::Superseded);
        }

        self.negotiate_offer(&negotiation, &call_id, generation)
            .await?;

        if inner.is_current(generation) {
            Ok(call_id)
        } else {
            Err(CallError::Superseded)
        }
    }

    /// Nimmt den ausstehenden Anruf an
    ///
    /// Nicht fatale Medienfehler lassen den Anruf in `Receiving`, fatale beenden ihn.
    pub async fn accept_call(&self, call_id: &str) -> Result<(), CallError> {
        let inner = &self.inner;

        let (generation, media) = {
            let state = inner.state.lock();
            if state.session.phase != CallPhase::Receiving || !state.is_call(call_id) {
                return Err(CallError::NoPendingCall(call_id.to_string()));
            }
            (state.generation, state.session.local_media)
        };
        tracing::info!("Accepting call {}", call_id);

        let stream = match self
            .acquire_media(media, "call_acceptance", generation)
            .await
        {
            Ok(stream) => stream,
            Err(CallError::Failed(error)) if error.is_fatal() => {
                tracing::error!("Fatal media error, rejecting call {}", call_id);
                if let Some(teardown) = inner.teardown_if_current(generation) {
                    self.send_reject(call_id, teardown.remote_user.as_deref());
                    close_all(teardown.negotiations).await;
                    inner.emit(CallEvent::CallEnded {
                        call_id: call_id.to_string(),
                    });
                }
                return Err(CallError::Failed(error));
            }
            Err(e) => return Err(e),
        };

        // Offer kam ggf. schon vor der Annahme; diese Negotiations haben ohne
        // lokale Tracks geantwortet und werden nach dem call-accept neu verhandelt
        let renegotiate = match inner.peers.attach_stream(&stream).await {
            Ok(attached) => attached,
            Err(e) => {
                inner.fail(e.into(), "call_acceptance");
                Vec::new()
            }
        };

        let joined = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return Err(CallError::Superseded);
            }

            let local = inner.local_participant(&state.session.local_media);
            state.upsert_participant(local);

            let caller = state.remote_user.clone().map(Participant::new);
            if let Some(caller) = &caller {
                state.upsert_participant(caller.clone());
            }
            inner.enter_call(&mut state);
            caller
        };

        inner.emit(CallEvent::PhaseChanged(CallPhase::InCall));
        let caller = joined.map(|participant| {
            let user_id = participant.user_id.clone();
            inner.emit(CallEvent::ParticipantJoined(participant));
            user_id
        });

        let mut accept = inner.message(SignalType::CallAccept, call_id);
        if let Some(caller) = caller {
            accept = accept.to(caller);
        }
        inner.send(accept);

        for negotiation in renegotiate {
            if let Err(e) = self.send_offer(&negotiation, call_id, generation).await {
                self.negotiation_failed(e, "offer", generation).await;
            }
        }

        Ok(())
    }

    /// Lehnt den ausstehenden Anruf ab
    pub async fn reject_call(&self, call_id: &str) -> Result<(), CallError> {
        {
            let state = self.inner.state.lock();
            if state.session.phase != CallPhase::Receiving || !state.is_call(call_id) {
                return Err(CallError::NoPendingCall(call_id.to_string()));
            }
        }
        tracing::info!("Rejecting call {}", call_id);

        let teardown = self.inner.teardown();
        self.send_reject(call_id, teardown.remote_user.as_deref());
        close_all(teardown.negotiations).await;
        Ok(())
    }

    /// Beendet den aktuellen Anruf
    ///
    /// Medien werden sofort gestoppt und alle Negotiations entfernt, auch wenn noch
    /// Operationen laufen; deren Ergebnisse werden verworfen.
    pub async fn end_call(&self) {
        let teardown = self.inner.teardown();
        let Some(call_id) = teardown.call_id else {
            return;
        };

        match teardown.phase {
            CallPhase::Receiving => self.send_reject(&call_id, teardown.remote_user.as_deref()),
            _ => {
                self.inner
                    .send(self.inner.message(SignalType::CallEnd, &call_id));
            }
        }

        close_all(teardown.negotiations).await;
        tracing::info!("Call {} ended", call_id);
        self.inner.emit(CallEvent::CallEnded { call_id });
    }

    // ========================================================================
    // MEDIA TOGGLES
    // ========================================================================

    /// Schaltet die Kamera um; gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> bool {
        let (enabled, call_id) = {
            let mut state = self.inner.state.lock();
            let enabled = !state.session.local_media.video;
            state.session.local_media.video = enabled;

            if let Some(stream) = &state.local_stream {
                stream.video_tracks().for_each(|t| t.set_enabled(enabled));
            }
            let local_id = &self.inner.local_user_id;
            if let Some(local) = state.participant_mut(local_id) {
                local.is_video_enabled = enabled;
            }
            (enabled, state.session.call_id.clone())
        };

        tracing::info!("Video {}", if enabled { "enabled" } else { "disabled" });
        self.broadcast_update(
            call_id,
            ParticipantUpdate {
                is_video_enabled: Some(enabled),
                ..ParticipantUpdate::default()
            },
        );
        enabled
    }

    /// Schaltet das Mikrofon um; gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> bool {
        let (enabled, call_id) = {
            let mut state = self.inner.state.lock();
            let enabled = !state.session.local_media.audio;
            state.session.local_media.audio = enabled;

            if let Some(stream) = &state.local_stream {
                stream.audio_tracks().for_each(|t| t.set_enabled(enabled));
            }
            let local_id = &self.inner.local_user_id;
            if let Some(local) = state.participant_mut(local_id) {
                local.is_audio_enabled = enabled;
            }
            (enabled, state.session.call_id.clone())
        };

        tracing::info!("Audio {}", if enabled { "enabled" } else { "disabled" });
        self.broadcast_update(
            call_id,
            ParticipantUpdate {
                is_audio_enabled: Some(enabled),
                ..ParticipantUpdate::default()
            },
        );
        enabled
    }

    /// Startet oder beendet Screen-Sharing; gibt den neuen Zustand zurück
    ///
    /// Fehler werden über `last_error` gemeldet.
    pub async fn toggle_screen_share(&self) -> bool {
        let (sharing, phase, generation) = {
            let state = self.inner.state.lock();
            (
                state.session.local_media.screen_share,
                state.session.phase,
                state.generation,
            )
        };

        if sharing {
            self.stop_screen_share(generation).await;
            false
        } else if phase == CallPhase::Idle {
            tracing::warn!("Screen sharing requires an active call");
            false
        } else {
            self.start_screen_share(generation).await
        }
    }

    async fn start_screen_share(&self, generation: u64) -> bool {
        let inner = &self.inner;

        let stream = match inner.media.get_display_media().await {
            Ok(stream) => stream,
            Err(e) => {
                let error = inner.fail(e.into(), "screen_share");
                self.end_if_fatal(&error, generation).await;
                return false;
            }
        };
        let Some(screen) = stream.first_track(TrackKind::Video).cloned() else {
            stream.stop();
            return false;
        };

        let camera = {
            let state = inner.state.lock();
            if state.generation != generation {
                None
            } else {
                Some(state.camera_track())
            }
        };
        let Some(camera) = camera else {
            stream.stop();
            return false;
        };

        if let Err(e) = inner
            .peers
            .replace_track(TrackKind::Video, &screen, camera.as_ref())
            .await
        {
            stream.stop();
            let error = inner.fail(e.into(), "screen_share");
            self.end_if_fatal(&error, generation).await;
            return false;
        }

        let call_id = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                drop(state);
                stream.stop();
                return false;
            }
            state.screen_stream = Some(stream);
            state.session.local_media.screen_share = true;
            let local_id = &inner.local_user_id;
            if let Some(local) = state.participant_mut(local_id) {
                local.is_sharing_screen = true;
            }
            state.session.call_id.clone()
        };

        tracing::info!("Screen sharing started");
        self.watch_screen_track(screen, generation);
        self.broadcast_update(
            call_id,
            ParticipantUpdate {
                is_sharing_screen: Some(true),
                ..ParticipantUpdate::default()
            },
        );
        true
    }

    async fn stop_screen_share(&self, generation: u64) {
        let inner = &self.inner;

        let (screen, camera) = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            (state.screen_stream.take(), state.camera_track())
        };
        let Some(screen) = screen else {
            return;
        };

        if let Some(camera) = camera {
            let previous = screen.first_track(TrackKind::Video);
            if let Err(e) = inner
                .peers
                .replace_track(TrackKind::Video, &camera, previous)
                .await
            {
                inner.fail(e.into(), "screen_share");
            }
        }
        screen.stop();

        let call_id = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.session.local_media.screen_share = false;
            let local_id = &inner.local_user_id;
            if let Some(local) = state.participant_mut(local_id) {
                local.is_sharing_screen = false;
            }
            state.session.call_id.clone()
        };

        tracing::info!("Screen sharing stopped");
        self.broadcast_update(
            call_id,
            ParticipantUpdate {
                is_sharing_screen: Some(false),
                ..ParticipantUpdate::default()
            },
        );
    }

    /// Beendet Screen-Sharing, wenn die Aufnahme extern entzogen wird
    fn watch_screen_track(&self, track: MediaTrack, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            track.ended().await;
            let Some(inner) = weak.upgrade() else { return };

            let current = inner
                .state
                .lock()
                .screen_stream
                .as_ref()
                .and_then(|s| s.first_track(TrackKind::Video))
                .is_some_and(|t| t.same_track(&track));

            if current {
                tracing::info!("Screen capture ended externally");
                CallController { inner }.stop_screen_share(generation).await;
            }
        });
    }

    // ========================================================================
    // SIGNALING MESSAGES
    // ========================================================================

    /// Verarbeitet eine eingehende Nachricht
    ///
    /// Wird vom Inbox-Task in Eingangsreihenfolge aufgerufen.
    pub async fn handle_signaling_message(&self, message: SignalingMessage) {
        if message.from_user_id == self.inner.local_user_id {
            return;
        }
        if let Some(to) = &message.to_user_id {
            if *to != self.inner.local_user_id {
                return;
            }
        }

        tracing::debug!(
            "Handling {} for call {} from {}",
            message.kind.as_str(),
            message.call_id,
            message.from_user_id
        );

        match message.kind {
            SignalType::CallRequest => self.on_call_request(message),
            SignalType::CallAccept => self.on_call_accept(message),
            SignalType::CallReject => self.on_call_reject(message).await,
            SignalType::CallEnd => self.on_call_end(message).await,
            SignalType::Offer => self.on_offer(message).await,
            SignalType::Answer => self.on_answer(message).await,
            SignalType::IceCandidate => self.on_ice_candidate(message).await,
            SignalType::ParticipantUpdate => self.on_participant_update(message),
        }
    }

    fn on_call_request(&self, message: SignalingMessage) {
        let inner = &self.inner;
        let from_user_name = message
            .payload::<CallRequestData>()
            .ok()
            .and_then(|d| d.from_user_name);

        let idle = {
            let mut state = inner.state.lock();
            let idle = state.session.phase == CallPhase::Idle;
            if idle {
                inner.next_generation(&mut state);
                state.session.call_id = Some(message.call_id.clone());
                state.session.phase = CallPhase::Receiving;
                state.session.last_error = None;
                state.remote_user = Some(message.from_user_id.clone());
            }
            idle
        };

        if !idle {
            tracing::info!(
                "Busy, rejecting call {} from {}",
                message.call_id,
                message.from_user_id
            );
            self.send_reject(&message.call_id, Some(message.from_user_id.as_str()));
            return;
        }

        tracing::info!(
            "Incoming call {} from {}",
            message.call_id,
            message.from_user_id
        );
        inner.emit(CallEvent::PhaseChanged(CallPhase::Receiving));
        inner.emit(CallEvent::CallReceived {
            call_id: message.call_id,
            from_user_id: message.from_user_id,
            from_user_name,
        });
    }

    fn on_call_accept(&self, message: SignalingMessage) {
        let inner = &self.inner;

        let (joined, entered) = {
            let mut state = inner.state.lock();
            if !state.is_call(&message.call_id) {
                return;
            }
            let phase = state.session.phase;
            let entered = match phase {
                CallPhase::Initiating => {
                    inner.enter_call(&mut state);
                    true
                }
                CallPhase::InCall => false,
                _ => return,
            };
            let participant = Participant::new(&message.from_user_id);
            state.upsert_participant(participant.clone());
            (participant, entered)
        };

        tracing::info!(
            "Call {} accepted by {}",
            message.call_id,
            message.from_user_id
        );
        if entered {
            inner.emit(CallEvent::PhaseChanged(CallPhase::InCall));
        }
        inner.emit(CallEvent::ParticipantJoined(joined));
    }

    async fn on_call_reject(&self, message: SignalingMessage) {
        let inner = &self.inner;
        {
            let state = inner.state.lock();
            if !state.is_call(&message.call_id) || state.session.phase != CallPhase::Initiating {
                return;
            }
        }

        tracing::info!(
            "Call {} rejected by {}",
            message.call_id,
            message.from_user_id
        );
        let teardown = inner.teardown();
        inner.emit(CallEvent::Error("Call was rejected".to_string()));
        inner.emit(CallEvent::CallRejected {
            call_id: message.call_id,
            by_user_id: message.from_user_id,
        });
        close_all(teardown.negotiations).await;
    }

    async fn on_call_end(&self, message: SignalingMessage) {
        let inner = &self.inner;
        {
            let state = inner.state.lock();
            if !state.is_call(&message.call_id) {
                return;
            }
        }

        tracing::info!(
            "Call {} ended by {}",
            message.call_id,
            message.from_user_id
        );
        let teardown = inner.teardown();
        close_all(teardown.negotiations).await;
        inner.emit(CallEvent::CallEnded {
            call_id: message.call_id,
        });
    }

    async fn on_offer(&self, message: SignalingMessage) {
        let inner = &self.inner;
        let from = message.from_user_id.as_str();

        let current = {
            let state = inner.state.lock();
            if state.is_call(&message.call_id) {
                Some((state.generation, state.local_stream.clone()))
            } else {
                None
            }
        };
        let Some((generation, local_stream)) = current else {
            tracing::debug!("Ignoring offer for unknown call {}", message.call_id);
            return;
        };

        let offer: SessionDescription = match message.payload() {
            Ok(offer) => offer,
            Err(e) => {
                inner.fail(invalid_payload("offer", e), "offer");
                return;
            }
        };

        let existing = inner.peers.get(from).filter(|n| n.generation == generation);
        let negotiation = match existing {
            Some(negotiation) => negotiation,
            None => match inner
                .peers
                .create(from, local_stream.as_ref(), generation)
                .await
            {
                Ok(negotiation) => negotiation,
                Err(NegotiationError::Superseded) => {
                    tracing::debug!("Offer from {} belongs to an ended call", from);
                    return;
                }
                Err(e) => {
                    self.negotiation_failed(e, "offer", generation).await;
                    return;
                }
            },
        };

        if !inner.is_current(generation) {
            inner.peers.discard(&negotiation).await;
            return;
        }

        let connection = negotiation.connection();
        let answer = async {
            connection.set_remote_description(offer).await?;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok::<_, NegotiationError>(answer)
        }
        .await;

        match answer {
            Ok(answer) if inner.is_current(generation) => {
                inner.send(
                    inner
                        .message(SignalType::Answer, &message.call_id)
                        .to(from)
                        .with_data(&answer),
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.negotiation_failed(e, "offer", generation).await;
            }
        }
    }

    async fn on_answer(&self, message: SignalingMessage) {
        let inner = &self.inner;

        let generation = {
            let state = inner.state.lock();
            if !state.is_call(&message.call_id) {
                return;
            }
            state.generation
        };
        let Some(negotiation) = inner.peers.get(&message.from_user_id) else {
            tracing::debug!("Ignoring answer from unknown peer {}", message.from_user_id);
            return;
        };

        let answer: SessionDescription = match message.payload() {
            Ok(answer) => answer,
            Err(e) => {
                inner.fail(invalid_payload("answer", e), "answer");
                return;
            }
        };

        if let Err(e) = negotiation.connection().set_remote_description(answer).await {
            self.negotiation_failed(e, "answer", generation).await;
        }
    }

    async fn on_ice_candidate(&self, message: SignalingMessage) {
        let inner = &self.inner;

        if !inner.state.lock().is_call(&message.call_id) {
            return;
        }
        // Kandidaten ohne Negotiation werden verworfen, nicht gepuffert
        let Some(negotiation) = inner.peers.get(&message.from_user_id) else {
            tracing::debug!(
                "Dropping ICE candidate from unknown peer {}",
                message.from_user_id
            );
            return;
        };

        let candidate: IceCandidate = match message.payload() {
            Ok(candidate) => candidate,
            Err(e) => {
                inner.fail(invalid_payload("ice candidate", e), "ice_candidate");
                return;
            }
        };

        if let Err(e) = negotiation.connection().add_ice_candidate(candidate).await {
            inner.fail(e.into(), "ice_candidate");
        }
    }

    fn on_participant_update(&self, message: SignalingMessage) {
        let inner = &self.inner;
        let update: ParticipantUpdate = match message.payload() {
            Ok(update) => update,
            Err(e) => {
                tracing::debug!("Ignoring malformed participant update: {}", e);
                return;
            }
        };

        let updated = {
            let mut state = inner.state.lock();
            if !state.is_call(&message.call_id) {
                return;
            }
            state.participant_mut(&message.from_user_id).map(|p| {
                p.apply(&update);
                p.clone()
            })
        };

        if let Some(participant) = updated {
            inner.emit(CallEvent::ParticipantUpdated(participant));
        }
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn handle_peer_event(&self, event: PeerEvent) {
        let inner = &self.inner;
        if !inner.peers.record(&event) {
            tracing::debug!("Dropping stale event from {}", event.user_id);
            return;
        }

        let call_id = {
            let state = inner.state.lock();
            if state.generation != event.generation {
                return;
            }
            state.session.call_id.clone()
        };
        let Some(call_id) = call_id else { return };

        match event.kind {
            PeerEventKind::IceCandidate(candidate) => {
                inner.send(
                    inner
                        .message(SignalType::IceCandidate, &call_id)
                        .to(&event.user_id)
                        .with_data(&candidate),
                );
            }
            PeerEventKind::TrackReceived { stream_id, track } => {
                let stream = {
                    let mut state = inner.state.lock();
                    let mut stream = state
                        .remote_streams
                        .remove(&event.user_id)
                        .filter(|s| s.id() == stream_id)
                        // Neuer Stream ersetzt den alten vollständig
                        .unwrap_or_else(|| MediaStream::with_id(stream_id, Vec::new()));
                    stream.add_track(track);
                    state
                        .remote_streams
                        .insert(event.user_id.clone(), stream.clone());
                    stream
                };
                tracing::info!("Remote stream {} from {}", stream.id(), event.user_id);
                inner.emit(CallEvent::RemoteStream {
                    user_id: event.user_id,
                    stream,
                });
            }
            PeerEventKind::ConnectionStateChanged(connection_state) => {
                tracing::info!(
                    "Peer connection state for {}: {:?}",
                    event.user_id,
                    connection_state
                );
                if connection_state.is_lost() {
                    self.drop_participant(&event.user_id).await;
                }
            }
            PeerEventKind::IceConnectionStateChanged(ice_state) => {
                tracing::debug!("ICE state for {}: {:?}", event.user_id, ice_state);
                if ice_state == IceConnectionState::Failed {
                    inner.fail(
                        RawError::from_message(format!(
                            "ICE connection failed for {}",
                            event.user_id
                        )),
                        "ice_connection",
                    );
                }
            }
        }
    }

    /// Entfernt einen Teilnehmer, dessen Negotiation verloren ist
    async fn drop_participant(&self, user_id: &str) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            state.participants.retain(|p| p.user_id != user_id);
            state.remote_streams.remove(user_id);
        }
        inner.peers.close_and_remove(user_id).await;
        tracing::info!("Participant {} left", user_id);
        inner.emit(CallEvent::ParticipantLeft {
            user_id: user_id.to_string(),
        });
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Beschafft lokale Medien mit einmaliger Recovery
    async fn acquire_media(
        &self,
        media: LocalMediaState,
        context: &str,
        generation: u64,
    ) -> Result<MediaStream, CallError> {
        let inner = &self.inner;
        let constraints = MediaConstraints::new(media.video, media.audio);

        let error = match inner.media.get_user_media(&constraints).await {
            Ok(stream) => return self.adopt_stream(stream, media, generation),
            Err(e) => inner.fail(e.into(), context),
        };

        if !inner.is_current(generation) {
            return Err(CallError::Superseded);
        }

        let outcome = inner
            .errors
            .attempt_recovery(&error, || inner.media.get_user_media(&constraints))
            .await;

        match outcome {
            RecoveryOutcome::Recovered(stream) => self.adopt_stream(stream, media, generation),
            RecoveryOutcome::NotAttempted => Err(CallError::Failed(error)),
            RecoveryOutcome::Failed(retry_error) => {
                inner.surface(&retry_error);
                Err(CallError::Failed(retry_error))
            }
        }
    }

    /// Übernimmt einen Stream, sofern der Anruf noch aktuell ist
    fn adopt_stream(
        &self,
        stream: MediaStream,
        media: LocalMediaState,
        generation: u64,
    ) -> Result<MediaStream, CallError> {
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            drop(state);
            stream.stop();
            return Err(CallError::Superseded);
        }

        stream.video_tracks().for_each(|t| t.set_enabled(media.video));
        stream.audio_tracks().for_each(|t| t.set_enabled(media.audio));
        state.local_stream = Some(stream.clone());
        Ok(stream)
    }

    /// Erstellt das Offer und sendet es; ein Fehler wird einmal wiederholt
    ///
    /// Scheitert auch die Wiederholung ohne fatalen Fehler, bleibt der Anruf in
    /// `Initiating`, bis er beendet wird oder der Angerufene antwortet.
    async fn negotiate_offer(
        &self,
        negotiation: &Arc<PeerNegotiation>,
        call_id: &str,
        generation: u64,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let Err(e) = self.send_offer(negotiation, call_id, generation).await else {
            return Ok(());
        };

        let error = self.negotiation_failed(e, "offer", generation).await;
        if error.is_fatal() || !inner.is_current(generation) {
            return Err(CallError::Failed(error));
        }

        let outcome = inner
            .errors
            .attempt_recovery(&error, || self.send_offer(negotiation, call_id, generation))
            .await;

        match outcome {
            RecoveryOutcome::Recovered(()) => Ok(()),
            RecoveryOutcome::NotAttempted => Err(CallError::Failed(error)),
            RecoveryOutcome::Failed(retry_error) => {
                inner.surface(&retry_error);
                Err(CallError::Failed(retry_error))
            }
        }
    }

    async fn send_offer(
        &self,
        negotiation: &PeerNegotiation,
        call_id: &str,
        generation: u64,
    ) -> Result<(), NegotiationError> {
        let connection = negotiation.connection();
        let offer = connection.create_offer(OfferOptions::default()).await?;
        connection.set_local_description(offer.clone()).await?;

        if self.inner.is_current(generation) {
            self.inner.send(
                self.inner
                    .message(SignalType::Offer, call_id)
                    .to(&negotiation.user_id)
                    .with_data(&offer),
            );
        }
        Ok(())
    }

    /// Meldet einen Negotiation-Fehler; fatale Fehler beenden den Anruf
    async fn negotiation_failed(
        &self,
        e: NegotiationError,
        context: &str,
        generation: u64,
    ) -> WebRtcError {
        let error = self.inner.fail(e.into(), context);
        self.end_if_fatal(&error, generation).await;
        error
    }

    async fn end_if_fatal(&self, error: &WebRtcError, generation: u64) {
        if error.is_fatal() && self.inner.is_current(generation) {
            tracing::error!("Fatal error {}, ending call", error.code);
            self.end_call().await;
        }
    }

    fn send_reject(&self, call_id: &str, to: Option<&str>) {
        let mut reject = self.inner.message(SignalType::CallReject, call_id);
        if let Some(to) = to {
            reject = reject.to(to);
        }
        self.inner.send(reject);
    }

    /// Genau ein `participant-update` pro Änderung, sofern ein Anruf besteht
    fn broadcast_update(&self, call_id: Option<String>, update: ParticipantUpdate) {
        if let Some(call_id) = call_id {
            self.inner.send(
                self.inner
                    .message(SignalType::ParticipantUpdate, &call_id)
                    .with_data(&update),
            );
        }
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("local_user_id", &self.inner.local_user_id)
            .field("session", &self.session())
            .field("peers", &self.inner.peers)
            .finish()
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Verarbeitet eingehende Nachrichten strikt nacheinander
async fn dispatch_inbox(inner: Weak<Inner>, mut inbox: mpsc::UnboundedReceiver<SignalingMessage>) {
    while let Some(message) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        CallController { inner }
            .handle_signaling_message(message)
            .await;
    }
}

async fn pump_peer_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        CallController { inner }.handle_peer_event(event).await;
    }
}

fn new_call_id() -> String {
    format!(
        "call-{}-{}",
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().simple().to_string()[..9]
    )
}

fn invalid_payload(what: &str, e: serde_json::Error) -> RawError {
    RawError::new("OperationError", format!("Invalid RTC {} payload: {}", what, e))
}

// ============================================================================
// TESTS
// ============================================================================
