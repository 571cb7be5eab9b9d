//! WebRTC Negotiation-Backend auf Basis von webrtc-rs
//!
//! Implementiert [`PeerConnector`] und [`PeerConnection`]. Die Samples der lokalen
//! Tracks schreibt die Capture-Pipeline über [`RtcPeer::local_track`].

use super::media::{MediaTrack, TrackKind};
use super::negotiation::{
    ConnectionState, IceConnectionState, NegotiationError, OfferOptions, PeerConnection,
    PeerConnector, PeerEventKind, PeerEvents, TrackSender,
};
use crate::config::{IceConfig, TransportPolicy};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn rtc_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Rtc(e.to_string())
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::InvalidDescription(
                "rollback is not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::InvalidDescription(
                "unspecified description type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// Lokaler RTP-Track für einen Capture-Track
fn local_sample_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    let mime_type = match track.kind() {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        track.id().to_owned(),
        stream_id.to_owned(),
    ))
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Erstellt webrtc-rs Peer Connections mit der konfigurierten ICE-Konfiguration
pub struct WebRtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcConnector {
    pub fn new(ice: &IceConfig) -> Result<Self, NegotiationError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice
                .servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: match ice.transport_policy {
                TransportPolicy::All => RTCIceTransportPolicy::All,
                TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ice_candidate_pool_size: ice.candidate_pool_size,
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(rtc_error)?,
        );

        register_handlers(&pc, events);
        Ok(Arc::new(RtcPeer {
            pc,
            local_tracks: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &RTCPeerConnection, events: PeerEvents) {
    // Connection State Handler
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state for {}: {}", state_events.user_id(), s);
        state_events.emit(PeerEventKind::ConnectionStateChanged(connection_state(s)));
        Box::pin(async {})
    }));

    let ice_events = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        ice_events.emit(PeerEventKind::IceConnectionStateChanged(
            ice_connection_state(s),
        ));
        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_events.emit(PeerEventKind::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_m_line_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (eingehende Medien)
    pc.on_track(Box::new(move |track, _, _| {
        let events = events.clone();
        Box::pin(async move {
            let Some(kind) = track_kind(track.kind()) else {
                return;
            };
            let media = MediaTrack::with_id(track.id(), kind, format!("remote-{:?}", kind));
            tracing::info!("Received {:?} track from {}", kind, events.user_id());
            events.emit(PeerEventKind::TrackReceived {
                stream_id: track.stream_id(),
                track: media.clone(),
            });

            // RTP lesen bis der Track endet; Rendering liegt ausserhalb
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                media.stop();
            });
        })
    }));
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

type LocalTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    local_tracks: LocalTracks,
}

impl RtcPeer {
    /// RTP-Track, in den die Capture-Pipeline für `track_id` schreibt
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }

    /// Fügt Empfangs-Transceiver für fehlende Medienarten hinzu
    async fn ensure_receivers(&self, options: OfferOptions) -> Result<(), NegotiationError> {
        let transceivers = self.pc.get_transceivers().await;
        let wanted = [
            (RTPCodecType::Audio, options.receive_audio),
            (RTPCodecType::Video, options.receive_video),
        ];

        for (kind, wanted) in wanted {
            if !wanted || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(rtc_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), NegotiationError> {
        let local = local_sample_track(track, stream_id);
        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;
        self.local_tracks.lock().insert(track.id().to_owned(), local);
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_receivers(options).await?;
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(rtc_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| NegotiationError::IceFailed(e.to_string()))
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.pc
            .get_senders()
            .await
            .into_iter()
            .map(|sender| {
                Arc::new(RtcSender {
                    sender,
                    local_tracks: Arc::clone(&self.local_tracks),
                }) as Arc<dyn TrackSender>
            })
            .collect()
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.local_tracks.lock().clear();
        self.pc.close().await.map_err(rtc_error)
    }
}

struct RtcSender {
    sender: Arc<RTCRtpSender>,
    local_tracks: LocalTracks,
}

#[async_trait]
impl TrackSender for RtcSender {
    async fn kind(&self) -> Option<TrackKind> {
        let track = self.sender.track().await?;
        track_kind(track.kind())
    }

    async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<(), NegotiationError> {
        let local = match (track, self.sender.track().await) {
            (Some(track), Some(current)) => {
                if codec_type(track.kind()) != current.kind() {
                    return Err(NegotiationError::ReplaceTrack(format!(
                        "cannot replace {} track with {:?}",
                        current.kind(),
                        track.kind()
                    )));
                }
                let local = local_sample_track(track, current.stream_id());
                self.local_tracks
                    .lock()
                    .insert(track.id().to_owned(), Arc::clone(&local));
                Some(local as Arc<dyn TrackLocal + Send + Sync>)
            }
            (Some(track), None) => {
                let local = local_sample_track(track, track.id());
                self.local_tracks
                    .lock()
                    .insert(track.id().to_owned(), Arc::clone(&local));
                Some(local as Arc<dyn TrackLocal + Send + Sync>)
            }
            (None, _) => None,
        };

        self.sender
            .replace_track(local)
            .await
            .map_err(|e| NegotiationError::ReplaceTrack(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
