//! Negotiation-Primitive: Offer/Answer, ICE und Sender pro Peer
//!
//! Die konkrete Implementierung (webrtc-rs oder Test-Fakes) sitzt hinter
//! [`PeerConnector`] und [`PeerConnection`].

use super::media::{MediaTrack, TrackKind};
use crate::error_handler::RawError;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("RTCPeerConnection error: {0}")]
    Rtc(String),

    #[error("ICE connection failed: {0}")]
    IceFailed(String),

    #[error("Invalid RTC session description: {0}")]
    InvalidDescription(String),

    #[error("RTC sender rejected track: {0}")]
    ReplaceTrack(String),

    #[error("peer connection closed")]
    Closed,

    /// Gehört zu einem bereits beendeten Anruf
    #[error("negotiation superseded by a newer call")]
    Superseded,
}

impl From<NegotiationError> for RawError {
    fn from(e: NegotiationError) -> Self {
        RawError::new("OperationError", e.to_string())
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Zustände, in denen der Teilnehmer als verloren gilt
    pub fn is_lost(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

// ============================================================================
// PEER EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Lokal entdeckter ICE-Kandidat
    IceCandidate(IceCandidate),
    /// Entfernter Track eingetroffen
    TrackReceived { stream_id: String, track: MediaTrack },
    ConnectionStateChanged(ConnectionState),
    IceConnectionStateChanged(IceConnectionState),
}

/// Event einer Negotiation, markiert mit Benutzer und Call-Generation
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub user_id: String,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Rückkanal einer Negotiation zum Manager
#[derive(Debug, Clone)]
pub struct PeerEvents {
    user_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEvents {
    pub fn new(
        user_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            generation,
            tx,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let _ = self.tx.send(PeerEvent {
            user_id: self.user_id.clone(),
            generation: self.generation,
            kind,
        });
    }
}

// ============================================================================
// NEGOTIATION PRIMITIVE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Erstellt Negotiation-Objekte
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEvents) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Eine Negotiation mit genau einem entfernten Peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), NegotiationError>;

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>>;

    /// Gibt alle Ressourcen frei; weitere Aufrufe schlagen fehl
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Ausgehender Sender einer Negotiation
#[async_trait]
pub trait TrackSender: Send + Sync {
    /// Art des aktuell gesendeten Tracks
    async fn kind(&self) -> Option<TrackKind>;

    async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<(), NegotiationError>;
}
