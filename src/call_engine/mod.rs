//! Call Engine Module - Anrufsteuerung und WebRTC
//!
//! Dieses Modul verwaltet:
//! - Den Lebenszyklus eines Anrufs (Idle, Initiating, Receiving, InCall)
//! - Eine Negotiation pro entferntem Teilnehmer
//! - Lokale Medien (Kamera, Mikrofon, Bildschirmfreigabe)
//! - Das webrtc-rs Backend

mod controller;
mod media;
mod negotiation;
mod peers;
mod rtc;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{CallController, CallError, CallEvent};
pub use media::{
    AudioConstraints, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack,
    TrackKind, VideoConstraints,
};
pub use negotiation::{
    ConnectionState, IceConnectionState, NegotiationError, OfferOptions, PeerConnection,
    PeerConnector, PeerEvent, PeerEventKind, PeerEvents, TrackSender,
};
pub use peers::{PeerConnectionManager, PeerNegotiation};
pub use rtc::{RtcPeer, WebRtcConnector};
pub use session::{
    format_call_duration, CallPhase, CallSession, LocalMediaState, Participant,
};
