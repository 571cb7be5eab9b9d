//! Signaling Module - WebSocket Client für den Collaboration-Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - WebSocket-Verbindung aufbauen, halten und wiederherstellen
//! - Call-Nachrichten in Relay-Frames übersetzen und senden
//! - Eingehende Frames normalisieren und an Handler weiterleiten
//!

mod client;
mod messages;

pub use client::{
    ConnectionStatus, SignalingClient, SignalingError, SignalingEvent, SignalingSink,
};
pub use messages::*;
