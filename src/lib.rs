//! Collab Call - Echtzeit-Anrufe für kollaborative Dokumente
//!
//! Audio/Video-Anrufe zwischen Teilnehmern eines Dokuments mit:
//! - WebSocket-Relay als Signaling-Kanal (Dokument-Räume)
//! - WebRTC Peer Connections pro Teilnehmer
//! - Klassifizierung und Recovery von Medien-, ICE- und Signaling-Fehlern

pub mod call_engine;
pub mod config;
pub mod error_handler;
pub mod session;
pub mod signaling;

pub use call_engine::{CallController, CallError, CallEvent, CallPhase, WebRtcConnector};
pub use config::CallConfig;
pub use error_handler::{ErrorHandler, WebRtcError};
pub use session::CollaborationSession;
pub use signaling::SignalingClient;

use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den globalen tracing Subscriber
///
/// `RUST_LOG` hat Vorrang; zusätzlich gelten `collab_call=debug` und `webrtc=warn`.
/// Ein bereits installierter Subscriber bleibt bestehen.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["collab_call=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Initializing Collab Call...");
    }
}
