//! Call-Session Datenmodell

use crate::error_handler::WebRtcError;
use crate::signaling::ParticipantUpdate;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Phase des aktuellen Anrufs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallPhase {
    /// Kein Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf, Negotiation läuft
    Initiating,
    /// Eingehender Anruf wartet auf Antwort
    Receiving,
    /// Anruf aktiv
    InCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMediaState {
    pub video: bool,
    pub audio: bool,
    pub screen_share: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            screen_share: false,
        }
    }
}

/// Der einzige aktive (oder fehlende) Anruf
///
/// `call_id` ist genau dann gesetzt, wenn `phase != Idle`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: Option<String>,
    pub phase: CallPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub local_media: LocalMediaState,
    pub last_error: Option<WebRtcError>,
}

impl CallSession {
    /// Zurück auf Idle; Medien-Präferenzen und letzter Fehler bleiben erhalten
    pub(crate) fn reset(&mut self) {
        self.call_id = None;
        self.phase = CallPhase::Idle;
        self.started_at = None;
        self.duration_seconds = 0;
        self.local_media.screen_share = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub is_video_enabled: bool,
    pub is_audio_enabled: bool,
    pub is_sharing_screen: bool,
}

impl Participant {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_video_enabled: true,
            is_audio_enabled: true,
            is_sharing_screen: false,
        }
    }

    pub fn from_local(user_id: impl Into<String>, media: &LocalMediaState) -> Self {
        Self {
            user_id: user_id.into(),
            is_video_enabled: media.video,
            is_audio_enabled: media.audio,
            is_sharing_screen: media.screen_share,
        }
    }

    /// Übernimmt nur die gesetzten Felder
    pub fn apply(&mut self, update: &ParticipantUpdate) {
        if let Some(video) = update.is_video_enabled {
            self.is_video_enabled = video;
        }
        if let Some(audio) = update.is_audio_enabled {
            self.is_audio_enabled = audio;
        }
        if let Some(screen) = update.is_sharing_screen {
            self.is_sharing_screen = screen;
        }
    }
}

/// Formatiert eine Anrufdauer als `m:ss` oder `h:mm:ss`
pub fn format_call_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}
