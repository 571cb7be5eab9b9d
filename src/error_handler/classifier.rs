//! Fehler-Klassifizierung
//!
//! Ordnet rohe Fehler aus Media-, Negotiation- und Signaling-Operationen
//! einem festen, geordneten Regelwerk zu. `classify` ist rein: gleiche
//! Eingabe ergibt immer denselben Code, dieselbe Severity und dasselbe
//! Recoverable-Flag.

use serde::Serialize;
use std::fmt;

// ============================================================================
// RAW ERROR
// ============================================================================

/// Neutrale Form eines Fehlers, wie ihn der Classifier sieht
///
/// `name` entspricht der Fehler-Identität (z.B. `NotAllowedError`),
/// `message` dem menschenlesbaren Text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawError {
    pub name: Option<String>,
    pub message: String,
}

impl RawError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<String> for RawError {
    fn from(message: String) -> Self {
        Self::from_message(message)
    }
}

impl From<&str> for RawError {
    fn from(message: &str) -> Self {
        Self::from_message(message)
    }
}

// ============================================================================
// CLASSIFIED ERROR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MediaPermissionDenied,
    MediaDeviceNotFound,
    MediaDeviceInUse,
    IceConnectionFailed,
    StunTurnError,
    SignalingError,
    EnvironmentNotSupported,
    WebrtcGenericError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MediaPermissionDenied => "MEDIA_PERMISSION_DENIED",
            ErrorCode::MediaDeviceNotFound => "MEDIA_DEVICE_NOT_FOUND",
            ErrorCode::MediaDeviceInUse => "MEDIA_DEVICE_IN_USE",
            ErrorCode::IceConnectionFailed => "ICE_CONNECTION_FAILED",
            ErrorCode::StunTurnError => "STUN_TURN_ERROR",
            ErrorCode::SignalingError => "SIGNALING_ERROR",
            ErrorCode::EnvironmentNotSupported => "ENVIRONMENT_NOT_SUPPORTED",
            ErrorCode::WebrtcGenericError => "WEBRTC_GENERIC_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Klassifizierter Fehler mit Anzeige-Text und Handlungsempfehlungen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub recoverable: bool,
    pub user_message: String,
    pub technical_details: String,
    pub suggested_actions: Vec<String>,
}

impl WebRtcError {
    /// Fatale Fehler beenden einen laufenden Anruf
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Critical && !self.recoverable
    }
}

impl fmt::Display for WebRtcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.user_message)
    }
}

impl std::error::Error for WebRtcError {}

// ============================================================================
// RULES
// ============================================================================

struct Rule {
    code: ErrorCode,
    names: &'static [&'static str],
    needles: &'static [&'static str],
    contexts: &'static [&'static str],
    severity: Severity,
    recoverable: bool,
    user_message: &'static str,
    technical_prefix: Option<&'static str>,
    actions: &'static [&'static str],
}

impl Rule {
    fn matches(&self, raw: &RawError, context: Option<&str>) -> bool {
        let by_name = raw
            .name
            .as_deref()
            .is_some_and(|name| self.names.contains(&name));
        let by_message = self.needles.iter().any(|n| raw.message.contains(n));
        let by_context = context.is_some_and(|c| self.contexts.contains(&c));
        by_name || by_message || by_context
    }
}

// Reihenfolge ist relevant: die erste passende Regel gewinnt.
const RULES: &[Rule] = &[
    Rule {
        code: ErrorCode::MediaPermissionDenied,
        names: &["NotAllowedError"],
        needles: &["Permission denied"],
        contexts: &[],
        severity: Severity::High,
        recoverable: true,
        user_message:
            "Camera and microphone access was denied. Please allow access and try again.",
        technical_prefix: None,
        actions: &[
            "Open the system privacy settings for camera and microphone",
            "Allow access for this application",
            "Try again",
        ],
    },
    Rule {
        code: ErrorCode::MediaDeviceNotFound,
        names: &["NotFoundError"],
        needles: &["Requested device not found"],
        contexts: &[],
        severity: Severity::Medium,
        recoverable: true,
        user_message: "Camera or microphone not found. Please check your devices.",
        technical_prefix: None,
        actions: &[
            "Check that your camera and microphone are connected",
            "Try again",
            "Check device settings in your operating system",
        ],
    },
    Rule {
        code: ErrorCode::MediaDeviceInUse,
        names: &["NotReadableError"],
        needles: &["Could not start video source"],
        contexts: &[],
        severity: Severity::Medium,
        recoverable: true,
        user_message: "Your camera or microphone is being used by another application.",
        technical_prefix: None,
        actions: &[
            "Close other applications that might be using your camera/microphone",
            "Try again",
            "Restart the application",
        ],
    },
    Rule {
        code: ErrorCode::IceConnectionFailed,
        names: &[],
        needles: &["ICE", "connection failed"],
        contexts: &[],
        severity: Severity::High,
        recoverable: true,
        user_message: "Connection failed. This might be due to network restrictions.",
        technical_prefix: Some("ICE Connection Error"),
        actions: &[
            "Check your internet connection",
            "Try connecting from a different network",
            "Contact your network administrator if on a corporate network",
        ],
    },
    Rule {
        code: ErrorCode::StunTurnError,
        names: &[],
        needles: &["STUN", "TURN"],
        contexts: &[],
        severity: Severity::Medium,
        recoverable: true,
        user_message: "Network configuration issue. Connection may be unstable.",
        technical_prefix: Some("STUN/TURN Error"),
        actions: &[
            "Try again in a few moments",
            "Check your firewall settings",
            "Try connecting from a different network",
        ],
    },
    Rule {
        code: ErrorCode::SignalingError,
        names: &[],
        needles: &["signaling", "websocket"],
        contexts: &[],
        severity: Severity::High,
        recoverable: true,
        user_message: "Connection to the server failed. Please try again.",
        technical_prefix: Some("Signaling Error"),
        actions: &[
            "Check your internet connection",
            "Reconnect to the document",
            "Try again in a few moments",
        ],
    },
    Rule {
        code: ErrorCode::EnvironmentNotSupported,
        names: &["NotSupportedError"],
        needles: &["not supported"],
        contexts: &[],
        severity: Severity::Critical,
        recoverable: false,
        user_message: "This environment does not support video calling.",
        technical_prefix: Some("Environment Compatibility"),
        actions: &[
            "Update the application to the latest version",
            "Use a platform with camera and network support",
            "Check that media capture is enabled for this application",
        ],
    },
    Rule {
        code: ErrorCode::WebrtcGenericError,
        names: &[],
        needles: &["peer", "RTC"],
        contexts: &["webrtc"],
        severity: Severity::Medium,
        recoverable: true,
        user_message: "A connection error occurred. Please try again.",
        technical_prefix: Some("WebRTC Error"),
        actions: &[
            "Try ending and starting the call again",
            "Reconnect to the document",
            "Check your internet connection",
        ],
    },
];

const UNKNOWN: Rule = Rule {
    code: ErrorCode::UnknownError,
    names: &[],
    needles: &[],
    contexts: &[],
    severity: Severity::Medium,
    recoverable: true,
    user_message: "An unexpected error occurred. Please try again.",
    technical_prefix: Some("Unknown Error"),
    actions: &[
        "Try again",
        "Check your internet connection",
        "Contact support if the problem persists",
    ],
};

/// Klassifiziert einen rohen Fehler
pub fn classify(raw: &RawError, context: Option<&str>) -> WebRtcError {
    let message = if raw.message.is_empty() {
        "Unknown error".to_string()
    } else {
        raw.message.clone()
    };

    let rule = RULES
        .iter()
        .find(|rule| rule.matches(raw, context))
        .unwrap_or(&UNKNOWN);

    let technical_details = match rule.technical_prefix {
        Some(prefix) => format!("{}: {}", prefix, message),
        None => format!(
            "{}: {}",
            raw.name.as_deref().unwrap_or("UnknownError"),
            message
        ),
    };

    WebRtcError {
        code: rule.code,
        message,
        severity: rule.severity,
        recoverable: rule.recoverable,
        user_message: rule.user_message.to_string(),
        technical_details,
        suggested_actions: rule.actions.iter().map(|a| a.to_string()).collect(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
