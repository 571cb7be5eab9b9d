//! Error Handler - Historie und automatische Wiederherstellung

use super::classifier::{classify, ErrorCode, RawError, Severity, WebRtcError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

/// Standard-Kapazität der Fehler-Historie
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Anzahl Einträge im Diagnose-Report
const REPORT_HISTORY_LEN: usize = 10;

// ============================================================================
// RECOVERY POLICY
// ============================================================================

/// Wartezeiten vor dem einmaligen Retry, je Fehlerklasse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    #[serde(with = "millis")]
    pub device_delay: Duration,
    #[serde(with = "millis")]
    pub connectivity_delay: Duration,
    #[serde(with = "millis")]
    pub signaling_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            device_delay: Duration::from_secs(2),
            connectivity_delay: Duration::from_secs(5),
            signaling_delay: Duration::from_secs(3),
        }
    }
}

impl RecoveryPolicy {
    /// Gibt die Wartezeit zurück, oder `None` wenn kein automatischer Retry möglich ist
    pub fn delay_for(&self, code: ErrorCode) -> Option<Duration> {
        match code {
            ErrorCode::MediaDeviceNotFound | ErrorCode::MediaDeviceInUse => Some(self.device_delay),
            ErrorCode::IceConnectionFailed | ErrorCode::StunTurnError => {
                Some(self.connectivity_delay)
            }
            ErrorCode::SignalingError => Some(self.signaling_delay),
            // Permission-Denial braucht den Benutzer
            _ => None,
        }
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Ergebnis eines Wiederherstellungsversuchs
#[derive(Debug)]
pub enum RecoveryOutcome<T> {
    /// Retry war erfolgreich
    Recovered(T),
    /// Fehler ist nicht automatisch behebbar
    NotAttempted,
    /// Retry ist erneut fehlgeschlagen
    Failed(WebRtcError),
}

impl<T> RecoveryOutcome<T> {
    pub fn is_recovered(&self) -> bool {
        matches!(self, RecoveryOutcome::Recovered(_))
    }
}

// ============================================================================
// HISTORY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub context: Option<String>,
    pub error: WebRtcError,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport<'a> {
    timestamp: DateTime<Utc>,
    crate_version: &'static str,
    os: &'static str,
    arch: &'static str,
    error_history: Vec<&'a HistoryEntry>,
}

// ============================================================================
// ERROR HANDLER
// ============================================================================

/// Klassifiziert Fehler, führt eine begrenzte Historie und versucht einmalige Recovery
#[derive(Debug)]
pub struct ErrorHandler {
    history: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    policy: RecoveryPolicy,
}

impl ErrorHandler {
    pub fn new(capacity: usize, policy: RecoveryPolicy) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
        }
    }

    /// Klassifiziert, loggt und speichert den Fehler in der Historie
    pub fn handle(&self, raw: &RawError, context: Option<&str>) -> WebRtcError {
        let error = classify(raw, context);
        self.log(&error);

        let mut history = self.history.lock();
        history.push_front(HistoryEntry {
            at: Utc::now(),
            context: context.map(str::to_string),
            error: error.clone(),
        });
        history.truncate(self.capacity);

        error
    }

    /// Historie, neuester Eintrag zuerst
    pub fn history(&self) -> Vec<WebRtcError> {
        self.history.lock().iter().map(|e| e.error.clone()).collect()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Handlungsempfehlungen des letzten Fehlers mit diesem Code
    pub fn recovery_actions(&self, code: ErrorCode) -> Vec<String> {
        self.history
            .lock()
            .iter()
            .find(|e| e.error.code == code)
            .map(|e| e.error.suggested_actions.clone())
            .unwrap_or_default()
    }

    /// Versucht einmalig, die fehlgeschlagene Operation zu wiederholen
    ///
    /// Kein Backoff: wer mehrere Versuche braucht, muss erneut aufrufen.
    pub async fn attempt_recovery<T, E, F, Fut>(
        &self,
        error: &WebRtcError,
        retry: F,
    ) -> RecoveryOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawError>,
    {
        if !error.recoverable {
            return RecoveryOutcome::NotAttempted;
        }

        let Some(delay) = self.policy.delay_for(error.code) else {
            return RecoveryOutcome::NotAttempted;
        };

        tracing::info!(
            "Attempting recovery for {} in {}ms",
            error.code,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;

        match retry().await {
            Ok(value) => {
                tracing::info!("Recovery for {} succeeded", error.code);
                RecoveryOutcome::Recovered(value)
            }
            Err(e) => {
                let raw: RawError = e.into();
                RecoveryOutcome::Failed(self.handle(&raw, Some("recovery_attempt")))
            }
        }
    }

    /// JSON-Report für Debugging
    pub fn report(&self) -> String {
        let history = self.history.lock();
        let report = ErrorReport {
            timestamp: Utc::now(),
            crate_version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            error_history: history.iter().take(REPORT_HISTORY_LEN).collect(),
        };
        serde_json::to_string_pretty(&report).unwrap_or_default()
    }

    fn log(&self, error: &WebRtcError) {
        match error.severity {
            Severity::Critical | Severity::High => {
                tracing::error!(
                    "[WebRTC Error] {}: {} ({})",
                    error.code,
                    error.user_message,
                    error.technical_details
                );
            }
            Severity::Medium => {
                tracing::warn!(
                    "[WebRTC Error] {}: {} ({})",
                    error.code,
                    error.user_message,
                    error.technical_details
                );
            }
            Severity::Low => {
                tracing::info!(
                    "[WebRTC Error] {}: {} ({})",
                    error.code,
                    error.user_message,
                    error.technical_details
                );
            }
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, RecoveryPolicy::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
