//! Error Handler Module - Klassifizierung und Recovery
//!
//! Dieses Modul verwaltet:
//! - Zuordnung roher Fehler zu typisierten `WebRtcError`s
//! - Begrenzte Fehler-Historie
//! - Einmaliger Retry mit fester Wartezeit je Fehlerklasse

mod classifier;
mod handler;

pub use classifier::{classify, ErrorCode, RawError, Severity, WebRtcError};
pub use handler::{
    ErrorHandler, HistoryEntry, RecoveryOutcome, RecoveryPolicy, DEFAULT_HISTORY_CAPACITY,
};

pub(crate) use handler::millis;
