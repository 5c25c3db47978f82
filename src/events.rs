//! Outbound event stream: a single enum notified to every subscriber,
//! covering state changes, log messages, errors, and the two engines'
//! result payloads. Serialization to whatever wire format an operator
//! transport expects is out of scope; `Event` only needs `Clone` plus
//! `Serialize` for a host that wants to forward it as-is.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    AutoFocus,
    PolarAlign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    pub component: Component,
    pub state: String,
    pub message: String,
    pub percent: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOccurred {
    pub code: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoFocusCompleted {
    pub success: bool,
    pub best_position: f64,
    pub min_hfr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarGuideData {
    pub current_ra_deg: f64,
    pub current_dec_deg: f64,
    pub corners: [CornerCoord; 4],
    pub target_ra_deg: f64,
    pub target_dec_deg: f64,
    pub offset_east_deg: f64,
    pub offset_north_deg: f64,
    pub guide_text_ra: String,
    pub guide_text_dec: String,
    pub fake_pole_ra_deg: f64,
    pub fake_pole_dec_deg: f64,
    pub true_pole_ra_deg: f64,
    pub true_pole_dec_deg: f64,
    /// `(1 / (1 + (rms/mean)²)) · spreadGain` from the pole fit, `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StateChanged(StateChanged),
    LogMessage(LogMessage),
    ErrorOccurred(ErrorOccurred),
    AutoFocusCompleted(AutoFocusCompleted),
    PolarGuideData(PolarGuideData),
}

/// Notification sink both engines emit events through. A supervisor wires
/// up its own subscriber list behind this; engines only depend on the
/// trait.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: Event);
}

/// `EventSink` that just forwards every event to the `log` facade, useful
/// as a default when no operator transport is wired up (mirrors the
/// teacher's habit of logging the same things it notifies subscribers of).
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn notify(&self, event: Event) {
        match &event {
            Event::ErrorOccurred(e) => log::error!("{}: {}", e.code, e.text),
            Event::LogMessage(m) => match m.level {
                LogLevel::Debug => log::debug!("{}", m.text),
                LogLevel::Info => log::info!("{}", m.text),
                LogLevel::Warn => log::warn!("{}", m.text),
                LogLevel::Error => log::error!("{}", m.text),
            },
            other => log::debug!("{other:?}"),
        }
    }
}
