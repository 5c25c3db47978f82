//! Error taxonomy shared by both engines: one variant per failure kind,
//! a short `#[error("...")]` message, no blanket `From` impls beyond the
//! ones that are themselves error types.

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("plate solve failed: {0}")]
    SolveFailed(String),

    #[error("no stars found: {0}")]
    NoStarsFound(String),

    #[error("move timed out: {0}")]
    MoveTimeout(String),

    #[error("bad geometry: {0}")]
    BadGeometry(String),

    #[error("obstruction could not be avoided: {0}")]
    ObstructionFatal(String),

    #[error("cancelled by operator")]
    UserCancelled,

    #[error("engine is already running")]
    AlreadyRunning,
}

impl EngineError {
    /// Stable string code used in `ErrorOccurred` events, independent of the
    /// human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DeviceUnavailable(_) => "DeviceUnavailable",
            EngineError::CaptureFailed(_) => "CaptureFailed",
            EngineError::SolveFailed(_) => "SolveFailed",
            EngineError::NoStarsFound(_) => "NoStarsFound",
            EngineError::MoveTimeout(_) => "MoveTimeout",
            EngineError::BadGeometry(_) => "BadGeometry",
            EngineError::ObstructionFatal(_) => "ObstructionFatal",
            EngineError::UserCancelled => "UserCancelled",
            EngineError::AlreadyRunning => "AlreadyRunning",
        }
    }

    /// Fatal kinds abort the engine and transition it to `ERROR`/terminal
    /// state. `AlreadyRunning` is rejected inline by `start()` and never
    /// causes a state transition.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::AlreadyRunning)
    }
}
