//! Device facade: uniform, non-blocking operations on mount, camera and
//! focuser. Motion and exposure completion is always observed by polling
//! a telemetry snapshot on the next tick, never by callback.
//!
//! These traits are the device-abstraction boundary; the wire protocol
//! implementation behind them lives outside this crate.

use std::path::PathBuf;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMotionStatus {
    Idle,
    Moving,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnCoordSetAction {
    Track,
    Slew,
    Sync,
}

/// `(hours, degrees)` equatorial position as reported by the mount, JNow
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MountTelemetry {
    pub ra_hours: f64,
    pub dec_deg: f64,
    pub status: MountMotionStatus,
}

pub trait Mount: Send + Sync {
    fn telemetry(&self) -> Result<MountTelemetry, EngineError>;
    fn set_on_coord_set(&self, action: OnCoordSetAction) -> Result<(), EngineError>;
    fn slew_j_now(&self, ra_hours: f64, dec_deg: f64) -> Result<(), EngineError>;
    fn sync_j_now(&self, ra_hours: f64, dec_deg: f64) -> Result<(), EngineError>;
    fn abort_motion(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraTelemetry {
    pub capture_end: bool,
    pub exposing: bool,
}

pub trait Camera: Send + Sync {
    fn start_exposure(&self, seconds: f64) -> Result<(), EngineError>;
    fn abort_exposure(&self) -> Result<(), EngineError>;
    fn reset_frame(&self) -> Result<(), EngineError>;
    fn set_roi(&self, x: u32, y: u32, w: u32, h: u32) -> Result<(), EngineError>;
    fn telemetry(&self) -> Result<CameraTelemetry, EngineError>;
    /// Path to the most recently completed FITS frame. Only meaningful once
    /// `telemetry().capture_end` is true.
    fn last_image_path(&self) -> Result<PathBuf, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocuserRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocuserTelemetry {
    pub position: i32,
    pub moving: bool,
}

pub trait Focuser: Send + Sync {
    fn position_range(&self) -> Result<FocuserRange, EngineError>;
    fn telemetry(&self) -> Result<FocuserTelemetry, EngineError>;
    fn set_direction(&self, inward: bool) -> Result<(), EngineError>;
    fn move_relative(&self, steps: i32) -> Result<(), EngineError>;
    fn move_absolute(&self, position: i32) -> Result<(), EngineError>;
    fn abort(&self) -> Result<(), EngineError>;
}

/// Move-distance-derived timeout policy shared by focuser and mount moves.
pub fn move_timeout_s(distance_steps: i32, seconds_per_10_steps: f64, cap_s: f64) -> f64 {
    (distance_steps.unsigned_abs() as f64 / 10.0 * seconds_per_10_steps).min(cap_s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_timeout_scales_with_distance_and_is_capped() {
        assert!((move_timeout_s(100, 1.0, 300.0) - 10.0).abs() < 1e-9);
        assert_eq!(move_timeout_s(100_000, 1.0, 300.0), 300.0);
    }
}
