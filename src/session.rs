//! Session supervisor: owns the shared device handles and hands each
//! engine its own `Arc` clone, refusing to start a second engine while one
//! is already driving the same devices. A single atomic run lock keeps
//! the auto-focus and polar-alignment engines from stomping on each
//! other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::{Camera, Focuser, Mount};
use crate::error::EngineError;

pub struct SessionHandle {
    pub camera: Arc<dyn Camera>,
    pub focuser: Arc<dyn Focuser>,
    pub mount: Arc<dyn Mount>,
    busy: AtomicBool,
}

impl SessionHandle {
    pub fn new(camera: Arc<dyn Camera>, focuser: Arc<dyn Focuser>, mount: Arc<dyn Mount>) -> Self {
        Self { camera, focuser, mount, busy: AtomicBool::new(false) }
    }

    /// Claims exclusive use of the session's devices for one engine run.
    /// Returns a guard that releases the claim on drop, or
    /// `EngineError::AlreadyRunning` if another engine currently holds it.
    pub fn claim(self: &Arc<Self>) -> Result<SessionGuard, EngineError> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(EngineError::AlreadyRunning);
        }
        Ok(SessionGuard { session: Arc::clone(self) })
    }
}

pub struct SessionGuard {
    session: Arc<SessionHandle>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CameraTelemetry, FocuserRange, FocuserTelemetry, MountMotionStatus, MountTelemetry, OnCoordSetAction};
    use std::path::PathBuf;

    struct NullCamera;
    impl Camera for NullCamera {
        fn start_exposure(&self, _seconds: f64) -> Result<(), EngineError> {
            Ok(())
        }
        fn abort_exposure(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn reset_frame(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn set_roi(&self, _x: u32, _y: u32, _w: u32, _h: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn telemetry(&self) -> Result<CameraTelemetry, EngineError> {
            Ok(CameraTelemetry { capture_end: true, exposing: false })
        }
        fn last_image_path(&self) -> Result<PathBuf, EngineError> {
            Ok(PathBuf::from("/tmp/x.fits"))
        }
    }

    struct NullFocuser;
    impl Focuser for NullFocuser {
        fn position_range(&self) -> Result<FocuserRange, EngineError> {
            Ok(FocuserRange { min: 0, max: 1, step: 1 })
        }
        fn telemetry(&self) -> Result<FocuserTelemetry, EngineError> {
            Ok(FocuserTelemetry { position: 0, moving: false })
        }
        fn set_direction(&self, _inward: bool) -> Result<(), EngineError> {
            Ok(())
        }
        fn move_relative(&self, _steps: i32) -> Result<(), EngineError> {
            Ok(())
        }
        fn move_absolute(&self, _position: i32) -> Result<(), EngineError> {
            Ok(())
        }
        fn abort(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct NullMount;
    impl Mount for NullMount {
        fn telemetry(&self) -> Result<MountTelemetry, EngineError> {
            Ok(MountTelemetry { ra_hours: 0.0, dec_deg: 0.0, status: MountMotionStatus::Idle })
        }
        fn set_on_coord_set(&self, _action: OnCoordSetAction) -> Result<(), EngineError> {
            Ok(())
        }
        fn slew_j_now(&self, _ra_hours: f64, _dec_deg: f64) -> Result<(), EngineError> {
            Ok(())
        }
        fn sync_j_now(&self, _ra_hours: f64, _dec_deg: f64) -> Result<(), EngineError> {
            Ok(())
        }
        fn abort_motion(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn build() -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(Arc::new(NullCamera), Arc::new(NullFocuser), Arc::new(NullMount)))
    }

    #[test]
    fn second_claim_is_rejected_while_first_is_held() {
        let session = build();
        let guard = session.claim().unwrap();
        let err = session.claim().unwrap_err();
        assert_eq!(err, EngineError::AlreadyRunning);
        drop(guard);
        assert!(session.claim().is_ok());
    }
}
