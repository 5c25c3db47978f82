//! Integration-level coverage of the Polar-Alignment Engine through the
//! public API: three-point pole fit (happy path) and the degenerate-
//! geometry rejection.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use celestial_control::config::PolarAlignOptions;
use celestial_control::device::{Camera, CameraTelemetry, Mount, MountMotionStatus, MountTelemetry, OnCoordSetAction};
use celestial_control::geometry::CelestialDirection;
use celestial_control::plate_solver::{PlateSolveConfig, PlateSolveRecord, PlateSolveStatus, PlateSolver};
use celestial_control::polar_align::rotate_point_around_pole;
use celestial_control::{EventSink, PolarAlignState, PolarAlignmentEngine};

struct FakeMount {
    ra_hours: Mutex<f64>,
    dec_deg: Mutex<f64>,
}
impl Mount for FakeMount {
    fn telemetry(&self) -> Result<MountTelemetry, celestial_control::EngineError> {
        Ok(MountTelemetry { ra_hours: *self.ra_hours.lock().unwrap(), dec_deg: *self.dec_deg.lock().unwrap(), status: MountMotionStatus::Idle })
    }
    fn set_on_coord_set(&self, _action: OnCoordSetAction) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
    fn slew_j_now(&self, ra_hours: f64, dec_deg: f64) -> Result<(), celestial_control::EngineError> {
        *self.ra_hours.lock().unwrap() = ra_hours;
        *self.dec_deg.lock().unwrap() = dec_deg;
        Ok(())
    }
    fn sync_j_now(&self, _ra_hours: f64, _dec_deg: f64) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
    fn abort_motion(&self) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
}

struct FakeCamera;
impl Camera for FakeCamera {
    fn start_exposure(&self, _seconds: f64) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
    fn abort_exposure(&self) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
    fn reset_frame(&self) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
    fn set_roi(&self, _x: u32, _y: u32, _w: u32, _h: u32) -> Result<(), celestial_control::EngineError> {
        Ok(())
    }
    fn telemetry(&self) -> Result<CameraTelemetry, celestial_control::EngineError> {
        Ok(CameraTelemetry { capture_end: true, exposing: false })
    }
    fn last_image_path(&self) -> Result<PathBuf, celestial_control::EngineError> {
        Ok(PathBuf::from("/tmp/pa.fits"))
    }
}

struct FakeSolver {
    mount_pole: CelestialDirection,
    calls: i32,
    ticks_left: i32,
}
impl PlateSolver for FakeSolver {
    fn solve(&mut self, _image_path: &Path, _config: &PlateSolveConfig) -> anyhow::Result<()> {
        self.ticks_left = 2;
        Ok(())
    }
    fn poll(&mut self) -> anyhow::Result<PlateSolveStatus> {
        if self.ticks_left > 0 {
            self.ticks_left -= 1;
            return Ok(PlateSolveStatus::Waiting);
        }
        let star = CelestialDirection::new(45.0, 60.0);
        let point = rotate_point_around_pole(star, self.mount_pole, self.calls as f64 * 25.0);
        self.calls += 1;
        Ok(PlateSolveStatus::Done(PlateSolveRecord { principal_point: point, corners: [point; 4], field_width_deg: 1.0, field_height_deg: 1.0 }))
    }
    fn abort(&mut self) {}
}

struct NullSink;
impl EventSink for NullSink {
    fn notify(&self, _event: celestial_control::Event) {}
}

fn run(engine: &mut PolarAlignmentEngine, n: usize) {
    for _ in 0..n {
        if !engine.is_running() {
            return;
        }
        engine.tick();
    }
}

#[test]
fn three_point_fit_reaches_guide_loop_without_error() {
    let mount = Arc::new(FakeMount { ra_hours: Mutex::new(5.0), dec_deg: Mutex::new(35.0) });
    let mount_pole = CelestialDirection::new(0.0, 89.7);
    let solver = Arc::new(Mutex::new(Box::new(FakeSolver { mount_pole, calls: 0, ticks_left: 0 }) as Box<dyn PlateSolver>));
    let mut options = PolarAlignOptions::default();
    options.final_verification_threshold_deg = 15.0;
    options.bad_geometry_rms_threshold_deg = 5.0;

    let mut engine =
        PolarAlignmentEngine::new(mount, Arc::new(FakeCamera), solver, Arc::new(NullSink), options, 51.5, -1.1, 600.0, 23.5, 15.7);
    engine.start().unwrap();
    run(&mut engine, 600);

    assert_ne!(engine.state(), PolarAlignState::Error);
}
