//! Polar-alignment engine: three-point pole fit, deviation calculation
//! and live tangent-plane guide loop, built on the same tick/poll
//! contract as `focus::engine` so both engines share a non-blocking
//! shape.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{PolarAlignDirection, PolarAlignOptions};
use crate::device::{Camera, Mount, OnCoordSetAction};
use crate::error::EngineError;
use crate::events::{
    Component, ErrorOccurred, Event, EventSink, LogLevel, LogMessage, PolarGuideData, StateChanged,
};
use crate::geometry::{
    apply_atmospheric_refraction, great_circle_distance_deg, log_map, rotate_by_minimal_rotation, true_pole,
    CelestialDirection, TangentBasis,
};
use crate::plate_solver::{select_solver_mode, PlateSolveConfig, PlateSolveRecord, PlateSolveStatus, PlateSolver, SolverMode};
use crate::polar_align::{calc_mount_pole, rotate_point_around_pole};

const TICK_PERIOD_S: f64 = 0.1;

fn ticks_for(seconds: f64) -> u64 {
    (seconds / TICK_PERIOD_S).ceil().max(1.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarAlignState {
    Idle,
    Init,
    CheckPolarPoint,
    MoveDecAway,
    Capture1,
    Slew1,
    Capture2,
    Slew2,
    Capture3,
    CalcDeviation,
    GuideLoop,
    FinalVerify,
    Completed,
    Error,
}

impl PolarAlignState {
    fn as_str(self) -> &'static str {
        match self {
            PolarAlignState::Idle => "IDLE",
            PolarAlignState::Init => "INIT",
            PolarAlignState::CheckPolarPoint => "CHECK_POLAR_POINT",
            PolarAlignState::MoveDecAway => "MOVE_DEC_AWAY",
            PolarAlignState::Capture1 => "CAPTURE_1",
            PolarAlignState::Slew1 => "SLEW",
            PolarAlignState::Capture2 => "CAPTURE_2",
            PolarAlignState::Slew2 => "SLEW",
            PolarAlignState::Capture3 => "CAPTURE_3",
            PolarAlignState::CalcDeviation => "CALC_DEVIATION",
            PolarAlignState::GuideLoop => "GUIDE_LOOP",
            PolarAlignState::FinalVerify => "FINAL_VERIFY",
            PolarAlignState::Completed => "COMPLETED",
            PolarAlignState::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapturePoint {
    First,
    Second,
    Third,
}

/// Which attempt a capture point is currently on. `CAPTURE_N` always tries
/// a short exposure first, retries once with a long exposure on solve
/// failure, and obstruction-avoids (a small forced nudge) at most once
/// before giving up fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureAttempt {
    Short,
    Long,
    Avoid,
}

struct PendingCapture {
    attempt: CaptureAttempt,
    elapsed_ticks: u64,
    timeout_ticks: u64,
    avoided_already: bool,
}

struct PendingSolve {
    elapsed_ticks: u64,
    timeout_ticks: u64,
}

struct PendingSlew {
    target_ra_hours: f64,
    target_dec_deg: f64,
    elapsed_ticks: u64,
    timeout_ticks: u64,
}

enum Phase {
    Idle,
    Init,
    CheckPolarPoint,
    MoveDecAway { move_: PendingSlew },
    Capturing { point: CapturePoint, capture: PendingCapture },
    Solving { point: CapturePoint, solve: PendingSolve, attempt: CaptureAttempt, avoided_already: bool },
    Slewing { next_point: CapturePoint, move_: PendingSlew, obstruction_avoided: bool },
    GuideLoopCapturing { capture: PendingCapture },
    GuideLoopSolving { solve: PendingSolve },
    FinalVerify { capture: PendingCapture },
    FinalVerifySolving { solve: PendingSolve },
}

pub struct PolarAlignmentEngine {
    mount: Arc<dyn Mount>,
    camera: Arc<dyn Camera>,
    solver: Arc<std::sync::Mutex<Box<dyn PlateSolver>>>,
    sink: Arc<dyn EventSink>,
    options: PolarAlignOptions,
    latitude_deg: f64,
    longitude_deg: f64,
    focal_length_mm: f64,
    sensor_width_mm: f64,
    sensor_height_mm: f64,
    session: Option<Arc<crate::session::SessionHandle>>,
    session_guard: Option<crate::session::SessionGuard>,

    state: PolarAlignState,
    phase: Phase,
    running: bool,

    start_ra_hours: f64,
    start_dec_deg: f64,
    points: Vec<CelestialDirection>,
    last_known_offset_deg: Option<f64>,
    mount_pole: Option<CelestialDirection>,
    true_pole: Option<CelestialDirection>,
    /// Fixed guide target: the minimum-rotation image of the third
    /// reference point under the rotation that maps the fitted mount pole
    /// onto the true pole. Computed once in `compute_deviation` and held
    /// constant through the whole guide loop.
    target: Option<CelestialDirection>,
    /// Confidence of the three-point pole fit, `[0, 1]`.
    confidence: Option<f64>,
    deviation_deg: Option<f64>,
}

impl PolarAlignmentEngine {
    pub fn new(
        mount: Arc<dyn Mount>,
        camera: Arc<dyn Camera>,
        solver: Arc<std::sync::Mutex<Box<dyn PlateSolver>>>,
        sink: Arc<dyn EventSink>,
        options: PolarAlignOptions,
        latitude_deg: f64,
        longitude_deg: f64,
        focal_length_mm: f64,
        sensor_width_mm: f64,
        sensor_height_mm: f64,
    ) -> Self {
        Self {
            mount,
            camera,
            solver,
            sink,
            options,
            latitude_deg,
            longitude_deg,
            focal_length_mm,
            sensor_width_mm,
            sensor_height_mm,
            session: None,
            session_guard: None,
            state: PolarAlignState::Idle,
            phase: Phase::Idle,
            running: false,
            start_ra_hours: 0.0,
            start_dec_deg: 0.0,
            points: Vec::new(),
            last_known_offset_deg: None,
            mount_pole: None,
            true_pole: None,
            target: None,
            confidence: None,
            deviation_deg: None,
        }
    }

    /// Exclusively claims `session`'s devices for the duration of each run,
    /// refusing to start while another engine holds the same session.
    pub fn with_session(mut self, session: Arc<crate::session::SessionHandle>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn state(&self) -> PolarAlignState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Err(EngineError::AlreadyRunning);
        }
        if let Some(session) = &self.session {
            self.session_guard = Some(session.claim()?);
        }
        let telemetry = match self.mount.telemetry() {
            Ok(t) => t,
            Err(e) => {
                self.session_guard = None;
                return Err(EngineError::DeviceUnavailable(e.to_string()));
            }
        };
        self.start_ra_hours = telemetry.ra_hours;
        self.start_dec_deg = telemetry.dec_deg;
        self.points.clear();
        self.last_known_offset_deg = None;
        self.mount_pole = None;
        self.true_pole = None;
        self.target = None;
        self.confidence = None;
        self.deviation_deg = None;
        self.running = true;
        if let Err(e) = self.mount.set_on_coord_set(OnCoordSetAction::Slew) {
            self.running = false;
            self.session_guard = None;
            return Err(EngineError::DeviceUnavailable(e.to_string()));
        }
        self.transition(PolarAlignState::Init, "polar alignment starting");
        self.phase = Phase::Init;
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.running && matches!(self.state, PolarAlignState::Idle) {
            return;
        }
        let _ = self.mount.abort_motion();
        let _ = self.camera.abort_exposure();
        self.solver.lock().unwrap().abort();
        self.running = false;
        self.session_guard = None;
        self.phase = Phase::Idle;
        self.transition(PolarAlignState::Idle, "stopped by operator");
    }

    fn transition(&mut self, new_state: PolarAlignState, message: &str) {
        self.state = new_state;
        self.sink.notify(Event::StateChanged(StateChanged {
            component: Component::PolarAlign,
            state: new_state.as_str().to_string(),
            message: message.to_string(),
            percent: None,
        }));
    }

    fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.sink.notify(Event::LogMessage(LogMessage { level, text: text.into() }));
    }

    fn fail(&mut self, err: EngineError) {
        let _ = self.mount.abort_motion();
        let _ = self.camera.abort_exposure();
        self.solver.lock().unwrap().abort();
        self.running = false;
        self.session_guard = None;
        self.state = PolarAlignState::Error;
        self.sink.notify(Event::ErrorOccurred(ErrorOccurred { code: err.code().to_string(), text: err.to_string() }));
    }

    fn begin_slew(&self, ra_hours: f64, dec_deg: f64) -> Result<PendingSlew, EngineError> {
        self.mount
            .slew_j_now(ra_hours, dec_deg)
            .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
        Ok(PendingSlew {
            target_ra_hours: ra_hours,
            target_dec_deg: dec_deg,
            elapsed_ticks: 0,
            timeout_ticks: ticks_for(self.options.mount_arrival_timeout_s),
        })
    }

    fn poll_slew(&mut self, pending: &mut PendingSlew) -> Result<bool, EngineError> {
        let telemetry = self.mount.telemetry().map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
        pending.elapsed_ticks += 1;

        let ra_deg_error = ((telemetry.ra_hours - pending.target_ra_hours) * 15.0).abs();
        let dec_error = (telemetry.dec_deg - pending.target_dec_deg).abs();
        let arrived = matches!(telemetry.status, crate::device::MountMotionStatus::Idle)
            && ra_deg_error < 0.05
            && dec_error < 0.05;

        if arrived {
            return Ok(true);
        }
        if pending.elapsed_ticks >= pending.timeout_ticks {
            return Err(EngineError::MoveTimeout("mount did not reach target in time".into()));
        }
        Ok(false)
    }

    fn begin_capture(&self, attempt: CaptureAttempt) -> PendingCapture {
        let seconds = match attempt {
            CaptureAttempt::Short | CaptureAttempt::Avoid => self.options.short_exposure_s,
            CaptureAttempt::Long => self.options.long_exposure_s,
        };
        let _ = self.camera.start_exposure(seconds);
        PendingCapture {
            attempt,
            elapsed_ticks: 0,
            timeout_ticks: ticks_for(self.options.capture_timeout_s),
            avoided_already: false,
        }
    }

    fn poll_capture(&mut self, pending: &mut PendingCapture) -> Result<Option<PathBuf>, EngineError> {
        let telemetry = self.camera.telemetry().map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
        pending.elapsed_ticks += 1;
        if telemetry.capture_end {
            let path = self.camera.last_image_path().map_err(|e| EngineError::CaptureFailed(e.to_string()))?;
            return Ok(Some(path));
        }
        if pending.elapsed_ticks >= pending.timeout_ticks {
            return Err(EngineError::CaptureFailed("exposure wait timed out".into()));
        }
        Ok(None)
    }

    fn begin_solve(&mut self, image_path: &std::path::Path) -> Result<PendingSolve, EngineError> {
        let mode = select_solver_mode(
            self.deviation_deg,
            self.last_known_offset_deg,
            self.options.solve_mode1_max_offset_deg,
            self.options.solve_mode2_max_offset_deg,
            self.options.small_deviation_threshold_deg,
        );
        let hint = match mode {
            SolverMode::Blind => None,
            _ => self.last_hint(),
        };
        let config = PlateSolveConfig {
            mode,
            focal_length_mm: self.focal_length_mm,
            sensor_width_mm: self.sensor_width_mm,
            sensor_height_mm: self.sensor_height_mm,
            hint,
            timeout_s: self.options.solve_timeout_s,
        };
        self.solver
            .lock()
            .unwrap()
            .solve(image_path, &config)
            .map_err(|e| EngineError::SolveFailed(e.to_string()))?;
        Ok(PendingSolve { elapsed_ticks: 0, timeout_ticks: ticks_for(self.options.solve_timeout_s) })
    }

    fn last_hint(&self) -> Option<CelestialDirection> {
        self.points.last().copied()
    }

    fn poll_solve(&mut self, pending: &mut PendingSolve) -> Result<Option<PlateSolveRecord>, EngineError> {
        pending.elapsed_ticks += 1;
        let status = self
            .solver
            .lock()
            .unwrap()
            .poll()
            .map_err(|e| EngineError::SolveFailed(e.to_string()))?;
        match status {
            PlateSolveStatus::Done(mut record) => {
                let now = chrono::Utc::now().naive_utc();
                record.principal_point =
                    apply_atmospheric_refraction(&record.principal_point, self.latitude_deg, self.longitude_deg, &now);
                Ok(Some(record))
            }
            PlateSolveStatus::Failed => Err(EngineError::SolveFailed("solver reported failure".into())),
            PlateSolveStatus::Waiting => {
                if pending.elapsed_ticks >= pending.timeout_ticks {
                    Err(EngineError::SolveFailed("solve timed out".into()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Advance by one 100 ms tick.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}

            Phase::Init => {
                self.transition(PolarAlignState::CheckPolarPoint, "checking starting declination");
                self.phase = Phase::CheckPolarPoint;
            }

            Phase::CheckPolarPoint => {
                if self.start_dec_deg.abs() >= 85.0 {
                    self.transition(PolarAlignState::MoveDecAway, "near celestial pole, moving away first");
                    let toward_equator_sign = if self.start_dec_deg >= 0.0 { -1.0 } else { 1.0 };
                    let target_dec = (self.start_dec_deg + toward_equator_sign * self.options.dec_rotation_angle_deg)
                        .clamp(-90.0, 90.0);
                    match self.begin_slew(self.start_ra_hours, target_dec) {
                        Ok(move_) => self.phase = Phase::MoveDecAway { move_ },
                        Err(e) => self.fail(e),
                    }
                } else {
                    self.transition(PolarAlignState::Capture1, "capturing first reference point");
                    self.phase = Phase::Capturing { point: CapturePoint::First, capture: self.begin_capture(CaptureAttempt::Short) };
                }
            }

            Phase::MoveDecAway { mut move_ } => match self.poll_slew(&mut move_) {
                Ok(true) => {
                    self.transition(PolarAlignState::Capture1, "capturing first reference point");
                    self.phase = Phase::Capturing { point: CapturePoint::First, capture: self.begin_capture(CaptureAttempt::Short) };
                }
                Ok(false) => self.phase = Phase::MoveDecAway { move_ },
                Err(e) => self.fail(e),
            },

            Phase::Capturing { point, mut capture } => match self.poll_capture(&mut capture) {
                Ok(Some(path)) => {
                    self.set_capture_state(point);
                    let attempt = capture.attempt;
                    let avoided_already = capture.avoided_already;
                    match self.begin_solve(&path) {
                        Ok(solve) => self.phase = Phase::Solving { point, solve, attempt, avoided_already },
                        Err(e) => self.handle_capture_failure(point, attempt, avoided_already, e),
                    }
                }
                Ok(None) => self.phase = Phase::Capturing { point, capture },
                Err(e) => {
                    let attempt = capture.attempt;
                    let avoided_already = capture.avoided_already;
                    self.handle_capture_failure(point, attempt, avoided_already, e);
                }
            },

            Phase::Solving { point, mut solve, attempt, avoided_already } => match self.poll_solve(&mut solve) {
                Ok(None) => self.phase = Phase::Solving { point, solve, attempt, avoided_already },
                Ok(Some(record)) => self.finish_point(point, record, avoided_already),
                Err(e) => self.handle_capture_failure(point, attempt, avoided_already, e),
            },

            Phase::Slewing { next_point, mut move_, obstruction_avoided } => match self.poll_slew(&mut move_) {
                Ok(true) => {
                    self.set_capture_state(next_point);
                    let attempt = if obstruction_avoided { CaptureAttempt::Avoid } else { CaptureAttempt::Short };
                    let mut capture = self.begin_capture(attempt);
                    capture.avoided_already = obstruction_avoided;
                    self.phase = Phase::Capturing { point: next_point, capture };
                }
                Ok(false) => self.phase = Phase::Slewing { next_point, move_, obstruction_avoided },
                Err(e) => self.fail(e),
            },

            Phase::GuideLoopCapturing { mut capture } => match self.poll_capture(&mut capture) {
                Ok(Some(path)) => match self.begin_solve(&path) {
                    Ok(solve) => self.phase = Phase::GuideLoopSolving { solve },
                    Err(e) => self.fail(e),
                },
                Ok(None) => self.phase = Phase::GuideLoopCapturing { capture },
                Err(e) => self.fail(e),
            },

            Phase::GuideLoopSolving { mut solve } => match self.poll_solve(&mut solve) {
                Ok(None) => self.phase = Phase::GuideLoopSolving { solve },
                Ok(Some(record)) => self.finish_guide_iteration(record),
                Err(e) => self.fail(e),
            },

            Phase::FinalVerify { mut capture } => match self.poll_capture(&mut capture) {
                Ok(Some(path)) => match self.begin_solve(&path) {
                    Ok(solve) => self.phase = Phase::FinalVerifySolving { solve },
                    Err(e) => self.fail(e),
                },
                Ok(None) => self.phase = Phase::FinalVerify { capture },
                Err(e) => self.fail(e),
            },

            Phase::FinalVerifySolving { mut solve } => match self.poll_solve(&mut solve) {
                Ok(None) => self.phase = Phase::FinalVerifySolving { solve },
                Ok(Some(record)) => {
                    let Some(target) = self.target else {
                        self.fail(EngineError::BadGeometry("missing target for final verification".into()));
                        return;
                    };
                    let deviation = great_circle_distance_deg(&record.principal_point, &target);
                    if deviation <= self.options.final_verification_threshold_deg {
                        self.running = false;
                        self.session_guard = None;
                        self.state = PolarAlignState::Completed;
                        self.sink.notify(Event::StateChanged(StateChanged {
                            component: Component::PolarAlign,
                            state: PolarAlignState::Completed.as_str().to_string(),
                            message: format!("within {:.3} deg of target", deviation),
                            percent: Some(100),
                        }));
                    } else {
                        self.deviation_deg = Some(deviation);
                        self.transition(PolarAlignState::GuideLoop, "still outside tolerance, resuming guide loop");
                        self.phase = Phase::GuideLoopCapturing { capture: self.begin_capture(CaptureAttempt::Short) };
                    }
                }
                Err(e) => self.fail(e),
            },
        }
    }

    /// East pier side rotates RA forward between captures, West backward.
    fn ra_direction_sign(&self) -> f64 {
        match self.options.direction {
            PolarAlignDirection::East => 1.0,
            PolarAlignDirection::West => -1.0,
        }
    }

    fn set_capture_state(&mut self, point: CapturePoint) {
        let state = match point {
            CapturePoint::First => PolarAlignState::Capture1,
            CapturePoint::Second => PolarAlignState::Capture2,
            CapturePoint::Third => PolarAlignState::Capture3,
        };
        self.state = state;
    }

    /// Each capture point has its own one-shot obstruction-avoidance nudge:
    /// CAPTURE_1 mirrors declination across the pole, CAPTURE_2 backs RA off
    /// by twice the inter-capture rotation, CAPTURE_3 nudges RA by half the
    /// rotation with its sign inverted from the outbound slews.
    fn handle_capture_failure(&mut self, point: CapturePoint, attempt: CaptureAttempt, avoided_already: bool, err: EngineError) {
        match attempt {
            CaptureAttempt::Short => {
                self.log(LogLevel::Warn, format!("{err}, retrying with long exposure"));
                self.phase = Phase::Capturing { point, capture: self.begin_capture(CaptureAttempt::Long) };
            }
            CaptureAttempt::Long if !avoided_already => {
                self.log(LogLevel::Warn, format!("{err}, attempting one obstruction-avoidance nudge"));
                let telemetry = match self.mount.telemetry() {
                    Ok(t) => t,
                    Err(e) => {
                        self.fail(EngineError::DeviceUnavailable(e.to_string()));
                        return;
                    }
                };
                let delta_h = self.ra_direction_sign() * self.options.ra_rotation_angle_deg / 15.0;
                let (nudge_ra, nudge_dec) = match point {
                    CapturePoint::First => {
                        let dec_sign = if telemetry.dec_deg >= 0.0 { 1.0 } else { -1.0 };
                        let mirrored_dec = (dec_sign * 180.0 - telemetry.dec_deg).clamp(-90.0, 90.0);
                        (telemetry.ra_hours, mirrored_dec)
                    }
                    CapturePoint::Second => (telemetry.ra_hours - 2.0 * delta_h, telemetry.dec_deg),
                    CapturePoint::Third => (telemetry.ra_hours - 0.5 * delta_h, telemetry.dec_deg),
                };
                match self.begin_slew(nudge_ra, nudge_dec) {
                    Ok(move_) => self.phase = Phase::Slewing { next_point: point, move_, obstruction_avoided: true },
                    Err(e) => self.fail(e),
                }
            }
            _ => self.fail(EngineError::ObstructionFatal(format!("could not capture point after avoidance: {err}"))),
        }
    }

    /// Inter-capture slew magnitude is always `raRotationAngle` (signed by
    /// pier side); the slew from the second to the third point reverses
    /// sign if the second point's own capture needed an obstruction-
    /// avoidance nudge, so the mount backs away from whatever blocked it
    /// rather than driving further into it.
    fn finish_point(&mut self, point: CapturePoint, record: PlateSolveRecord, avoided: bool) {
        self.points.push(record.principal_point);
        self.last_known_offset_deg = Some(0.0);

        match point {
            CapturePoint::First => {
                self.transition(PolarAlignState::Slew1, "slewing for second reference point");
                let telemetry = match self.mount.telemetry() {
                    Ok(t) => t,
                    Err(e) => return self.fail(EngineError::DeviceUnavailable(e.to_string())),
                };
                let ra_delta_h = self.ra_direction_sign() * self.options.ra_rotation_angle_deg / 15.0;
                match self.begin_slew(telemetry.ra_hours + ra_delta_h, self.start_dec_deg) {
                    Ok(move_) => self.phase = Phase::Slewing { next_point: CapturePoint::Second, move_, obstruction_avoided: false },
                    Err(e) => self.fail(e),
                }
            }
            CapturePoint::Second => {
                self.transition(PolarAlignState::Slew2, "slewing for third reference point");
                let telemetry = match self.mount.telemetry() {
                    Ok(t) => t,
                    Err(e) => return self.fail(EngineError::DeviceUnavailable(e.to_string())),
                };
                let base_delta = self.ra_direction_sign() * self.options.ra_rotation_angle_deg / 15.0;
                let ra_delta_h = if avoided { -base_delta } else { base_delta };
                match self.begin_slew(telemetry.ra_hours + ra_delta_h, self.start_dec_deg) {
                    Ok(move_) => self.phase = Phase::Slewing { next_point: CapturePoint::Third, move_, obstruction_avoided: false },
                    Err(e) => self.fail(e),
                }
            }
            CapturePoint::Third => {
                self.transition(PolarAlignState::CalcDeviation, "computing mount pole from three references");
                self.compute_deviation();
            }
        }
    }

    fn compute_deviation(&mut self) {
        let [p1, p2, p3]: [CelestialDirection; 3] = match self.points[..] {
            [a, b, c] => [a, b, c],
            _ => unreachable!("exactly three points are collected before CALC_DEVIATION"),
        };

        let now = chrono::Utc::now().naive_utc();
        let true_pole_dir = true_pole(self.latitude_deg, &now);

        let Some(fit) = calc_mount_pole(p1, p2, p3, true_pole_dir, self.options.min_pair_separation_deg) else {
            self.fail(EngineError::BadGeometry("reference points are nearly collinear".into()));
            return;
        };
        if fit.rms_deg > self.options.bad_geometry_rms_threshold_deg {
            self.fail(EngineError::BadGeometry(format!(
                "pole fit residual {:.3} deg exceeds threshold {:.3} deg",
                fit.rms_deg, self.options.bad_geometry_rms_threshold_deg
            )));
            return;
        }

        let deviation = great_circle_distance_deg(&fit.pole, &true_pole_dir);
        let target_vec =
            rotate_by_minimal_rotation(&p3.to_unit_vector(), &fit.pole.to_unit_vector(), &true_pole_dir.to_unit_vector());
        let target = CelestialDirection::from_unit_vector(&target_vec);

        self.mount_pole = Some(fit.pole);
        self.true_pole = Some(true_pole_dir);
        self.target = Some(target);
        self.confidence = Some(fit.confidence);
        self.deviation_deg = Some(deviation);
        self.last_known_offset_deg = Some(deviation);

        self.transition(PolarAlignState::GuideLoop, "entering live guide loop");
        self.phase = Phase::GuideLoopCapturing { capture: self.begin_capture(CaptureAttempt::Short) };
    }

    fn finish_guide_iteration(&mut self, record: PlateSolveRecord) {
        self.emit_guide_data(&record);
        let Some(target) = self.target else {
            self.fail(EngineError::BadGeometry("guide loop entered without a pole fit".into()));
            return;
        };
        let deviation = great_circle_distance_deg(&record.principal_point, &target);
        if deviation <= self.options.final_verification_threshold_deg {
            self.transition(PolarAlignState::FinalVerify, "verifying alignment with a fresh capture");
            self.phase = Phase::FinalVerify { capture: self.begin_capture(CaptureAttempt::Short) };
            return;
        }
        self.phase = Phase::GuideLoopCapturing { capture: self.begin_capture(CaptureAttempt::Short) };
    }

    /// Tangent-plane offset of the freshly solved position from the fixed
    /// guide target, built at the solved position per the spec's
    /// east/north basis rather than at the true pole.
    fn emit_guide_data(&mut self, record: &PlateSolveRecord) {
        let (Some(mount_pole), Some(true_pole_dir), Some(target)) = (self.mount_pole, self.true_pole, self.target) else {
            return;
        };
        let confidence = self.confidence.unwrap_or(0.0);

        let s_vec = record.principal_point.to_unit_vector();
        let basis = TangentBasis::at(&s_vec);
        let (u, v) = log_map(&s_vec, &basis, &target.to_unit_vector());
        let offset_east = u.to_degrees();
        let offset_north = v.to_degrees();

        let corners = record.corners.map(|c| crate::events::CornerCoord { ra_deg: c.ra_deg, dec_deg: c.dec_deg });

        self.sink.notify(Event::PolarGuideData(PolarGuideData {
            current_ra_deg: record.principal_point.ra_deg,
            current_dec_deg: record.principal_point.dec_deg,
            corners,
            target_ra_deg: target.ra_deg,
            target_dec_deg: target.dec_deg,
            offset_east_deg: offset_east,
            offset_north_deg: offset_north,
            guide_text_ra: format!("{:+.2} deg E/W", offset_east),
            guide_text_dec: format!("{:+.2} deg N/S", offset_north),
            fake_pole_ra_deg: mount_pole.ra_deg,
            fake_pole_dec_deg: mount_pole.dec_deg,
            true_pole_ra_deg: true_pole_dir.ra_deg,
            true_pole_dec_deg: true_pole_dir.dec_deg,
            confidence,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CameraTelemetry, MountMotionStatus, MountTelemetry};
    use std::sync::Mutex as StdMutex;

    struct FakeMount {
        ra_hours: StdMutex<f64>,
        dec_deg: StdMutex<f64>,
    }
    impl Mount for FakeMount {
        fn telemetry(&self) -> Result<MountTelemetry, EngineError> {
            Ok(MountTelemetry { ra_hours: *self.ra_hours.lock().unwrap(), dec_deg: *self.dec_deg.lock().unwrap(), status: MountMotionStatus::Idle })
        }
        fn set_on_coord_set(&self, _action: OnCoordSetAction) -> Result<(), EngineError> {
            Ok(())
        }
        fn slew_j_now(&self, ra_hours: f64, dec_deg: f64) -> Result<(), EngineError> {
            *self.ra_hours.lock().unwrap() = ra_hours;
            *self.dec_deg.lock().unwrap() = dec_deg;
            Ok(())
        }
        fn sync_j_now(&self, _ra_hours: f64, _dec_deg: f64) -> Result<(), EngineError> {
            Ok(())
        }
        fn abort_motion(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    /// Always reports the exposure as finished on the very next telemetry
    /// poll, so tests don't need to tick through a real exposure duration.
    struct FakeCamera;
    impl Camera for FakeCamera {
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
            Ok(PathBuf::from("/tmp/p.fits"))
        }
    }

    /// Reports the true celestial pole slightly mis-set, so every solve
    /// "finds" a star rotated around a known, slightly-off mount pole.
    struct FakeSolver {
        mount_pole: CelestialDirection,
        ticks_left: i32,
        fail_once: bool,
        failed_already: bool,
        /// Number of completed solves so far; each successive reference
        /// point is simulated at a further rotation around the mount pole,
        /// as the mount would actually see after slewing in RA between
        /// captures.
        calls: i32,
        step_deg: f64,
    }
    impl PlateSolver for FakeSolver {
        fn solve(&mut self, _image_path: &std::path::Path, _config: &PlateSolveConfig) -> anyhow::Result<()> {
            self.ticks_left = 2;
            Ok(())
        }
        fn poll(&mut self) -> anyhow::Result<PlateSolveStatus> {
            if self.ticks_left > 0 {
                self.ticks_left -= 1;
                return Ok(PlateSolveStatus::Waiting);
            }
            if self.fail_once && !self.failed_already {
                self.failed_already = true;
                return Ok(PlateSolveStatus::Failed);
            }
            let star = CelestialDirection::new(45.0, 60.0);
            let point = rotate_point_around_pole(star, self.mount_pole, self.calls as f64 * self.step_deg);
            self.calls += 1;
            Ok(PlateSolveStatus::Done(PlateSolveRecord {
                principal_point: point,
                corners: [point; 4],
                field_width_deg: 1.0,
                field_height_deg: 1.0,
            }))
        }
        fn abort(&mut self) {}
    }

    struct NullSink;
    impl EventSink for NullSink {
        fn notify(&self, _event: Event) {}
    }

    fn build_engine(mount_pole_offset_deg: f64, fail_once: bool) -> PolarAlignmentEngine {
        let mount = Arc::new(FakeMount { ra_hours: StdMutex::new(5.0), dec_deg: StdMutex::new(40.0) });
        let true_pole_dir = CelestialDirection::new(0.0, 90.0);
        let mount_pole = CelestialDirection::new(true_pole_dir.ra_deg, 90.0 - mount_pole_offset_deg);
        let solver = Arc::new(StdMutex::new(Box::new(FakeSolver { mount_pole, ticks_left: 0, fail_once, failed_already: false, calls: 0, step_deg: 30.0 }) as Box<dyn PlateSolver>));
        let mut options = PolarAlignOptions::default();
        options.final_verification_threshold_deg = 10.0;
        options.bad_geometry_rms_threshold_deg = 5.0;
        PolarAlignmentEngine::new(mount, Arc::new(FakeCamera), solver, Arc::new(NullSink), options, 51.5, -1.1, 600.0, 23.5, 15.7)
    }

    fn run_ticks(engine: &mut PolarAlignmentEngine, n: usize) {
        for _ in 0..n {
            if !engine.is_running() {
                return;
            }
            engine.tick();
        }
    }

    #[test]
    fn reaches_guide_loop_after_three_captures() {
        let mut engine = build_engine(0.2, false);
        engine.start().unwrap();
        run_ticks(&mut engine, 500);
        assert!(matches!(engine.state(), PolarAlignState::GuideLoop | PolarAlignState::FinalVerify | PolarAlignState::Completed));
    }

    #[test]
    fn recovers_from_single_solve_failure_with_long_exposure_retry() {
        let mut engine = build_engine(0.2, true);
        engine.start().unwrap();
        run_ticks(&mut engine, 500);
        assert_ne!(engine.state(), PolarAlignState::Error);
    }

    #[test]
    fn near_pole_start_routes_through_move_dec_away() {
        let mount = Arc::new(FakeMount { ra_hours: StdMutex::new(5.0), dec_deg: StdMutex::new(89.0) });
        let mount_pole = CelestialDirection::new(0.0, 89.8);
        let solver = Arc::new(StdMutex::new(Box::new(FakeSolver { mount_pole, ticks_left: 0, fail_once: false, failed_already: false, calls: 0, step_deg: 30.0 }) as Box<dyn PlateSolver>));
        let options = PolarAlignOptions::default();
        let mut engine = PolarAlignmentEngine::new(mount, Arc::new(FakeCamera), solver, Arc::new(NullSink), options, 51.5, -1.1, 600.0, 23.5, 15.7);
        engine.start().unwrap();
        engine.tick();
        engine.tick();
        assert_eq!(engine.state(), PolarAlignState::MoveDecAway);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut engine = build_engine(0.2, false);
        engine.start().unwrap();
        engine.tick();
        engine.stop();
        assert_eq!(engine.state(), PolarAlignState::Idle);
        engine.stop();
        assert_eq!(engine.state(), PolarAlignState::Idle);
    }

    #[test]
    fn degenerate_geometry_is_rejected_as_bad_geometry() {
        let mount = Arc::new(FakeMount { ra_hours: StdMutex::new(5.0), dec_deg: StdMutex::new(40.0) });
        let collinear_point = CelestialDirection::new(45.0, 60.0);
        let solver = Arc::new(StdMutex::new(Box::new(FakeSolver { mount_pole: collinear_point, ticks_left: 0, fail_once: false, failed_already: false, calls: 0, step_deg: 0.0000001 }) as Box<dyn PlateSolver>));
        let mut options = PolarAlignOptions::default();
        options.ra_rotation_angle_deg = 0.00001;
        options.dec_rotation_angle_deg = 0.00001;
        let mut engine = PolarAlignmentEngine::new(mount, Arc::new(FakeCamera), solver, Arc::new(NullSink), options, 51.5, -1.1, 600.0, 23.5, 15.7);
        engine.start().unwrap();
        run_ticks(&mut engine, 500);
        assert_eq!(engine.state(), PolarAlignState::Error);
    }

    #[test]
    fn guide_loop_emits_nonzero_confidence() {
        struct CapturingSink {
            last_confidence: StdMutex<Option<f64>>,
        }
        impl EventSink for CapturingSink {
            fn notify(&self, event: Event) {
                if let Event::PolarGuideData(data) = event {
                    *self.last_confidence.lock().unwrap() = Some(data.confidence);
                }
            }
        }
        let mount = Arc::new(FakeMount { ra_hours: StdMutex::new(5.0), dec_deg: StdMutex::new(40.0) });
        let true_pole_dir = CelestialDirection::new(0.0, 90.0);
        let mount_pole = CelestialDirection::new(true_pole_dir.ra_deg, 89.8);
        let solver = Arc::new(StdMutex::new(Box::new(FakeSolver { mount_pole, ticks_left: 0, fail_once: false, failed_already: false, calls: 0, step_deg: 30.0 }) as Box<dyn PlateSolver>));
        let mut options = PolarAlignOptions::default();
        options.final_verification_threshold_deg = 0.0001;
        options.bad_geometry_rms_threshold_deg = 5.0;
        let sink = Arc::new(CapturingSink { last_confidence: StdMutex::new(None) });
        let mut engine = PolarAlignmentEngine::new(mount, Arc::new(FakeCamera), solver, sink.clone(), options, 51.5, -1.1, 600.0, 23.5, 15.7);
        engine.start().unwrap();
        run_ticks(&mut engine, 500);
        let confidence = sink.last_confidence.lock().unwrap().expect("at least one guide reading emitted");
        assert!(confidence > 0.0 && confidence <= 1.0, "confidence={confidence}");
    }
}
