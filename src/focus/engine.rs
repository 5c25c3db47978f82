//! Auto-focus engine: drives focuser + camera to the position of minimum
//! HFR via search, coarse sweep, fine sweep, parabolic fit, seek-to-best.
//!
//! No blocking sleeps: every wait (focuser move, exposure) is an explicit
//! sub-phase whose `tick()` reads a telemetry snapshot and either proceeds
//! or stays put. Time is tracked in ticks of the engine's own 100 ms
//! period rather than wall-clock, so the whole engine is deterministic
//! under test.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AutoFocusOptions;
use crate::device::{Camera, Focuser, FocuserRange, Mount};
use crate::error::EngineError;
use crate::events::{
    AutoFocusCompleted as AutoFocusCompletedEvent, Component, ErrorOccurred, Event, EventSink,
    LogLevel, LogMessage, StateChanged,
};
use crate::focus::{fit_quadratic, filter_outliers, interpolation_fallback, FocusFitResult, FocusSample};
use crate::star_extractor::{brightest_star, top_n_mean_hfr, StarExtractor};

/// Engine tick period: one periodic tick every 100 ms.
pub const TICK_PERIOD_S: f64 = 0.1;

fn ticks_for(seconds: f64) -> u64 {
    (seconds / TICK_PERIOD_S).ceil().max(1.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoFocusState {
    Idle,
    CheckingStars,
    LargeRangeSearch,
    CoarseAdjustment,
    FineAdjustment,
    FittingData,
    MovingToBestPosition,
    Completed,
    Error,
}

impl AutoFocusState {
    fn as_str(self) -> &'static str {
        match self {
            AutoFocusState::Idle => "IDLE",
            AutoFocusState::CheckingStars => "CHECKING_STARS",
            AutoFocusState::LargeRangeSearch => "LARGE_RANGE_SEARCH",
            AutoFocusState::CoarseAdjustment => "COARSE_ADJUSTMENT",
            AutoFocusState::FineAdjustment => "FINE_ADJUSTMENT",
            AutoFocusState::FittingData => "FITTING_DATA",
            AutoFocusState::MovingToBestPosition => "MOVING_TO_BEST_POSITION",
            AutoFocusState::Completed => "COMPLETED",
            AutoFocusState::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Coarse,
    Fine,
}

/// A focuser move in flight, with anti-backlash overshoot-then-return
/// choreography and a stuck/timeout policy for movement completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingMove {
    /// Final destination.
    target: i32,
    /// Intermediate anti-backlash overshoot position, if any remains to be
    /// reached before `target`.
    anti_backlash_target: Option<i32>,
    elapsed_ticks: u64,
    last_seen_position: i32,
    stuck_ticks: u64,
    timeout_ticks: u64,
    tolerance: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingExposure {
    elapsed_ticks: u64,
    timeout_ticks: u64,
}

enum Phase {
    Idle,
    /// Waiting for one full-frame exposure + extraction before deciding
    /// coarse/fine/search.
    CheckingStars { exposure: PendingExposure },
    LargeRangeSearch { move_: Option<PendingMove>, exposure: Option<PendingExposure> },
    /// Shared plumbing for COARSE_ADJUSTMENT / FINE_ADJUSTMENT: a queue of
    /// target positions plus in-flight move/exposure sub-phases.
    Sampling {
        stage: Stage,
        move_: Option<PendingMove>,
        exposure: Option<PendingExposure>,
        shots_collected: Vec<f64>,
    },
    MovingToBestPosition { move_: PendingMove },
}

pub struct AutoFocusEngine {
    camera: Arc<dyn Camera>,
    focuser: Arc<dyn Focuser>,
    #[allow(dead_code)]
    mount: Arc<dyn Mount>,
    extractor: Arc<dyn StarExtractor>,
    sink: Arc<dyn EventSink>,
    options: AutoFocusOptions,
    session: Option<Arc<crate::session::SessionHandle>>,
    session_guard: Option<crate::session::SessionGuard>,

    state: AutoFocusState,
    phase: Phase,
    running: bool,

    focuser_range: Option<FocuserRange>,
    start_position: i32,

    samples: Vec<FocusSample>,
    remaining_positions: Vec<i32>,
    /// Pixel position of the brightest star seen in the most recent frame,
    /// used to centre a fine-stage ROI.
    last_star_position: Option<(f64, f64)>,

    search_step_pct: f64,
    search_direction_inward: bool,
    search_shots_taken: usize,

    capture_retry_count: usize,
    fit_result: Option<FocusFitResult>,
    best_position: Option<f64>,
    min_hfr: Option<f64>,

    last_result: Option<AutoFocusCompletedEvent>,
}

impl AutoFocusEngine {
    pub fn new(
        camera: Arc<dyn Camera>,
        focuser: Arc<dyn Focuser>,
        mount: Arc<dyn Mount>,
        extractor: Arc<dyn StarExtractor>,
        sink: Arc<dyn EventSink>,
        options: AutoFocusOptions,
    ) -> Self {
        Self {
            camera,
            focuser,
            mount,
            extractor,
            sink,
            options,
            session: None,
            session_guard: None,
            state: AutoFocusState::Idle,
            phase: Phase::Idle,
            running: false,
            focuser_range: None,
            start_position: 0,
            samples: Vec::new(),
            remaining_positions: Vec::new(),
            last_star_position: None,
            search_step_pct: 0.0,
            search_direction_inward: true,
            search_shots_taken: 0,
            capture_retry_count: 0,
            fit_result: None,
            best_position: None,
            min_hfr: None,
            last_result: None,
        }
    }

    /// Exclusively claims `session`'s devices for the duration of each run,
    /// refusing to start while another engine holds the same session.
    pub fn with_session(mut self, session: Arc<crate::session::SessionHandle>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn state(&self) -> AutoFocusState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn samples(&self) -> &[FocusSample] {
        &self.samples
    }

    pub fn last_result(&self) -> Option<&AutoFocusCompletedEvent> {
        self.last_result.as_ref()
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Err(EngineError::AlreadyRunning);
        }
        if let Some(session) = &self.session {
            self.session_guard = Some(session.claim()?);
        }

        let range = match self.focuser.position_range() {
            Ok(r) => r,
            Err(e) => {
                self.session_guard = None;
                return Err(EngineError::DeviceUnavailable(e.to_string()));
            }
        };
        let telemetry = match self.focuser.telemetry() {
            Ok(t) => t,
            Err(e) => {
                self.session_guard = None;
                return Err(EngineError::DeviceUnavailable(e.to_string()));
            }
        };
        if let Err(e) = self.camera.telemetry() {
            self.session_guard = None;
            return Err(EngineError::DeviceUnavailable(e.to_string()));
        }

        self.focuser_range = Some(range);
        self.start_position = telemetry.position;
        self.samples.clear();
        self.remaining_positions.clear();
        self.last_star_position = None;
        self.capture_retry_count = 0;
        self.fit_result = None;
        self.best_position = None;
        self.min_hfr = None;
        self.last_result = None;
        self.running = true;

        self.enter_checking_stars();
        Ok(())
    }

    /// Idempotent. Aborts any in-flight exposure and focuser motion and
    /// transitions to IDLE without clearing telemetry-derived fields.
    pub fn stop(&mut self) {
        if !self.running && matches!(self.state, AutoFocusState::Idle) {
            return;
        }
        let _ = self.camera.abort_exposure();
        let _ = self.focuser.abort();
        self.running = false;
        self.session_guard = None;
        self.phase = Phase::Idle;
        self.transition(AutoFocusState::Idle, "stopped by operator");
    }

    fn transition(&mut self, new_state: AutoFocusState, message: &str) {
        self.state = new_state;
        self.sink.notify(Event::StateChanged(StateChanged {
            component: Component::AutoFocus,
            state: new_state.as_str().to_string(),
            message: message.to_string(),
            percent: None,
        }));
    }

    fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.sink.notify(Event::LogMessage(LogMessage { level, text: text.into() }));
    }

    fn fail(&mut self, err: EngineError) {
        let _ = self.camera.abort_exposure();
        let _ = self.focuser.abort();
        self.running = false;
        self.session_guard = None;
        self.state = AutoFocusState::Error;
        self.sink.notify(Event::ErrorOccurred(ErrorOccurred { code: err.code().to_string(), text: err.to_string() }));
        self.last_result =
            Some(AutoFocusCompletedEvent { success: false, best_position: f64::NAN, min_hfr: f64::NAN });
        self.sink.notify(Event::AutoFocusCompleted(self.last_result.clone().unwrap()));
    }

    fn succeed(&mut self, best_position: f64, min_hfr: f64) {
        self.running = false;
        self.session_guard = None;
        self.state = AutoFocusState::Completed;
        self.last_result = Some(AutoFocusCompletedEvent { success: true, best_position, min_hfr });
        self.sink.notify(Event::AutoFocusCompleted(self.last_result.clone().unwrap()));
    }

    fn begin_move(&self, target: i32, distance_for_timeout: i32, with_anti_backlash: bool) -> PendingMove {
        let step = self.focuser_range.map(|r| r.step.max(1)).unwrap_or(1);
        let distance = distance_for_timeout.unsigned_abs() as i32;
        let tolerance = (self.options.move_tolerance_base + distance / 20).max(1);
        let timeout = crate::device::move_timeout_s(distance, 1.0, self.options.move_timeout_s);

        let anti_backlash_target = if with_anti_backlash {
            Some((target - self.options.anti_backlash_steps * step.signum().max(1)).max(
                self.focuser_range.map(|r| r.min).unwrap_or(i32::MIN),
            ))
        } else {
            None
        };

        if let Some(ab) = anti_backlash_target {
            let _ = self.focuser.move_absolute(ab);
        } else {
            let _ = self.focuser.move_absolute(target);
        }

        PendingMove {
            target,
            anti_backlash_target,
            elapsed_ticks: 0,
            last_seen_position: i32::MIN,
            stuck_ticks: 0,
            timeout_ticks: ticks_for(timeout),
            tolerance,
        }
    }

    fn begin_exposure(&self, seconds: f64) -> PendingExposure {
        let _ = self.camera.start_exposure(seconds);
        PendingExposure { elapsed_ticks: 0, timeout_ticks: ticks_for(30.0) }
    }

    /// Begins one sampling exposure, windowing the camera to an ROI around
    /// the last-seen brightest star for the fine stage if configured, or
    /// resetting to a full frame otherwise.
    fn begin_sampling_exposure(&self, stage: Stage) -> PendingExposure {
        if stage == Stage::Fine && self.options.roi_enabled {
            if let Some((x, y)) = self.last_star_position {
                let half = (self.options.roi_size_px / 2) as f64;
                let roi_x = (x - half).max(0.0) as u32;
                let roi_y = (y - half).max(0.0) as u32;
                let _ = self.camera.set_roi(roi_x, roi_y, self.options.roi_size_px, self.options.roi_size_px);
            }
        } else {
            let _ = self.camera.reset_frame();
        }
        self.begin_exposure(self.options.default_exposure)
    }

    /// Advances a pending move by one tick. `Ok(Some(pos))` once arrived
    /// (possibly "stuck" at `pos`), `Ok(None)` while still waiting, `Err`
    /// on hard timeout.
    fn poll_move(&mut self, pending: &mut PendingMove) -> Result<Option<i32>, EngineError> {
        let telemetry = self
            .focuser
            .telemetry()
            .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;

        pending.elapsed_ticks += 1;
        if telemetry.position == pending.last_seen_position {
            pending.stuck_ticks += 1;
        } else {
            pending.stuck_ticks = 0;
            pending.last_seen_position = telemetry.position;
        }

        if let Some(ab_target) = pending.anti_backlash_target {
            if (telemetry.position - ab_target).abs() <= pending.tolerance {
                pending.anti_backlash_target = None;
                pending.elapsed_ticks = 0;
                pending.stuck_ticks = 0;
                let _ = self.focuser.move_absolute(pending.target);
                return Ok(None);
            }
        } else if (telemetry.position - pending.target).abs() <= pending.tolerance {
            return Ok(Some(telemetry.position));
        }

        let stuck_timeout_ticks = ticks_for(self.options.stuck_timeout_s);
        if pending.stuck_ticks >= stuck_timeout_ticks && pending.anti_backlash_target.is_none() {
            self.log(LogLevel::Warn, "focuser stuck, proceeding at current position");
            return Ok(Some(telemetry.position));
        }

        if pending.elapsed_ticks >= pending.timeout_ticks {
            return Err(EngineError::MoveTimeout("focuser did not reach target in time".into()));
        }

        Ok(None)
    }

    /// `Ok(Some(path))` once the exposure completes, `Ok(None)` while
    /// waiting, `Err` on timeout.
    fn poll_exposure(&mut self, pending: &mut PendingExposure) -> Result<Option<PathBuf>, EngineError> {
        let telemetry = self
            .camera
            .telemetry()
            .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
        pending.elapsed_ticks += 1;
        if telemetry.capture_end {
            let path = self
                .camera
                .last_image_path()
                .map_err(|e| EngineError::CaptureFailed(e.to_string()))?;
            return Ok(Some(path));
        }
        if pending.elapsed_ticks >= pending.timeout_ticks {
            return Err(EngineError::CaptureFailed("exposure wait timed out".into()));
        }
        Ok(None)
    }

    fn enter_checking_stars(&mut self) {
        self.transition(AutoFocusState::CheckingStars, "checking for stars");
        let exposure = self.begin_exposure(self.options.default_exposure);
        self.phase = Phase::CheckingStars { exposure };
    }

    fn image_stats(&mut self, path: &std::path::Path) -> Result<Option<f64>, EngineError> {
        let stars = self
            .extractor
            .extract(path)
            .map_err(|e| EngineError::CaptureFailed(e.to_string()))?;
        if let Some(star) = brightest_star(&stars) {
            self.last_star_position = Some((star.x, star.y));
        }
        Ok(top_n_mean_hfr(&stars, self.options.top_n_stars, f64::MAX, f64::MAX))
    }

    fn enter_large_range_search(&mut self) {
        self.transition(AutoFocusState::LargeRangeSearch, "no stars found, searching full range");
        self.search_step_pct = self.options.step_pct;
        self.search_shots_taken = 0;
        let range = self.focuser_range.unwrap();
        let cur = self.start_position;
        self.search_direction_inward = (cur - range.min) > (range.max - cur);
        self.phase = Phase::LargeRangeSearch { move_: None, exposure: None };
    }

    fn enter_sampling(&mut self, stage: Stage) {
        self.transition(
            if stage == Stage::Coarse { AutoFocusState::CoarseAdjustment } else { AutoFocusState::FineAdjustment },
            "collecting focus samples",
        );
        self.samples.clear();
        let step = if stage == Stage::Coarse { self.options.coarse_step } else { self.options.fine_step };
        let n = self.options.measures.max(5);
        let center = self.start_position;
        let half = (n as i32 - 1) / 2;
        self.remaining_positions = (0..n as i32).map(|i| center + step * (i - half)).collect();

        let first_target = self.remaining_positions.remove(0);
        let move_ = self.begin_move(first_target, step, true);
        self.phase = Phase::Sampling { stage, move_: Some(move_), exposure: None, shots_collected: Vec::new() };
    }

    fn enter_fitting_data(&mut self) {
        self.transition(AutoFocusState::FittingData, "fitting focus curve");
        let filtered = filter_outliers(&self.samples);
        let fit = fit_quadratic(&filtered, self.options.epsilon_a, self.options.min_r_squared);
        self.fit_result = Some(fit);

        if fit.valid {
            self.best_position = Some(fit.best_position);
            self.min_hfr = Some(fit.min_hfr);
        } else if let Some(best) = interpolation_fallback(&self.samples) {
            self.log(LogLevel::Warn, "fit rejected, using interpolation fallback");
            self.best_position = Some(best.focuser_position as f64);
            self.min_hfr = Some(best.hfr);
        } else {
            self.fail(EngineError::NoStarsFound("no focus samples to fit".into()));
            return;
        }

        self.enter_moving_to_best();
    }

    fn enter_moving_to_best(&mut self) {
        self.transition(AutoFocusState::MovingToBestPosition, "moving to best focus position");
        let target = self.best_position.unwrap().round() as i32;
        let distance = (target - self.start_position).abs();
        let mut move_ = self.begin_move(target, distance, true);
        move_.tolerance = self.options.best_position_tolerance;
        move_.timeout_ticks = ticks_for(self.options.best_position_timeout_s);
        self.phase = Phase::MovingToBestPosition { move_ };
    }

    /// Advance the state machine by one 100 ms tick.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}

            Phase::CheckingStars { mut exposure } => match self.poll_exposure(&mut exposure) {
                Ok(None) => self.phase = Phase::CheckingStars { exposure },
                Ok(Some(path)) => match self.image_stats(&path) {
                    Ok(Some(mean_hfr)) => {
                        if mean_hfr > self.options.hfr_threshold {
                            self.enter_sampling(Stage::Coarse);
                        } else {
                            self.enter_sampling(Stage::Fine);
                        }
                    }
                    Ok(None) => self.enter_large_range_search(),
                    Err(e) => self.fail(e),
                },
                Err(e) => self.fail(e),
            },

            Phase::LargeRangeSearch { move_, exposure } => self.tick_large_range_search(move_, exposure),

            Phase::Sampling { stage, move_, exposure, shots_collected } => {
                self.tick_sampling(stage, move_, exposure, shots_collected)
            }

            Phase::MovingToBestPosition { mut move_ } => match self.poll_move(&mut move_) {
                Ok(Some(_)) => {
                    let best = self.best_position.unwrap();
                    let hfr = self.min_hfr.unwrap();
                    self.succeed(best, hfr);
                }
                Ok(None) => self.phase = Phase::MovingToBestPosition { move_ },
                Err(e) => self.fail(e),
            },
        }
    }

    fn tick_large_range_search(&mut self, move_: Option<PendingMove>, exposure: Option<PendingExposure>) {
        if let Some(mut m) = move_ {
            match self.poll_move(&mut m) {
                Ok(Some(_)) => {
                    let exposure = self.begin_exposure(self.options.default_exposure);
                    self.phase = Phase::LargeRangeSearch { move_: None, exposure: Some(exposure) };
                }
                Ok(None) => self.phase = Phase::LargeRangeSearch { move_: Some(m), exposure: None },
                Err(e) => self.fail(e),
            }
            return;
        }

        let Some(mut exp) = exposure else {
            self.dispatch_next_search_step();
            return;
        };

        match self.poll_exposure(&mut exp) {
            Ok(None) => self.phase = Phase::LargeRangeSearch { move_: None, exposure: Some(exp) },
            Ok(Some(path)) => {
                self.search_shots_taken += 1;
                match self.image_stats(&path) {
                    Ok(Some(_)) => self.enter_checking_stars(),
                    Ok(None) => {
                        if self.search_shots_taken >= self.options.max_search_shots {
                            self.fail(EngineError::NoStarsFound("search budget exhausted".into()));
                        } else {
                            self.dispatch_next_search_step();
                        }
                    }
                    Err(e) => self.fail(e),
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn dispatch_next_search_step(&mut self) {
        let range = self.focuser_range.unwrap();
        let span = (range.max - range.min) as f64;
        let step = (self.search_step_pct * span).round() as i32;

        let telemetry = match self.focuser.telemetry() {
            Ok(t) => t,
            Err(e) => {
                self.fail(EngineError::DeviceUnavailable(e.to_string()));
                return;
            }
        };

        let signed_step = if self.search_direction_inward { -step } else { step };
        let mut target = telemetry.position + signed_step;

        if target <= range.min || target >= range.max {
            target = target.clamp(range.min, range.max);
            self.search_direction_inward = !self.search_direction_inward;
            self.search_step_pct = (self.search_step_pct / 2.0).max(self.options.min_step_pct);
        }

        let move_ = self.begin_move(target, step, false);
        self.phase = Phase::LargeRangeSearch { move_: Some(move_), exposure: None };
    }

    fn tick_sampling(
        &mut self,
        stage: Stage,
        move_: Option<PendingMove>,
        exposure: Option<PendingExposure>,
        shots_collected: Vec<f64>,
    ) {
        if let Some(mut m) = move_ {
            match self.poll_move(&mut m) {
                Ok(Some(_)) => {
                    let exp = self.begin_sampling_exposure(stage);
                    self.phase = Phase::Sampling { stage, move_: None, exposure: Some(exp), shots_collected };
                }
                Ok(None) => self.phase = Phase::Sampling { stage, move_: Some(m), exposure: None, shots_collected },
                Err(e) => self.fail(e),
            }
            return;
        }

        let Some(mut exp) = exposure else {
            self.phase = Phase::Sampling { stage, move_: None, exposure: None, shots_collected };
            return;
        };

        match self.poll_exposure(&mut exp) {
            Ok(None) => self.phase = Phase::Sampling { stage, move_: None, exposure: Some(exp), shots_collected },
            Ok(Some(path)) => {
                let wanted_shots = if stage == Stage::Coarse {
                    self.options.shots_per_position_coarse
                } else {
                    self.options.shots_per_position_fine
                };
                match self.image_stats(&path) {
                    Ok(Some(mean_hfr)) => {
                        self.capture_retry_count = 0;
                        let mut shots = shots_collected;
                        shots.push(mean_hfr);
                        if shots.len() >= wanted_shots {
                            self.finish_one_position(stage, shots);
                        } else {
                            let exp = self.begin_sampling_exposure(stage);
                            self.phase = Phase::Sampling { stage, move_: None, exposure: Some(exp), shots_collected: shots };
                        }
                    }
                    Ok(None) | Err(_) => self.retry_or_fail_capture(stage, shots_collected),
                }
            }
            Err(_) => self.retry_or_fail_capture(stage, shots_collected),
        }
    }

    fn retry_or_fail_capture(&mut self, stage: Stage, shots_collected: Vec<f64>) {
        self.capture_retry_count += 1;
        if self.capture_retry_count > self.options.max_retry {
            self.fail(EngineError::CaptureFailed("capture retries exhausted".into()));
            return;
        }
        self.log(LogLevel::Warn, format!("capture failed, retry {}/{}", self.capture_retry_count, self.options.max_retry));
        let exp = self.begin_sampling_exposure(stage);
        self.phase = Phase::Sampling { stage, move_: None, exposure: Some(exp), shots_collected };
    }

    fn finish_one_position(&mut self, stage: Stage, shots: Vec<f64>) {
        let focuser_position = match self.focuser.telemetry() {
            Ok(t) => t.position,
            Err(e) => {
                self.fail(EngineError::DeviceUnavailable(e.to_string()));
                return;
            }
        };
        self.samples.push(FocusSample::from_measurements(focuser_position, shots));

        if self.remaining_positions.is_empty() {
            self.enter_fitting_data();
            return;
        }

        let next_target = self.remaining_positions.remove(0);
        let step = if stage == Stage::Coarse { self.options.coarse_step } else { self.options.fine_step };
        let move_ = self.begin_move(next_target, step, true);
        self.phase = Phase::Sampling { stage, move_: Some(move_), exposure: None, shots_collected: Vec::new() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CameraTelemetry, FocuserTelemetry, MountMotionStatus, MountTelemetry, OnCoordSetAction};
    use crate::star_extractor::Star;
    use std::sync::Mutex;

    struct FakeCamera {
        exposing_ticks_left: Mutex<i32>,
        image_path: PathBuf,
    }
    impl Camera for FakeCamera {
        fn start_exposure(&self, _seconds: f64) -> Result<(), EngineError> {
            *self.exposing_ticks_left.lock().unwrap() = 2;
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
            let mut left = self.exposing_ticks_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
            }
            Ok(CameraTelemetry { capture_end: *left == 0, exposing: *left > 0 })
        }
        fn last_image_path(&self) -> Result<PathBuf, EngineError> {
            Ok(self.image_path.clone())
        }
    }

    struct FakeFocuser {
        position: Mutex<i32>,
        range: FocuserRange,
    }
    impl Focuser for FakeFocuser {
        fn position_range(&self) -> Result<FocuserRange, EngineError> {
            Ok(self.range)
        }
        fn telemetry(&self) -> Result<FocuserTelemetry, EngineError> {
            Ok(FocuserTelemetry { position: *self.position.lock().unwrap(), moving: false })
        }
        fn set_direction(&self, _inward: bool) -> Result<(), EngineError> {
            Ok(())
        }
        fn move_relative(&self, steps: i32) -> Result<(), EngineError> {
            *self.position.lock().unwrap() += steps;
            Ok(())
        }
        fn move_absolute(&self, position: i32) -> Result<(), EngineError> {
            *self.position.lock().unwrap() = position.clamp(self.range.min, self.range.max);
            Ok(())
        }
        fn abort(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct FakeMount;
    impl Mount for FakeMount {
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

    /// Reports a single synthetic star whose HFR follows a parabola of the
    /// current focuser position, with the minimum at `best`.
    struct ParabolicExtractor {
        focuser: Arc<FakeFocuser>,
        best: f64,
    }
    impl StarExtractor for ParabolicExtractor {
        fn extract(&self, _path: &std::path::Path) -> anyhow::Result<Vec<Star>> {
            let pos = *self.focuser.position.lock().unwrap() as f64;
            let hfr = 0.0005 * (pos - self.best).powi(2) + 1.2;
            Ok(vec![Star { x: 50.0, y: 50.0, peak: 900.0, flux: 9000.0, hfr, ellipticity: 0.05 }])
        }
    }

    struct NoStarsExtractor;
    impl StarExtractor for NoStarsExtractor {
        fn extract(&self, _path: &std::path::Path) -> anyhow::Result<Vec<Star>> {
            Ok(vec![])
        }
    }

    struct NullSink;
    impl EventSink for NullSink {
        fn notify(&self, _event: Event) {}
    }

    fn run_to_completion(engine: &mut AutoFocusEngine, max_ticks: usize) {
        for _ in 0..max_ticks {
            if !engine.is_running() {
                return;
            }
            engine.tick();
        }
        panic!("engine did not finish within {max_ticks} ticks, state={:?}", engine.state());
    }

    fn build_engine(best: f64, threshold: f64) -> (AutoFocusEngine, Arc<FakeFocuser>) {
        let focuser = Arc::new(FakeFocuser {
            position: Mutex::new(5000),
            range: FocuserRange { min: 0, max: 10_000, step: 10 },
        });
        let camera = Arc::new(FakeCamera { exposing_ticks_left: Mutex::new(0), image_path: PathBuf::from("/tmp/x.fits") });
        let mount = Arc::new(FakeMount);
        let extractor = Arc::new(ParabolicExtractor { focuser: Arc::clone(&focuser), best });
        let mut options = AutoFocusOptions::default();
        options.hfr_threshold = threshold;
        let engine = AutoFocusEngine::new(camera, focuser.clone(), mount, extractor, Arc::new(NullSink), options);
        (engine, focuser)
    }

    #[test]
    fn completes_successfully_for_well_behaved_parabola() {
        let (mut engine, _focuser) = build_engine(5000.0, 100.0);
        engine.start().unwrap();
        run_to_completion(&mut engine, 2000);
        let result = engine.last_result().unwrap();
        assert!(result.success);
        assert!((result.best_position - 5000.0).abs() < 50.0, "{}", result.best_position);
    }

    #[test]
    fn enters_large_range_search_when_no_stars_then_recovers() {
        let focuser = Arc::new(FakeFocuser { position: Mutex::new(5000), range: FocuserRange { min: 0, max: 10_000, step: 10 } });
        let camera = Arc::new(FakeCamera { exposing_ticks_left: Mutex::new(0), image_path: PathBuf::from("/tmp/x.fits") });
        let mount = Arc::new(FakeMount);
        let extractor = Arc::new(NoStarsExtractor);
        let options = AutoFocusOptions::default();
        let mut engine = AutoFocusEngine::new(camera, focuser, mount, extractor, Arc::new(NullSink), options);
        engine.start().unwrap();
        engine.tick();
        engine.tick();
        engine.tick();
        assert_eq!(engine.state(), AutoFocusState::LargeRangeSearch);
    }

    #[test]
    fn stop_is_idempotent_and_reaches_idle_quickly() {
        let (mut engine, _focuser) = build_engine(5000.0, 100.0);
        engine.start().unwrap();
        engine.tick();
        engine.stop();
        assert_eq!(engine.state(), AutoFocusState::Idle);
        assert!(!engine.is_running());
        engine.stop();
        assert_eq!(engine.state(), AutoFocusState::Idle);
    }

    #[test]
    fn start_after_stop_behaves_like_fresh_start() {
        let (mut engine, _focuser) = build_engine(5000.0, 100.0);
        engine.start().unwrap();
        engine.tick();
        engine.stop();
        engine.start().unwrap();
        assert_eq!(engine.state(), AutoFocusState::CheckingStars);
        assert!(engine.samples().is_empty());
    }

    #[test]
    fn cannot_start_twice() {
        let (mut engine, _focuser) = build_engine(5000.0, 100.0);
        engine.start().unwrap();
        let err = engine.start().unwrap_err();
        assert_eq!(err, EngineError::AlreadyRunning);
    }

    #[test]
    fn fine_stage_samples_have_exact_shot_count_and_mean() {
        let (mut engine, _focuser) = build_engine(5000.0, 100.0);
        engine.start().unwrap();
        run_to_completion(&mut engine, 2000);
        for sample in engine.samples() {
            assert_eq!(sample.measurements.len(), engine.options.shots_per_position_fine);
            let mean = sample.measurements.iter().sum::<f64>() / sample.measurements.len() as f64;
            assert!((sample.hfr - mean).abs() < 1e-9);
        }
    }
}
