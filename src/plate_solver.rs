//! Plate solver trait: given an image, return its celestial coordinates.
//! `solve()`/`poll()` are split so the engine can poll for completion
//! instead of blocking on the solver.

use std::path::Path;

use crate::geometry::CelestialDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverMode {
    /// Mode 0: no hints, full blind solve.
    Blind,
    /// Mode 1: field-of-view hint only.
    WithFieldOfView,
    /// Mode 2: field-of-view plus a last-known RA/Dec search window.
    WithFieldOfViewAndPosition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlateSolveConfig {
    pub mode: SolverMode,
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
    pub hint: Option<CelestialDirection>,
    pub timeout_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlateSolveRecord {
    pub principal_point: CelestialDirection,
    pub corners: [CelestialDirection; 4],
    pub field_width_deg: f64,
    pub field_height_deg: f64,
}

pub enum PlateSolveStatus {
    Waiting,
    Done(PlateSolveRecord),
    Failed,
}

pub trait PlateSolver: Send + Sync {
    fn solve(&mut self, image_path: &Path, config: &PlateSolveConfig) -> anyhow::Result<()>;
    fn poll(&mut self) -> anyhow::Result<PlateSolveStatus>;
    fn abort(&mut self);
}

/// Picks the narrowest solver mode whose preconditions are satisfied, with
/// fallback to the next broader mode left to the caller on failure.
pub fn select_solver_mode(
    deviation_deg: Option<f64>,
    last_known_offset_deg: Option<f64>,
    solve_mode1_max_offset_deg: f64,
    solve_mode2_max_offset_deg: f64,
    small_deviation_threshold_deg: f64,
) -> SolverMode {
    let small_deviation = deviation_deg.map(|d| d <= small_deviation_threshold_deg).unwrap_or(false);

    if small_deviation {
        if let Some(offset) = last_known_offset_deg {
            if offset <= solve_mode2_max_offset_deg {
                return SolverMode::WithFieldOfViewAndPosition;
            }
        }
    }
    if let Some(offset) = last_known_offset_deg {
        if offset <= solve_mode1_max_offset_deg {
            return SolverMode::WithFieldOfView;
        }
    }
    SolverMode::Blind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_mode2_when_close_and_small_deviation() {
        let mode = select_solver_mode(Some(0.1), Some(0.5), 5.0, 1.0, 0.5);
        assert_eq!(mode, SolverMode::WithFieldOfViewAndPosition);
    }

    #[test]
    fn selects_mode1_when_within_fov_but_not_mode2() {
        let mode = select_solver_mode(Some(2.0), Some(3.0), 5.0, 1.0, 0.5);
        assert_eq!(mode, SolverMode::WithFieldOfView);
    }

    #[test]
    fn falls_back_to_blind_with_no_hints() {
        let mode = select_solver_mode(None, None, 5.0, 1.0, 0.5);
        assert_eq!(mode, SolverMode::Blind);
    }
}
