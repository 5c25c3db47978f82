//! Tunables for both engines: one `serde` round-trippable struct per
//! concern, `#[serde(default)]` plus a hand-written `Default` impl so a
//! partially-specified configuration blob still produces sane values.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AutoFocusOptions {
    pub hfr_threshold: f64,
    pub coarse_step: i32,
    pub fine_step: i32,
    pub measures: usize,
    pub shots_per_position_coarse: usize,
    pub shots_per_position_fine: usize,
    pub default_exposure: f64,
    pub step_pct: f64,
    pub min_step_pct: f64,
    pub max_search_shots: usize,
    pub top_n_stars: usize,
    pub min_r_squared: f64,
    pub epsilon_a: f64,
    pub anti_backlash_steps: i32,
    pub max_retry: usize,
    pub move_tolerance_base: i32,
    pub stuck_timeout_s: f64,
    pub move_timeout_s: f64,
    pub best_position_tolerance: i32,
    pub best_position_timeout_s: f64,
    /// If set, fine-stage exposures are windowed to a square region of this
    /// size (pixels) centred on the brightest star seen so far, instead of
    /// reading out the full frame.
    pub roi_enabled: bool,
    pub roi_size_px: u32,
}

impl Default for AutoFocusOptions {
    fn default() -> Self {
        Self {
            hfr_threshold: 4.0,
            coarse_step: 200,
            fine_step: 50,
            measures: 5,
            shots_per_position_coarse: 1,
            shots_per_position_fine: 3,
            default_exposure: 2.0,
            step_pct: 0.1,
            min_step_pct: 0.01,
            max_search_shots: 20,
            top_n_stars: 5,
            min_r_squared: 0.7,
            epsilon_a: 1e-6,
            anti_backlash_steps: 4,
            max_retry: 3,
            move_tolerance_base: 5,
            stuck_timeout_s: 10.0,
            move_timeout_s: 300.0,
            best_position_tolerance: 10,
            best_position_timeout_s: 60.0,
            roi_enabled: false,
            roi_size_px: 200,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolarAlignDirection {
    #[default]
    East,
    West,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PolarAlignOptions {
    pub direction: PolarAlignDirection,
    pub ra_rotation_angle_deg: f64,
    pub dec_rotation_angle_deg: f64,
    pub short_exposure_s: f64,
    pub long_exposure_s: f64,
    pub capture_timeout_s: f64,
    pub solve_timeout_s: f64,
    pub solve_mode1_max_offset_deg: f64,
    pub solve_mode2_max_offset_deg: f64,
    pub small_deviation_threshold_deg: f64,
    pub large_deviation_threshold_deg: f64,
    pub final_verification_threshold_deg: f64,
    pub min_pair_separation_deg: f64,
    pub bad_geometry_rms_threshold_deg: f64,
    pub mount_arrival_timeout_s: f64,
    pub mount_poll_period_s: f64,
}

impl Default for PolarAlignOptions {
    fn default() -> Self {
        Self {
            direction: PolarAlignDirection::East,
            ra_rotation_angle_deg: 30.0,
            dec_rotation_angle_deg: 30.0,
            short_exposure_s: 5.0,
            long_exposure_s: 20.0,
            capture_timeout_s: 30.0,
            solve_timeout_s: 30.0,
            solve_mode1_max_offset_deg: 5.0,
            solve_mode2_max_offset_deg: 1.0,
            small_deviation_threshold_deg: 0.5,
            large_deviation_threshold_deg: 3.0,
            final_verification_threshold_deg: 0.05,
            min_pair_separation_deg: 0.01,
            bad_geometry_rms_threshold_deg: 0.3,
            mount_arrival_timeout_s: 60.0,
            mount_poll_period_s: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SiteOptions {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

impl Default for SiteOptions {
    fn default() -> Self {
        Self { latitude_deg: 0.0, longitude_deg: 0.0 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CameraOptions {
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self { focal_length_mm: 600.0, sensor_width_mm: 23.5, sensor_height_mm: 15.7 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Options {
    pub auto_focus: AutoFocusOptions,
    pub polar_align: PolarAlignOptions,
    pub site: SiteOptions,
    pub camera: CameraOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_round_trip_through_json() {
        let opts = Options::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let partial: Options = serde_json::from_str(r#"{"site":{"latitude_deg":51.5}}"#).unwrap();
        assert_eq!(partial.site.latitude_deg, 51.5);
        assert_eq!(partial.auto_focus, AutoFocusOptions::default());
    }
}
