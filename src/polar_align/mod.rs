//! Polar-alignment geometry helpers: fitting the mount's actual rotation
//! pole from three tracked points, and expressing the error between that
//! pole and the true celestial pole as a guidance offset, built on this
//! crate's own `geometry` primitives.

pub mod engine;

use crate::geometry::{CelestialDirection, TangentBasis};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MountPoleFit {
    pub pole: CelestialDirection,
    /// RMS of the three points' angular distance to `pole`, degrees. Large
    /// values mean the three capture points were closer to collinear than
    /// to a genuine small circle around an axis.
    pub rms_deg: f64,
    /// `(1 / (1 + (rms/mean)²)) · spreadGain`, spreadGain = clip(min pairwise
    /// separation / 5°, 0, 1) — how much to trust this fit.
    pub confidence: f64,
}

/// Three points tracked while the mount carries its tracking axis around
/// RA at constant Dec lie on a small circle centred on the mount's actual
/// pole; that circle's plane is perpendicular to the pole direction, so the
/// pole is (up to sign) the normal of the plane through the three points.
///
/// `p_true` disambiguates the plane normal's sign: the hemisphere near the
/// true celestial pole is kept.
///
/// Returns `None` if the three points are closer to collinear than
/// `min_pair_separation_deg` allows (degenerate geometry).
pub fn calc_mount_pole(
    p1: CelestialDirection,
    p2: CelestialDirection,
    p3: CelestialDirection,
    p_true: CelestialDirection,
    min_pair_separation_deg: f64,
) -> Option<MountPoleFit> {
    let v1 = p1.to_unit_vector();
    let v2 = p2.to_unit_vector();
    let v3 = p3.to_unit_vector();

    let sep12 = crate::geometry::angle_between(&v1, &v2).to_degrees();
    let sep23 = crate::geometry::angle_between(&v2, &v3).to_degrees();
    let sep13 = crate::geometry::angle_between(&v1, &v3).to_degrees();
    let min_sep = sep12.min(sep23).min(sep13);
    if min_sep < min_pair_separation_deg {
        return None;
    }

    let normal = v2.sub(&v1).cross(&v3.sub(&v1)).normalized()?;

    // Orient the normal toward whichever of +normal/-normal is closer to
    // the true celestial pole, so it points at "the pole near here" rather
    // than its antipode.
    let true_vec = p_true.to_unit_vector();
    let pole_vec = if normal.dot(&true_vec) >= 0.0 { normal } else { normal.scale(-1.0) };
    let pole = CelestialDirection::from_unit_vector(&pole_vec);

    let angles_deg = [
        crate::geometry::angle_between(&v1, &pole_vec).to_degrees(),
        crate::geometry::angle_between(&v2, &pole_vec).to_degrees(),
        crate::geometry::angle_between(&v3, &pole_vec).to_degrees(),
    ];
    let mean = angles_deg.iter().sum::<f64>() / 3.0;
    let variance = angles_deg.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / 3.0;
    let rms_deg = variance.sqrt();

    let spread_gain = (min_sep / 5.0).clamp(0.0, 1.0);
    let confidence = if mean > 0.0 { (1.0 / (1.0 + (rms_deg / mean).powi(2))) * spread_gain } else { 0.0 };

    Some(MountPoleFit { pole, rms_deg, confidence })
}

/// East/north tangent-plane offset of `mount_pole` from `true_pole`,
/// degrees, using the true pole as the tangent point (matches how
/// `PolarGuideData` reports `offset_east_deg`/`offset_north_deg`).
pub fn pole_error(mount_pole: CelestialDirection, true_pole: CelestialDirection) -> (f64, f64) {
    let center = true_pole.to_unit_vector();
    let basis = TangentBasis::at(&center);
    let (u, v) = crate::geometry::log_map(&center, &basis, &mount_pole.to_unit_vector());
    (u.to_degrees(), v.to_degrees())
}

/// Rotates `point` by `angle_deg` of RA around `pole`, used to predict
/// where a reference star will be after the mount has tracked/slewed
/// around its own (possibly misaligned) axis.
pub fn rotate_point_around_pole(point: CelestialDirection, pole: CelestialDirection, angle_deg: f64) -> CelestialDirection {
    let rotated = crate::geometry::rotate_around_axis(&point.to_unit_vector(), &pole.to_unit_vector(), angle_deg.to_radians());
    CelestialDirection::from_unit_vector(&rotated)
}
