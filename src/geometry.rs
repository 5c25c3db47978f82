//! Spherical geometry used by both engines: unit-vector conversions,
//! great-circle distance, Rodrigues rotation and tangent-plane log/exp
//! maps. All pole/target/guidance math here operates on unit vectors
//! rather than RA/DEC arithmetic, to avoid pole-singularity bugs.

use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// A point on the celestial sphere, or anywhere expressed as RA/Dec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CelestialDirection {
    /// Right ascension in degrees, `[0, 360)`.
    pub ra_deg: f64,
    /// Declination in degrees, `[-90, 90]`.
    pub dec_deg: f64,
}

impl CelestialDirection {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg: normalize_ra_deg(ra_deg), dec_deg }
    }

    pub fn to_unit_vector(&self) -> Vec3 {
        let ra = self.ra_deg.to_radians();
        let dec = self.dec_deg.to_radians();
        let cd = dec.cos();
        Vec3 { x: cd * ra.cos(), y: cd * ra.sin(), z: dec.sin() }
    }

    pub fn from_unit_vector(v: &Vec3) -> Self {
        let dec = v.z.atan2((v.x * v.x + v.y * v.y).sqrt());
        let mut ra = v.y.atan2(v.x);
        if ra < 0.0 {
            ra += 2.0 * PI;
        }
        Self { ra_deg: ra.to_degrees(), dec_deg: dec.to_degrees() }
    }
}

fn normalize_ra_deg(mut ra: f64) -> f64 {
    while ra < 0.0 {
        ra += 360.0;
    }
    while ra >= 360.0 {
        ra -= 360.0;
    }
    ra
}

/// Great-circle angular distance between two celestial directions, in
/// degrees. Uses the dot-product form clipped to `[-1, 1]` as specified.
pub fn great_circle_distance_deg(a: &CelestialDirection, b: &CelestialDirection) -> f64 {
    angle_between(&a.to_unit_vector(), &b.to_unit_vector()).to_degrees()
}

/// Angle in radians between two unit vectors, `arccos(clip(p.q, -1, 1))`.
pub fn angle_between(p: &Vec3, q: &Vec3) -> f64 {
    p.dot(q).clamp(-1.0, 1.0).acos()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3 { x: self.x - other.x, y: self.y - other.y, z: self.z - other.z }
    }

    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3 { x: self.x + other.x, y: self.y + other.y, z: self.z + other.z }
    }

    pub fn scale(&self, k: f64) -> Vec3 {
        Vec3 { x: self.x * k, y: self.y * k, z: self.z * k }
    }

    pub fn length(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Returns `None` for a zero (or near-zero) vector, instead of
    /// producing NaNs.
    pub fn normalized(&self) -> Option<Vec3> {
        let len = self.length();
        if len < 1e-12 {
            None
        } else {
            Some(self.scale(1.0 / len))
        }
    }
}

/// Rodrigues rotation of `v` by `angle_rad` around the unit `axis`.
pub fn rotate_around_axis(v: &Vec3, axis: &Vec3, angle_rad: f64) -> Vec3 {
    let (s, c) = angle_rad.sin_cos();
    v.scale(c)
        .add(&axis.cross(v).scale(s))
        .add(&axis.scale(axis.dot(v) * (1.0 - c)))
}

/// Smallest rotation mapping unit vector `from` onto unit vector `to`,
/// applied to `point`. Handles the two degenerate cases: `from == to`
/// (identity) and `from == -to` (180° about any perpendicular axis).
pub fn rotate_by_minimal_rotation(point: &Vec3, from: &Vec3, to: &Vec3) -> Vec3 {
    const EPS: f64 = 1e-9;
    let cos_angle = from.dot(to).clamp(-1.0, 1.0);
    if cos_angle >= 1.0 - EPS {
        return *point;
    }
    if cos_angle <= -1.0 + EPS {
        let axis = arbitrary_perpendicular(from);
        return rotate_around_axis(point, &axis, PI);
    }
    let axis = from.cross(to).normalized().expect("non-parallel vectors have a cross product");
    let angle = cos_angle.acos();
    rotate_around_axis(point, &axis, angle)
}

fn arbitrary_perpendicular(v: &Vec3) -> Vec3 {
    let candidate =
        if v.x.abs() < 0.9 { Vec3::new(1.0, 0.0, 0.0) } else { Vec3::new(0.0, 1.0, 0.0) };
    candidate
        .sub(&v.scale(candidate.dot(v)))
        .normalized()
        .expect("candidate is not parallel to v by construction")
}

/// Orthonormal east/north basis of the tangent plane at `center`: north is
/// the component of the sphere's polar axis (+Z) perpendicular to
/// `center`, east completes the right-handed frame.
pub struct TangentBasis {
    pub east: Vec3,
    pub north: Vec3,
}

impl TangentBasis {
    pub fn at(center: &Vec3) -> Self {
        let z_axis = Vec3::new(0.0, 0.0, 1.0);
        let north = center
            .cross(&z_axis)
            .cross(center)
            .normalized()
            .unwrap_or(Vec3::new(1.0, 0.0, 0.0));
        let east = north.cross(center).normalized().unwrap_or(Vec3::new(0.0, 1.0, 0.0));
        Self { east, north }
    }
}

/// Logarithmic map of `target` into the tangent plane at `center` with the
/// given basis: returns `(u_east, v_north)` in radians. This is the
/// gnomonic-style small-angle projection used for both the small-circle fit
/// residual direction and the live guide offset.
pub fn log_map(center: &Vec3, basis: &TangentBasis, target: &Vec3) -> (f64, f64) {
    let theta = angle_between(center, target);
    if theta < 1e-12 {
        return (0.0, 0.0);
    }
    let rejected = target.sub(&center.scale(center.dot(target)));
    let rejected = rejected.normalized().unwrap_or(Vec3::ZERO);
    let u = rejected.dot(&basis.east) * theta;
    let v = rejected.dot(&basis.north) * theta;
    (u, v)
}

/// Exponential map: inverse of [`log_map`], used to reconstruct a point from
/// a small tangent-plane offset.
pub fn exp_map(center: &Vec3, basis: &TangentBasis, u: f64, v: f64) -> Vec3 {
    let theta = (u * u + v * v).sqrt();
    if theta < 1e-12 {
        return *center;
    }
    let dir = basis.east.scale(u / theta).add(&basis.north.scale(v / theta));
    center.scale(theta.cos()).add(&dir.scale(theta.sin()))
}

/// Atmospheric refraction correction in radians for a given altitude in
/// radians, same cotangent-of-zenith-distance approximation as
/// `sky_math::solar_system::calc_atmospheric_refraction`.
pub fn atmospheric_refraction_rad(alt_rad: f64) -> f64 {
    const MIN_ALT_DEG: f64 = 3.0;
    let zenith_dist = 0.5 * PI - alt_rad.max(MIN_ALT_DEG.to_radians());
    const A: f64 = 57.085 / 3600.0 * PI / 180.0;
    const B: f64 = 0.0666 / 3600.0 * PI / 180.0;
    A * zenith_dist.tan() - B * zenith_dist.tan()
}

/// Greenwich mean sidereal time in degrees at the given instant.
pub fn gmst_deg(time: &NaiveDateTime) -> f64 {
    let jd = julian_time(time);
    let t = julian_centuries(time);
    let gmst = 280.460_618_37 + 360.985_647_366_29 * (jd - 2_451_545.0) + 0.000_387_933 * t * t - t * t * t / 38_710_000.0;
    normalize_ra_deg(gmst)
}

/// Local sidereal time in degrees for an east-positive longitude.
pub fn lst_deg(longitude_deg: f64, time: &NaiveDateTime) -> f64 {
    normalize_ra_deg(gmst_deg(time) + longitude_deg)
}

/// Parallactic rotation shared by both equatorial/horizontal directions:
/// swapping `(hour_angle, dec)` for `(az, alt)` and back uses the same
/// spherical-triangle formula with `lat` fixed, so one function serves
/// both `equatorial_to_horizontal` and `horizontal_to_equatorial`.
fn parallactic_rotate(h_or_az: f64, dec_or_alt: f64, lat_rad: f64) -> (f64, f64) {
    let out1 = (dec_or_alt.sin() * lat_rad.sin() + dec_or_alt.cos() * lat_rad.cos() * h_or_az.cos()).asin();
    let out2 = (-h_or_az.sin() * dec_or_alt.cos())
        .atan2(lat_rad.cos() * dec_or_alt.sin() - lat_rad.sin() * dec_or_alt.cos() * h_or_az.cos());
    (out1, out2)
}

/// Converts an equatorial direction to horizontal `(alt_rad, az_rad)` for
/// an observer at `latitude_deg`/`longitude_deg` at `time`.
pub fn equatorial_to_horizontal(point: &CelestialDirection, latitude_deg: f64, longitude_deg: f64, time: &NaiveDateTime) -> (f64, f64) {
    let lat = latitude_deg.to_radians();
    let h = (lst_deg(longitude_deg, time) - point.ra_deg).to_radians();
    let dec = point.dec_deg.to_radians();
    parallactic_rotate(h, dec, lat)
}

/// Inverse of [`equatorial_to_horizontal`].
pub fn horizontal_to_equatorial(alt_rad: f64, az_rad: f64, latitude_deg: f64, longitude_deg: f64, time: &NaiveDateTime) -> CelestialDirection {
    let lat = latitude_deg.to_radians();
    let (dec, h) = parallactic_rotate(az_rad, alt_rad, lat);
    let ra_deg = normalize_ra_deg(lst_deg(longitude_deg, time) - h.to_degrees());
    CelestialDirection::new(ra_deg, dec.to_degrees())
}

/// Applies the atmospheric refraction correction to a plate-solved
/// equatorial point: converts to horizontal, nudges altitude by
/// [`atmospheric_refraction_rad`], and converts back.
pub fn apply_atmospheric_refraction(point: &CelestialDirection, latitude_deg: f64, longitude_deg: f64, time: &NaiveDateTime) -> CelestialDirection {
    let (alt, az) = equatorial_to_horizontal(point, latitude_deg, longitude_deg, time);
    let corrected_alt = alt + atmospheric_refraction_rad(alt);
    horizontal_to_equatorial(corrected_alt, az, latitude_deg, longitude_deg, time)
}

pub fn julian_day(date: &NaiveDate) -> i64 {
    let mon = date.month() as i64;
    let day = date.day() as i64;
    let year = date.year() as i64;
    let a = (14 - mon) / 12;
    let y = year + 4800 - a;
    let m = mon + 12 * a - 3;
    day + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045
}

pub fn julian_time(dt: &NaiveDateTime) -> f64 {
    let jd = julian_day(&dt.date()) as f64;
    let hour = dt.hour() as f64;
    let min = dt.minute() as f64;
    let mut sec = dt.second() as f64;
    sec += (dt.nanosecond() / 1_000_000) as f64 / 1000.0;
    jd + (hour - 12.0) / 24.0 + min / 1440.0 + sec / 86400.0
}

pub fn julian_centuries(dt: &NaiveDateTime) -> f64 {
    (julian_time(dt) - 2_451_545.0) / 36525.0
}

/// True celestial pole at the given site and time, corrected for
/// precession since J2000 (50.29"/yr in RA, 20.04"/yr in DEC).
/// Northern hemisphere sites (`latitude_deg >= 0`) use the north pole
/// (ra=0, dec=+90); southern sites mirror to (ra=180, dec=-90).
pub fn true_pole(latitude_deg: f64, time: &NaiveDateTime) -> CelestialDirection {
    let years_since_j2000 = julian_centuries(time) * 100.0;
    const PRECESSION_RA_ARCSEC_PER_YEAR: f64 = 50.29;
    const PRECESSION_DEC_ARCSEC_PER_YEAR: f64 = 20.04;
    let d_ra_deg = PRECESSION_RA_ARCSEC_PER_YEAR * years_since_j2000 / 3600.0;
    let d_dec_deg = PRECESSION_DEC_ARCSEC_PER_YEAR * years_since_j2000 / 3600.0;

    if latitude_deg >= 0.0 {
        CelestialDirection::new(d_ra_deg, (90.0 - d_dec_deg.abs()).min(90.0))
    } else {
        CelestialDirection::new(180.0 + d_ra_deg, -(90.0 - d_dec_deg.abs()).min(90.0))
    }
}
