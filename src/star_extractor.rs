//! Star extraction trait boundary: given an image, return detected stars.
//! The extractor implementation itself lives outside this crate. This
//! module also carries the auto-focus engine's star-scoring function,
//! which belongs to the engine rather than the extractor.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    pub peak: f64,
    pub flux: f64,
    pub hfr: f64,
    /// 0 = perfectly round, larger = more elongated.
    pub ellipticity: f64,
}

pub trait StarExtractor: Send + Sync {
    fn extract(&self, image_path: &Path) -> anyhow::Result<Vec<Star>>;
}

/// Score a star for inclusion among the "top-N highest confidence" stars:
/// 0.4 normalised peak + 0.3 HFR goodness + 0.2 centrality + 0.1 shape.
///
/// `image_width`/`image_height` give the frame size for centrality;
/// `max_peak` normalises peak across the frame's detected stars.
pub fn score_star(star: &Star, max_peak: f64, image_width: f64, image_height: f64) -> f64 {
    let normalised_peak = if max_peak > 0.0 { (star.peak / max_peak).clamp(0.0, 1.0) } else { 0.0 };

    // Smaller HFR is better; map to (0, 1] with a soft knee at hfr = 5px.
    let hfr_goodness = 1.0 / (1.0 + (star.hfr / 5.0).max(0.0));

    let cx = image_width / 2.0;
    let cy = image_height / 2.0;
    let max_dist = ((cx * cx) + (cy * cy)).sqrt().max(1e-9);
    let dist = ((star.x - cx).powi(2) + (star.y - cy).powi(2)).sqrt();
    let centrality = 1.0 - (dist / max_dist).clamp(0.0, 1.0);

    let shape = 1.0 - star.ellipticity.clamp(0.0, 1.0);

    0.4 * normalised_peak + 0.3 * hfr_goodness + 0.2 * centrality + 0.1 * shape
}

/// The single brightest detected star, used to centre a fine-stage ROI.
pub fn brightest_star(stars: &[Star]) -> Option<&Star> {
    stars.iter().max_by(|a, b| a.peak.total_cmp(&b.peak))
}

/// Mean HFR of the top-N highest-scoring stars, used by CHECKING_STARS to
/// decide between COARSE_ADJUSTMENT and FINE_ADJUSTMENT.
pub fn top_n_mean_hfr(stars: &[Star], n: usize, image_width: f64, image_height: f64) -> Option<f64> {
    if stars.is_empty() {
        return None;
    }
    let max_peak = stars.iter().map(|s| s.peak).fold(0.0_f64, f64::max);
    let mut scored: Vec<(f64, f64)> =
        stars.iter().map(|s| (score_star(s, max_peak, image_width, image_height), s.hfr)).collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    let take = n.min(scored.len()).max(1);
    let sum: f64 = scored.iter().take(take).map(|(_, hfr)| hfr).sum();
    Some(sum / take as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn star(hfr: f64, peak: f64) -> Star {
        Star { x: 50.0, y: 50.0, peak, flux: peak * 10.0, hfr, ellipticity: 0.05 }
    }

    #[test]
    fn top_n_mean_hfr_prefers_brighter_sharper_stars() {
        let stars = vec![star(2.0, 900.0), star(5.0, 100.0), star(2.5, 800.0)];
        let mean = top_n_mean_hfr(&stars, 2, 100.0, 100.0).unwrap();
        assert!(mean < 3.0, "mean={mean}");
    }

    #[test]
    fn top_n_mean_hfr_none_for_empty_input() {
        assert_eq!(top_n_mean_hfr(&[], 5, 100.0, 100.0), None);
    }

    #[test]
    fn brightest_star_picks_highest_peak() {
        let stars = vec![star(2.0, 900.0), star(5.0, 100.0), star(2.5, 950.0)];
        let brightest = brightest_star(&stars).unwrap();
        assert_eq!(brightest.peak, 950.0);
    }
}
