//! Intensity statistics over real-valued images.

use serde::{Deserialize, Serialize};

use crate::types::IntensityImage;

/// Value at percentile `p` (0 to 100) of `values`, using linear
/// interpolation between the two nearest ranks.
///
/// Rank `r = p / 100 * (n - 1)` over the sorted samples; the result
/// interpolates between `floor(r)` and `ceil(r)`. Returns `None` for an
/// empty input.
#[must_use]
pub fn percentile(values: &[f32], p: f64) -> Option<f64> {
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    percentile_sorted(&sorted, p)
}

/// Like [`percentile`], for input already sorted ascending.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile_sorted(sorted: &[f32], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let lo = f64::from(sorted[lower]);
    let hi = f64::from(sorted[upper.min(last)]);
    Some((hi - lo).mul_add(rank - lower as f64, lo))
}

/// Several percentiles of one image, sorting its pixels once.
#[must_use]
pub fn image_percentiles<const N: usize>(image: &IntensityImage, ps: [f64; N]) -> Option<[f64; N]> {
    let mut sorted: Vec<f32> = image.as_raw().clone();
    sorted.sort_by(f32::total_cmp);
    let mut out = [0.0; N];
    for (slot, p) in out.iter_mut().zip(ps) {
        *slot = percentile_sorted(&sorted, p)?;
    }
    Some(out)
}

/// Summary statistics of a channel's normalized image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Mean intensity.
    pub mean: f64,
    /// Maximum intensity.
    pub max: f64,
    /// Minimum intensity.
    pub min: f64,
    /// Population standard deviation.
    pub std: f64,
}

impl ChannelStats {
    /// Compute statistics over every pixel of `image`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn of(image: &IntensityImage) -> Self {
        let raw = image.as_raw();
        if raw.is_empty() {
            return Self {
                mean: 0.0,
                max: 0.0,
                min: 0.0,
                std: 0.0,
            };
        }
        let n = raw.len() as f64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in raw {
            let v = f64::from(v);
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        let mean = sum / n;
        let variance = raw
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / n;
        Self {
            mean,
            max,
            min,
            std: variance.sqrt(),
        }
    }
}
