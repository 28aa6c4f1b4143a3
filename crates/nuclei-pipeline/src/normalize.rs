//! Percentile-based intensity normalization.
//!
//! Every pixel `v` maps to
//!
//! ```text
//! clamp((v - p_low) / (p_high - p_low), 0, 1)
//! ```
//!
//! where `p_low` and `p_high` are percentiles of the image itself. A few
//! saturated or dead pixels therefore do not compress the useful range,
//! unlike a min/max stretch. A flat range (`p_high == p_low`) yields an
//! all-zero image.

use serde::{Deserialize, Serialize};

use crate::stats::image_percentiles;
use crate::types::IntensityImage;

/// Percentile values a normalization was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileRange {
    /// Value at the lower percentile.
    pub low: f64,
    /// Value at the upper percentile.
    pub high: f64,
}

impl PercentileRange {
    /// Whether the range is empty, in which case normalization yields
    /// zeros.
    #[must_use]
    pub fn is_flat(self) -> bool {
        self.high <= self.low
    }
}

/// Rescale `image` to `[0, 1]` between its `low_percentile` and
/// `high_percentile` values.
///
/// Returns the normalized image along with the percentile values used.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn normalize_percentile(
    image: &IntensityImage,
    low_percentile: f64,
    high_percentile: f64,
) -> (IntensityImage, PercentileRange) {
    let Some([low, high]) = image_percentiles(image, [low_percentile, high_percentile]) else {
        return (
            image.clone(),
            PercentileRange {
                low: 0.0,
                high: 0.0,
            },
        );
    };
    let range = PercentileRange { low, high };

    if range.is_flat() {
        return (IntensityImage::new(image.width(), image.height()), range);
    }

    let span = high - low;
    let mut out = image.clone();
    for v in out.iter_mut() {
        *v = ((f64::from(*v) - low) / span).clamp(0.0, 1.0) as f32;
    }
    (out, range)
}
