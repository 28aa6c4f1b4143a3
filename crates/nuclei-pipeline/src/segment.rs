//! Nucleus segmentation of a projected reference image.
//!
//! Steps, in order:
//!
//! 1. Min/max rescale to `[0, 1]`.
//! 2. Gaussian smoothing ([`imageproc::filter::gaussian_blur_f32`]).
//! 3. Threshold at a fraction of a high percentile of the smoothed
//!    image. The percentile adapts to nucleus density per field of view.
//! 4. Morphological closing then opening with disk structuring elements.
//! 5. Hole filling.
//! 6. Removal of 4-connected components below a minimum area.
//!
//! A constant input has no dynamic range to threshold and is rejected
//! with [`PipelineError::DegenerateImage`].

use image::Luma;
use imageproc::morphology::Mask;
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::label::component_areas;
use crate::stats::image_percentiles;
use crate::types::{BinaryMask, FOREGROUND, IntensityImage, PipelineConfig, PipelineError};

/// Result of segmenting one reference image.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Nucleus candidate mask.
    pub mask: BinaryMask,
    /// Threshold applied to the smoothed, rescaled image.
    pub threshold: f64,
    /// Level the threshold was derived from (the configured percentile,
    /// or the maximum when the percentile sits on the background floor).
    pub reference_level: f64,
    /// Whether the reference level fell back to the maximum.
    pub used_max_fallback: bool,
}

impl Segmentation {
    /// Number of foreground pixels in the final mask.
    #[must_use]
    pub fn foreground_pixels(&self) -> u64 {
        self.mask
            .iter()
            .map(|&p| u64::from(u8::from(p == FOREGROUND)))
            .sum()
    }
}

/// Segment a projected (not normalized) reference image.
///
/// # Errors
///
/// Returns [`PipelineError::DegenerateImage`] when the image is constant
/// or contains no finite values.
pub fn segment(
    image: &IntensityImage,
    config: &PipelineConfig,
) -> Result<Segmentation, PipelineError> {
    let rescaled = rescale_min_max(image)?;
    let smoothed = smooth(&rescaled, config.smoothing_sigma);

    let (floor, peak) = min_max(&smoothed).ok_or_else(|| {
        PipelineError::DegenerateImage("smoothed image has no finite values".to_string())
    })?;
    let [level] = image_percentiles(&smoothed, [config.threshold_percentile]).ok_or_else(|| {
        PipelineError::DegenerateImage("smoothed image is empty".to_string())
    })?;
    let used_max_fallback = level <= floor;
    let reference_level = if used_max_fallback { peak } else { level };
    let threshold = config.threshold_fraction * reference_level;
    tracing::debug!(
        percentile = config.threshold_percentile,
        level,
        reference_level,
        threshold,
        used_max_fallback,
        "segmentation threshold",
    );

    let mask = threshold_mask(&smoothed, threshold);
    let mask = close_then_open(&mask, config.closing_radius, config.opening_radius);
    let mask = if config.fill_holes {
        fill_holes(&mask)
    } else {
        mask
    };
    let mask = remove_small_objects(&mask, config.segment_min_area);

    Ok(Segmentation {
        mask,
        threshold,
        reference_level,
        used_max_fallback,
    })
}

/// Stretch `image` to `[0, 1]` using its own minimum and maximum.
///
/// # Errors
///
/// Returns [`PipelineError::DegenerateImage`] when min equals max.
#[allow(clippy::cast_possible_truncation)]
pub fn rescale_min_max(image: &IntensityImage) -> Result<IntensityImage, PipelineError> {
    let (min, max) = min_max(image).ok_or_else(|| {
        PipelineError::DegenerateImage("image has no finite values".to_string())
    })?;
    if max <= min {
        return Err(PipelineError::DegenerateImage(format!(
            "constant image (all pixels {min})"
        )));
    }
    let span = max - min;
    let mut out = image.clone();
    for v in out.iter_mut() {
        *v = ((f64::from(*v) - min) / span) as f32;
    }
    Ok(out)
}

/// Minimum and maximum over the finite pixels of `image`.
fn min_max(image: &IntensityImage) -> Option<(f64, f64)> {
    image
        .iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc, &v| {
            let v = f64::from(v);
            Some(acc.map_or((v, v), |(lo, hi): (f64, f64)| (lo.min(v), hi.max(v))))
        })
}

/// Gaussian smoothing; non-positive sigma returns the image unchanged
/// since `imageproc` panics on `sigma <= 0.0`.
fn smooth(image: &IntensityImage, sigma: f32) -> IntensityImage {
    if sigma <= 0.0 {
        return image.clone();
    }
    imageproc::filter::gaussian_blur_f32(image, sigma)
}

/// Mark pixels strictly above `threshold` as foreground.
#[must_use]
pub fn threshold_mask(image: &IntensityImage, threshold: f64) -> BinaryMask {
    BinaryMask::from_fn(image.width(), image.height(), |x, y| {
        let v = f64::from(image.get_pixel(x, y).0[0]);
        Luma([if v > threshold { FOREGROUND } else { 0 }])
    })
}

/// Morphological closing (disk `closing_radius`) followed by opening
/// (disk `opening_radius`). A radius of 0 skips that operation.
#[must_use]
pub fn close_then_open(mask: &BinaryMask, closing_radius: u8, opening_radius: u8) -> BinaryMask {
    let closed = if closing_radius == 0 {
        mask.clone()
    } else {
        imageproc::morphology::grayscale_close(mask, &Mask::disk(closing_radius))
    };
    if opening_radius == 0 {
        closed
    } else {
        imageproc::morphology::grayscale_open(&closed, &Mask::disk(opening_radius))
    }
}

/// Fill background regions that are fully enclosed by foreground.
///
/// Background pixels are grouped into 4-connected components; any
/// component that does not touch the image border is a hole.
#[must_use]
pub fn fill_holes(mask: &BinaryMask) -> BinaryMask {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return mask.clone();
    }
    let inverted = BinaryMask::from_fn(w, h, |x, y| {
        Luma([if mask.get_pixel(x, y).0[0] == FOREGROUND {
            0
        } else {
            FOREGROUND
        }])
    });
    let background = connected_components(&inverted, Connectivity::Four, Luma([0u8]));

    let count = background.iter().copied().max().unwrap_or(0) as usize;
    let mut touches_border = vec![false; count + 1];
    for x in 0..w {
        for y in [0, h - 1] {
            touches_border[background.get_pixel(x, y).0[0] as usize] = true;
        }
    }
    for y in 0..h {
        for x in [0, w - 1] {
            touches_border[background.get_pixel(x, y).0[0] as usize] = true;
        }
    }

    BinaryMask::from_fn(w, h, |x, y| {
        let label = background.get_pixel(x, y).0[0] as usize;
        let is_hole = label != 0 && !touches_border[label];
        if mask.get_pixel(x, y).0[0] == FOREGROUND || is_hole {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Drop 4-connected foreground components with fewer than `min_area`
/// pixels.
#[must_use]
pub fn remove_small_objects(mask: &BinaryMask, min_area: u32) -> BinaryMask {
    if min_area <= 1 {
        return mask.clone();
    }
    let labels = connected_components(mask, Connectivity::Four, Luma([0u8]));
    let areas = component_areas(&labels);
    BinaryMask::from_fn(mask.width(), mask.height(), |x, y| {
        let label = labels.get_pixel(x, y).0[0] as usize;
        if label != 0 && areas[label] >= min_area {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn disk_image(size: u32, centers: &[(f32, f32)], radius: f32, value: f32) -> IntensityImage {
        IntensityImage::from_fn(size, size, |x, y| {
            let inside = centers.iter().any(|&(cx, cy)| {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                dx.mul_add(dx, dy * dy) <= radius * radius
            });
            Luma([if inside { value } else { 0.0 }])
        })
    }

    fn count_foreground(mask: &BinaryMask) -> usize {
        mask.iter().filter(|&&p| p == FOREGROUND).count()
    }

    #[test]
    fn all_zero_image_is_degenerate() {
        let img = IntensityImage::new(32, 32);
        let result = segment(&img, &PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::DegenerateImage(_))));
    }

    #[test]
    fn constant_image_is_degenerate() {
        let img = IntensityImage::from_pixel(16, 16, Luma([7.0]));
        assert!(matches!(
            rescale_min_max(&img),
            Err(PipelineError::DegenerateImage(_))
        ));
    }

    #[test]
    fn rescale_spans_unit_interval() {
        let img = IntensityImage::from_fn(5, 1, |x, _| Luma([10.0 + x as f32 * 5.0]));
        let out = rescale_min_max(&img).unwrap();
        assert!(out.get_pixel(0, 0).0[0].abs() < f32::EPSILON);
        assert!((out.get_pixel(4, 0).0[0] - 1.0).abs() < f32::EPSILON);
        assert!((out.get_pixel(2, 0).0[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn sparse_disks_segment_close_to_their_area() {
        let img = disk_image(200, &[(50.0, 50.0), (150.0, 150.0)], 10.0, 1000.0);
        let seg = segment(&img, &PipelineConfig::default()).unwrap();
        assert!(seg.used_max_fallback);
        let area = count_foreground(&seg.mask);
        let expected = 2.0 * std::f64::consts::PI * 100.0;
        #[allow(clippy::cast_precision_loss)]
        let ratio = area as f64 / expected;
        assert!((0.9..=1.1).contains(&ratio), "area {area}");
        // Foreground never strays far beyond the original disks.
        let source = threshold_mask(&img, 0.0);
        let dist = imageproc::distance_transform::distance_transform(
            &source,
            imageproc::distance_transform::Norm::LInf,
        );
        for (m, d) in seg.mask.iter().zip(dist.iter()) {
            if *m == FOREGROUND {
                assert!(*d <= 2);
            }
        }
    }

    #[test]
    fn dense_field_uses_percentile_level() {
        // Bright left half: the 90th percentile lies inside the bright
        // region, so no fallback is needed.
        let img = IntensityImage::from_fn(64, 64, |x, _| Luma([if x < 32 { 1.0 } else { 0.0 }]));
        let seg = segment(&img, &PipelineConfig::default()).unwrap();
        assert!(!seg.used_max_fallback);
        assert!((seg.threshold - 0.5).abs() < 1e-3);
        assert_eq!(seg.mask.get_pixel(5, 30).0[0], FOREGROUND);
        assert_eq!(seg.mask.get_pixel(60, 30).0[0], 0);
    }

    #[test]
    fn fill_holes_fills_enclosed_background_only() {
        // Ring of foreground around a 3x3 hole.
        let mask = BinaryMask::from_fn(9, 9, |x, y| {
            let ring = (2..=6).contains(&x) && (2..=6).contains(&y);
            let hole = (3..=5).contains(&x) && (3..=5).contains(&y);
            Luma([if ring && !hole { FOREGROUND } else { 0 }])
        });
        let filled = fill_holes(&mask);
        assert_eq!(filled.get_pixel(4, 4).0[0], FOREGROUND);
        assert_eq!(filled.get_pixel(0, 0).0[0], 0);
        assert_eq!(count_foreground(&filled), 25);
    }

    #[test]
    fn remove_small_objects_keeps_large_components() {
        let mask = BinaryMask::from_fn(30, 30, |x, y| {
            let small = x < 3 && y < 3;
            let large = (10..20).contains(&x) && (10..20).contains(&y);
            Luma([if small || large { FOREGROUND } else { 0 }])
        });
        let cleaned = remove_small_objects(&mask, 50);
        assert_eq!(count_foreground(&cleaned), 100);
        assert_eq!(cleaned.get_pixel(1, 1).0[0], 0);
    }

    #[test]
    fn opening_removes_thin_bridge() {
        // Two 12x12 squares joined by a 1-pixel-wide bridge.
        let mask = BinaryMask::from_fn(40, 20, |x, y| {
            let left = (2..14).contains(&x) && (4..16).contains(&y);
            let right = (26..38).contains(&x) && (4..16).contains(&y);
            let bridge = (14..26).contains(&x) && y == 10;
            Luma([if left || right || bridge { FOREGROUND } else { 0 }])
        });
        let opened = close_then_open(&mask, 0, 2);
        assert_eq!(opened.get_pixel(20, 10).0[0], 0);
        assert_eq!(opened.get_pixel(8, 10).0[0], FOREGROUND);
    }
}
