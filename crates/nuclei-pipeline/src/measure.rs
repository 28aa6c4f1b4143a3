//! Per-region shape and intensity measurements.
//!
//! Perimeter follows the weighted boundary estimator used by Fiji and
//! scikit-image: boundary pixels (region pixels with at least one
//! 4-neighbour outside the region) are classified by the configuration
//! of their boundary neighbours, and each configuration contributes a
//! straight (1), diagonal (√2) or corner ((1 + √2) / 2) length.
//!
//! Eccentricity is that of the ellipse with the same second central
//! moments as the region.

use std::f64::consts::{PI, SQRT_2};

use crate::label::LabelMap;
use crate::types::{Dimensions, IntensityImage, PipelineError, RegionMeasurement};

/// Neighbourhood weights for classifying boundary pixels. The centre
/// contributes 1, 4-neighbours 2 and diagonal neighbours 10, so every
/// configuration sums to a distinct code.
const CONFIGURATION_KERNEL: [[u8; 3]; 3] = [[10, 2, 10], [2, 1, 2], [10, 2, 10]];

/// Boundary length contributed by a configuration code.
fn configuration_length(code: u8) -> f64 {
    match code {
        5 | 7 | 15 | 17 | 25 | 27 => 1.0,
        21 | 33 => SQRT_2,
        13 | 23 => f64::midpoint(1.0, SQRT_2),
        _ => 0.0,
    }
}

/// Measure every region of `labels` against `intensity`.
///
/// Records are returned in identity order (1 to `labels.count()`).
///
/// # Errors
///
/// Returns [`PipelineError::InputShape`] when the label map and the
/// intensity image differ in size.
pub fn measure_regions(
    labels: &LabelMap,
    intensity: &IntensityImage,
) -> Result<Vec<RegionMeasurement>, PipelineError> {
    let expected = labels.dimensions();
    let found = Dimensions::of(intensity);
    if expected != found {
        return Err(PipelineError::InputShape {
            context: "measurement intensity image".to_string(),
            expected,
            found,
        });
    }

    let mut pixels: Vec<Vec<(u32, u32)>> = vec![Vec::new(); labels.count() as usize];
    for (x, y, label) in labels.labels().enumerate_pixels() {
        if let Some(list) = (label.0[0] as usize)
            .checked_sub(1)
            .and_then(|i| pixels.get_mut(i))
        {
            list.push((x, y));
        }
    }

    Ok(pixels
        .iter()
        .zip(1..)
        .map(|(region, label)| measure_region(label, region, intensity))
        .collect())
}

/// Measure one region given its pixel coordinates.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn measure_region(label: u32, pixels: &[(u32, u32)], intensity: &IntensityImage) -> RegionMeasurement {
    let area = pixels.len() as u32;
    let n = pixels.len().max(1) as f64;

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_i = 0.0;
    for &(x, y) in pixels {
        sum_x += f64::from(x);
        sum_y += f64::from(y);
        sum_i += f64::from(intensity.get_pixel(x, y).0[0]);
    }
    let centroid_x = sum_x / n;
    let centroid_y = sum_y / n;

    let perimeter = perimeter(pixels);
    RegionMeasurement {
        label,
        area,
        mean_intensity: sum_i / n,
        perimeter,
        eccentricity: eccentricity(pixels, centroid_x, centroid_y),
        circularity: circularity(area, perimeter),
        centroid_x,
        centroid_y,
    }
}

/// `4π·area / perimeter²`, or 0 when the perimeter is 0.
#[must_use]
pub fn circularity(area: u32, perimeter: f64) -> f64 {
    if perimeter > 0.0 {
        4.0 * PI * f64::from(area) / (perimeter * perimeter)
    } else {
        0.0
    }
}

/// Weighted boundary length of the region made of `pixels`.
#[must_use]
pub fn perimeter(pixels: &[(u32, u32)]) -> f64 {
    let Some(grid) = LocalGrid::new(pixels) else {
        return 0.0;
    };

    // Boundary pixels: in the region, with some 4-neighbour outside it.
    let mut boundary = vec![false; grid.cells.len()];
    for y in 1..grid.height - 1 {
        for x in 1..grid.width - 1 {
            let interior = grid.at(x, y)
                && grid.at(x - 1, y)
                && grid.at(x + 1, y)
                && grid.at(x, y - 1)
                && grid.at(x, y + 1);
            boundary[grid.index(x, y)] = grid.at(x, y) && !interior;
        }
    }

    let mut total = 0.0;
    for y in 1..grid.height - 1 {
        for x in 1..grid.width - 1 {
            if !boundary[grid.index(x, y)] {
                continue;
            }
            let mut code = 0u8;
            for (dy, row) in CONFIGURATION_KERNEL.iter().enumerate() {
                for (dx, weight) in row.iter().enumerate() {
                    if boundary[grid.index(x + dx - 1, y + dy - 1)] {
                        code += weight;
                    }
                }
            }
            total += configuration_length(code);
        }
    }
    total
}

/// Eccentricity of the moment-equivalent ellipse of `pixels`.
#[must_use]
pub fn eccentricity(pixels: &[(u32, u32)], centroid_x: f64, centroid_y: f64) -> f64 {
    if pixels.is_empty() {
        return 0.0;
    }
    let (mut xx, mut yy, mut xy) = (0.0, 0.0, 0.0);
    for &(x, y) in pixels {
        let dx = f64::from(x) - centroid_x;
        let dy = f64::from(y) - centroid_y;
        xx += dx * dx;
        yy += dy * dy;
        xy += dx * dy;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = pixels.len() as f64;
    let (a, b, c) = (xx / n, yy / n, xy / n);

    let mid = f64::midpoint(a, b);
    let spread = (a - b).mul_add((a - b) / 4.0, c * c).sqrt();
    let major = mid + spread;
    let minor = (mid - spread).max(0.0);
    if major <= 0.0 {
        return 0.0;
    }
    (1.0 - minor / major).max(0.0).sqrt()
}

/// A region rasterised into its bounding box with a one-pixel empty
/// margin, so neighbour lookups never leave the grid.
struct LocalGrid {
    cells: Vec<bool>,
    width: usize,
    height: usize,
}

impl LocalGrid {
    fn new(pixels: &[(u32, u32)]) -> Option<Self> {
        let min_x = pixels.iter().map(|p| p.0).min()?;
        let max_x = pixels.iter().map(|p| p.0).max()?;
        let min_y = pixels.iter().map(|p| p.1).min()?;
        let max_y = pixels.iter().map(|p| p.1).max()?;
        let width = (max_x - min_x) as usize + 3;
        let height = (max_y - min_y) as usize + 3;
        let mut cells = vec![false; width * height];
        for &(x, y) in pixels {
            cells[(y - min_y + 1) as usize * width + (x - min_x + 1) as usize] = true;
        }
        Some(Self {
            cells,
            width,
            height,
        })
    }

    const fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    fn at(&self, x: usize, y: usize) -> bool {
        self.cells[self.index(x, y)]
    }
}
