//! Composite figure of a run.
//!
//! One row per channel in acquisition order, three panels per row:
//!
//! 1. the normalized image in grayscale,
//! 2. the nucleus mask (reference channel only, black otherwise),
//! 3. the normalized image with region outlines, centroid markers and
//!    ROI numbers.
//!
//! Outlines come from the reference label map and are drawn on every
//! row, so signal in other channels can be read against the nuclei. The
//! number beside each marker is the `ROI` column of the measurement
//! table.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_cross_mut;
use nuclei_pipeline::{AnalysisResult, IntensityImage, LabelMap};

/// Outline colour.
const OUTLINE: Rgb<u8> = Rgb([255, 215, 0]);

/// Centroid marker colour.
const MARKER: Rgb<u8> = Rgb([255, 40, 40]);

/// ROI number colour.
const LABEL: Rgb<u8> = Rgb([0, 255, 255]);

/// 3x5 bitmap digits, row-major.
const DIGITS: [[u8; 15]; 10] = [
    [1, 1, 1, 1, 0, 1, 1, 0, 1, 1, 0, 1, 1, 1, 1], // 0
    [0, 1, 0, 1, 1, 0, 0, 1, 0, 0, 1, 0, 1, 1, 1], // 1
    [1, 1, 1, 0, 0, 1, 1, 1, 1, 1, 0, 0, 1, 1, 1], // 2
    [1, 1, 1, 0, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 3
    [1, 0, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 0, 0, 1], // 4
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 5
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 1, 0, 1, 1, 1, 1], // 6
    [1, 1, 1, 0, 0, 1, 0, 0, 1, 0, 0, 1, 0, 0, 1], // 7
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 1, 1, 1], // 8
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 9
];

/// Errors from encoding a composite.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The PNG encoder failed.
    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

/// Render the composite figure for `result`.
#[must_use]
pub fn render_composite(result: &AnalysisResult) -> RgbImage {
    let (w, h) = (result.dimensions.width, result.dimensions.height);
    let rows = u32::try_from(result.channel_names.len()).unwrap_or(u32::MAX);
    let mut canvas = RgbImage::new(w * 3, h * rows);
    let labels = result.reference_channel().and_then(|c| c.labels.as_ref());

    for (row, (_, channel)) in (0..rows).zip(result.channels_in_order()) {
        let top = row * h;
        blit_gray(&mut canvas, &channel.normalized, 0, top);
        if let Some(mask) = &channel.mask {
            for (x, y, p) in mask.enumerate_pixels() {
                let v = p.0[0];
                canvas.put_pixel(x + w, y + top, Rgb([v, v, v]));
            }
        }
        blit_gray(&mut canvas, &channel.normalized, 2 * w, top);
        if let Some(labels) = labels {
            draw_outlines(&mut canvas, labels, 2 * w, top);
        }
        let panel = Panel {
            left: 2 * w,
            top,
            width: w,
            height: h,
        };
        for m in &result.measurements {
            #[allow(clippy::cast_possible_truncation)]
            let (cx, cy) = (m.centroid_x.round() as i64, m.centroid_y.round() as i64);
            draw_cross_mut(
                &mut canvas,
                MARKER,
                i32::try_from(cx + i64::from(panel.left)).unwrap_or(i32::MAX),
                i32::try_from(cy + i64::from(panel.top)).unwrap_or(i32::MAX),
            );
            draw_number(&mut canvas, panel, cx + 3, cy - 2, m.label);
        }
    }
    canvas
}

/// Placement of one panel on the canvas.
#[derive(Clone, Copy)]
struct Panel {
    left: u32,
    top: u32,
    width: u32,
    height: u32,
}

/// Write `number` in 3x5 digits with its top-left corner at panel
/// coordinates `(x, y)`, clipped to the panel.
fn draw_number(canvas: &mut RgbImage, panel: Panel, x: i64, y: i64, number: u32) {
    for (offset, digit) in (0_i64..).step_by(4).zip(number.to_string().bytes()) {
        let glyph = &DIGITS[usize::from(digit - b'0')];
        for (row, cells) in (0_i64..).zip(glyph.chunks(3)) {
            for (col, &on) in (0_i64..).zip(cells) {
                if on == 0 {
                    continue;
                }
                if let (Ok(px), Ok(py)) = (u32::try_from(x + offset + col), u32::try_from(y + row))
                    && px < panel.width
                    && py < panel.height
                {
                    canvas.put_pixel(px + panel.left, py + panel.top, LABEL);
                }
            }
        }
    }
}

/// Copy a `[0, 1]` intensity image into the canvas as gray.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn blit_gray(canvas: &mut RgbImage, image: &IntensityImage, left: u32, top: u32) {
    for (x, y, p) in image.enumerate_pixels() {
        let v = (p.0[0].clamp(0.0, 1.0) * 255.0).round() as u8;
        canvas.put_pixel(x + left, y + top, Rgb([v, v, v]));
    }
}

/// Colour region pixels that have a 4-neighbour with a different label.
fn draw_outlines(canvas: &mut RgbImage, labels: &LabelMap, left: u32, top: u32) {
    let dims = labels.dimensions();
    for (x, y, p) in labels.labels().enumerate_pixels() {
        let label = p.0[0];
        if label == 0 {
            continue;
        }
        let differs = |nx: Option<u32>, ny: Option<u32>| match (nx, ny) {
            (Some(nx), Some(ny)) if nx < dims.width && ny < dims.height => {
                labels.get(nx, ny) != label
            }
            _ => true,
        };
        let edge = differs(x.checked_sub(1), Some(y))
            || differs(x.checked_add(1), Some(y))
            || differs(Some(x), y.checked_sub(1))
            || differs(Some(x), y.checked_add(1));
        if edge {
            canvas.put_pixel(x + left, y + top, OUTLINE);
        }
    }
}

/// Encode an RGB image as PNG bytes.
///
/// # Errors
///
/// Returns [`ExportError::Png`] if the encoder fails.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ExportError> {
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;
    use nuclei_pipeline::{ImageStack, PipelineConfig, analyze};

    use super::*;

    fn result() -> AnalysisResult {
        let dapi = IntensityImage::from_fn(120, 120, |x, y| {
            let dx = x as f32 - 40.0;
            let dy = y as f32 - 60.0;
            Luma([if dx.mul_add(dx, dy * dy) <= 144.0 { 900.0 } else { 5.0 }])
        });
        let gfp = IntensityImage::from_fn(120, 120, |x, y| Luma([((x * 31 + y * 17) % 97) as f32]));
        let stack = ImageStack::new(vec![
            ("DAPI".to_string(), vec![dapi]),
            ("GFP".to_string(), vec![gfp]),
        ])
        .unwrap();
        analyze(stack, PipelineConfig::default()).unwrap()
    }

    #[test]
    fn composite_has_three_panels_per_channel() {
        let result = result();
        let img = render_composite(&result);
        assert_eq!(img.dimensions(), (360, 240));
    }

    #[test]
    fn mask_panel_is_blank_for_non_reference_rows() {
        let result = result();
        let img = render_composite(&result);
        // Second row, middle panel: GFP has no mask.
        for y in 120..240 {
            for x in 120..240 {
                assert_eq!(*img.get_pixel(x, y), Rgb([0, 0, 0]));
            }
        }
        // First row, middle panel: the nucleus is white.
        assert_eq!(*img.get_pixel(120 + 40, 60), Rgb([255, 255, 255]));
    }

    #[test]
    fn overlay_marks_centroid_and_outline() {
        let result = result();
        assert_eq!(result.nuclei_count(), 1);
        let img = render_composite(&result);
        let m = &result.measurements[0];
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (cx, cy) = (m.centroid_x.round() as u32, m.centroid_y.round() as u32);
        assert_eq!(*img.get_pixel(240 + cx, cy), MARKER);
        assert!(
            (240..360).any(|x| *img.get_pixel(x, 60) == OUTLINE),
            "no outline on the overlay row"
        );
    }

    #[test]
    fn overlay_numbers_each_region_beside_its_marker() {
        let result = result();
        let img = render_composite(&result);
        let m = &result.measurements[0];
        assert_eq!(m.label, 1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (cx, cy) = (m.centroid_x.round() as u32, m.centroid_y.round() as u32);
        // Glyph "1": top row is only the middle cell, bottom row is full.
        let (gx, gy) = (240 + cx + 3, cy - 2);
        assert_eq!(*img.get_pixel(gx + 1, gy), LABEL);
        assert_ne!(*img.get_pixel(gx, gy), LABEL);
        assert!((0..3).all(|c| *img.get_pixel(gx + c, gy + 4) == LABEL));
        // Every channel row carries the number.
        assert_eq!(*img.get_pixel(gx + 1, gy + 120), LABEL);
    }

    #[test]
    fn numbers_are_clipped_to_their_panel() {
        let mut canvas = RgbImage::new(20, 10);
        let panel = Panel {
            left: 10,
            top: 0,
            width: 10,
            height: 10,
        };
        draw_number(&mut canvas, panel, 8, 7, 88);
        for y in 0..10 {
            for x in 0..10 {
                assert_ne!(*canvas.get_pixel(x, y), LABEL, "leaked into ({x}, {y})");
            }
        }
        assert_eq!(*canvas.get_pixel(18, 7), LABEL);
    }

    #[test]
    fn png_encoding_round_trips_dimensions() {
        let img = RgbImage::from_pixel(7, 5, Rgb([10, 20, 30]));
        let bytes = encode_png(&img).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded, img);
    }
}
