//! Connected-component labeling with an area filter.
//!
//! Components are found with 8-connectivity, components below the
//! minimum area are discarded, and survivors are renumbered `1..=count`
//! in raster first-appearance order. The resulting identities have no
//! gaps, so downstream code can index per-region tables directly.

use image::{ImageBuffer, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::types::{BinaryMask, Dimensions};

/// Per-pixel region identities: `0` is background.
pub type LabelImage = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Labeled regions over a mask's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    labels: LabelImage,
    count: u32,
}

impl LabelMap {
    /// The label image.
    #[must_use]
    pub const fn labels(&self) -> &LabelImage {
        &self.labels
    }

    /// Number of regions; identities run from 1 to `count` inclusive.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Label map dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.labels)
    }

    /// Identity at `(x, y)`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.labels.get_pixel(x, y).0[0]
    }

    /// Pixel area of each region, indexed by identity (index 0 is the
    /// background).
    #[must_use]
    pub fn areas(&self) -> Vec<u32> {
        component_areas(&self.labels)
    }
}

/// Pixel count per label, indexed by label value.
#[must_use]
pub fn component_areas(labels: &LabelImage) -> Vec<u32> {
    let count = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut areas = vec![0u32; count + 1];
    for &label in labels.iter() {
        areas[label as usize] += 1;
    }
    areas
}

/// Label 8-connected foreground components of `mask`, keeping those
/// with at least `min_area` pixels.
#[must_use]
pub fn label_regions(mask: &BinaryMask, min_area: u32) -> LabelMap {
    let raw = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let areas = component_areas(&raw);

    let mut remap = vec![0u32; areas.len()];
    let mut next = 0u32;
    let mut labels = LabelImage::new(raw.width(), raw.height());
    for (out, &label) in labels.iter_mut().zip(raw.iter()) {
        if label == 0 {
            continue;
        }
        let slot = &mut remap[label as usize];
        if *slot == 0 && areas[label as usize] >= min_area {
            next += 1;
            *slot = next;
        }
        *out = *slot;
    }

    LabelMap {
        labels,
        count: next,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::FOREGROUND;

    fn mask_from(width: u32, height: u32, on: impl Fn(u32, u32) -> bool) -> BinaryMask {
        BinaryMask::from_fn(width, height, |x, y| {
            Luma([if on(x, y) { FOREGROUND } else { 0 }])
        })
    }

    fn square_mask() -> BinaryMask {
        mask_from(20, 20, |x, y| (5..8).contains(&x) && (5..8).contains(&y))
    }

    #[test]
    fn small_square_is_filtered_at_default_area() {
        let map = label_regions(&square_mask(), 50);
        assert_eq!(map.count(), 0);
        assert!(map.labels().iter().all(|&l| l == 0));
    }

    #[test]
    fn small_square_survives_lower_threshold() {
        let map = label_regions(&square_mask(), 5);
        assert_eq!(map.count(), 1);
        assert_eq!(map.areas()[1], 9);
    }

    #[test]
    fn identities_are_contiguous_after_filtering() {
        // Big, small, big, small, big in raster order.
        let mask = mask_from(60, 10, |x, y| {
            let block = x / 12;
            let size = if block % 2 == 0 { 8 } else { 2 };
            (x % 12) < size && y < size
        });
        let map = label_regions(&mask, 20);
        assert_eq!(map.count(), 3);
        let mut seen: Vec<u32> = map.labels().iter().copied().filter(|&l| l > 0).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, [1, 2, 3]);
        // First appearance order follows the raster scan.
        assert_eq!(map.get(0, 0), 1);
        assert_eq!(map.get(24, 0), 2);
        assert_eq!(map.get(48, 0), 3);
    }

    #[test]
    fn diagonal_neighbours_join_one_region() {
        let mask = mask_from(4, 4, |x, y| x == y);
        let map = label_regions(&mask, 1);
        assert_eq!(map.count(), 1);
        assert_eq!(map.areas()[1], 4);
    }

    #[test]
    fn empty_mask_has_no_regions() {
        let map = label_regions(&BinaryMask::new(8, 8), 1);
        assert_eq!(map.count(), 0);
        assert_eq!(map.areas().len(), 1);
    }
}
