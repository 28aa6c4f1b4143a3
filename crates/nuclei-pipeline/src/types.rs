//! Shared types for the nuclei segmentation pipeline.

use std::collections::BTreeMap;

use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

use crate::label::LabelMap;
use crate::reference::{ReferenceMatch, ReferenceSelection};
use crate::stats::ChannelStats;

/// Re-export `GrayImage` so downstream crates can reference masks
/// without depending on `image` directly.
pub use image::GrayImage;

/// A single-channel image of real-valued intensities.
///
/// Frames, projections and normalized images all use this type.
pub type IntensityImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Binary nucleus mask: `0` is background, [`FOREGROUND`] marks
/// candidate nucleus pixels. Same shape as the reference image.
pub type BinaryMask = GrayImage;

/// Pixel value marking foreground in a [`BinaryMask`].
pub const FOREGROUND: u8 = 255;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of any image buffer.
    #[must_use]
    pub fn of<P: image::Pixel>(image: &ImageBuffer<P, Vec<P::Subpixel>>) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Whether non-reference channels are measured against the reference
/// label map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrossChannel {
    /// Measure the reference channel only.
    #[default]
    None,
    /// Also measure every other channel's normalized image.
    All,
}

/// Configuration for the nuclei pipeline.
///
/// Every parameter the stages use is a named field here; nothing is
/// hardcoded inside the stages. Call [`validate`](Self::validate) (the
/// pipeline does so on [`decode`](crate::pipeline::Received::decode))
/// to reject out-of-range values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name of the channel used for segmentation.
    pub reference_channel: String,

    /// How to pick a substitute when no channel carries exactly
    /// [`reference_channel`](Self::reference_channel) as its name.
    pub reference_match: ReferenceMatch,

    /// Time index read from the source. Only one time point is analyzed.
    pub time_index: usize,

    /// Lower percentile for intensity normalization (0 to 100).
    pub normalize_low_percentile: f64,

    /// Upper percentile for intensity normalization (0 to 100).
    pub normalize_high_percentile: f64,

    /// Gaussian smoothing sigma applied before thresholding.
    pub smoothing_sigma: f32,

    /// Percentile of the smoothed reference image used as the
    /// threshold reference level.
    pub threshold_percentile: f64,

    /// Fraction of the reference level above which pixels are
    /// foreground.
    pub threshold_fraction: f64,

    /// Disk radius of the morphological closing.
    pub closing_radius: u8,

    /// Disk radius of the morphological opening.
    pub opening_radius: u8,

    /// Whether enclosed background holes are filled.
    pub fill_holes: bool,

    /// Components smaller than this (pixels, 4-connected) are dropped
    /// from the mask during segmentation.
    pub segment_min_area: u32,

    /// Components smaller than this (pixels, 8-connected) are dropped
    /// during labeling.
    pub min_region_area: u32,

    /// Cross-channel measurement policy.
    pub cross_channel: CrossChannel,

    /// Turn an empty segmentation into
    /// [`PipelineError::NoRegionsFound`] instead of an empty result.
    pub require_regions: bool,
}

impl PipelineConfig {
    /// Default reference channel name.
    pub const DEFAULT_REFERENCE_CHANNEL: &str = "DAPI";
    /// Default lower normalization percentile.
    pub const DEFAULT_NORMALIZE_LOW_PERCENTILE: f64 = 2.0;
    /// Default upper normalization percentile.
    pub const DEFAULT_NORMALIZE_HIGH_PERCENTILE: f64 = 98.0;
    /// Default smoothing sigma.
    pub const DEFAULT_SMOOTHING_SIGMA: f32 = 2.0;
    /// Default threshold percentile.
    pub const DEFAULT_THRESHOLD_PERCENTILE: f64 = 90.0;
    /// Default threshold fraction.
    pub const DEFAULT_THRESHOLD_FRACTION: f64 = 0.5;
    /// Default closing radius.
    pub const DEFAULT_CLOSING_RADIUS: u8 = 3;
    /// Default opening radius.
    pub const DEFAULT_OPENING_RADIUS: u8 = 2;
    /// Default segmentation minimum area.
    pub const DEFAULT_SEGMENT_MIN_AREA: u32 = 50;
    /// Default labeling minimum area.
    pub const DEFAULT_MIN_REGION_AREA: u32 = 50;

    /// Check every field against its valid range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let percent = 0.0..=100.0;
        if !percent.contains(&self.normalize_low_percentile)
            || !percent.contains(&self.normalize_high_percentile)
        {
            return Err(PipelineError::InvalidConfig(
                "normalization percentiles must lie in [0, 100]".to_string(),
            ));
        }
        if self.normalize_low_percentile >= self.normalize_high_percentile {
            return Err(PipelineError::InvalidConfig(format!(
                "normalize_low_percentile ({}) must be below normalize_high_percentile ({})",
                self.normalize_low_percentile, self.normalize_high_percentile,
            )));
        }
        if !percent.contains(&self.threshold_percentile) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold_percentile ({}) must lie in [0, 100]",
                self.threshold_percentile,
            )));
        }
        if !(self.threshold_fraction > 0.0 && self.threshold_fraction <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold_fraction ({}) must lie in (0, 1]",
                self.threshold_fraction,
            )));
        }
        if !self.smoothing_sigma.is_finite() || self.smoothing_sigma < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "smoothing_sigma ({}) must be finite and non-negative",
                self.smoothing_sigma,
            )));
        }
        if self.reference_channel.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "reference_channel must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reference_channel: Self::DEFAULT_REFERENCE_CHANNEL.to_string(),
            reference_match: ReferenceMatch::default(),
            time_index: 0,
            normalize_low_percentile: Self::DEFAULT_NORMALIZE_LOW_PERCENTILE,
            normalize_high_percentile: Self::DEFAULT_NORMALIZE_HIGH_PERCENTILE,
            smoothing_sigma: Self::DEFAULT_SMOOTHING_SIGMA,
            threshold_percentile: Self::DEFAULT_THRESHOLD_PERCENTILE,
            threshold_fraction: Self::DEFAULT_THRESHOLD_FRACTION,
            closing_radius: Self::DEFAULT_CLOSING_RADIUS,
            opening_radius: Self::DEFAULT_OPENING_RADIUS,
            fill_holes: true,
            segment_min_area: Self::DEFAULT_SEGMENT_MIN_AREA,
            min_region_area: Self::DEFAULT_MIN_REGION_AREA,
            cross_channel: CrossChannel::default(),
            require_regions: false,
        }
    }
}

/// Measurements for one labeled region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMeasurement {
    /// Region identity in the label map (1-based, contiguous).
    pub label: u32,
    /// Pixel count.
    pub area: u32,
    /// Mean normalized intensity over the region's pixels.
    pub mean_intensity: f64,
    /// Weighted boundary length in pixels.
    pub perimeter: f64,
    /// Best-fit ellipse eccentricity: 0 for a circle, towards 1 when
    /// elongated.
    pub eccentricity: f64,
    /// `4π·area / perimeter²`, or 0 when the perimeter is 0.
    pub circularity: f64,
    /// Region centroid, x (column) coordinate.
    pub centroid_x: f64,
    /// Region centroid, y (row) coordinate.
    pub centroid_y: f64,
}

/// Everything the pipeline produced for one channel.
///
/// The mask and label map are only present on the reference channel.
#[derive(Debug, Clone)]
pub struct ChannelResult {
    /// Position of the channel in acquisition order.
    pub index: usize,
    /// Percentile-normalized max projection.
    pub normalized: IntensityImage,
    /// Nucleus mask (reference channel only).
    pub mask: Option<BinaryMask>,
    /// Labeled nuclei (reference channel only).
    pub labels: Option<LabelMap>,
    /// Intensity statistics of the normalized image.
    pub stats: ChannelStats,
}

/// Whether a run found any nuclei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// At least one region survived filtering.
    NucleiDetected(usize),
    /// Segmentation and filtering left zero regions.
    NoRegionsFound,
}

/// Final output of a completed pipeline run.
///
/// Built once per run and never mutated afterwards; channel results are
/// keyed by channel name.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// Channel names in acquisition order (after default naming).
    pub channel_names: Vec<String>,
    /// Per-channel outputs keyed by name.
    pub channels: BTreeMap<String, ChannelResult>,
    /// Which channel was segmented, and whether it was substituted.
    pub reference: ReferenceSelection,
    /// Reference-channel measurements in label order.
    pub measurements: Vec<RegionMeasurement>,
    /// Measurements of other channels against the reference labels,
    /// present only when requested via [`CrossChannel::All`].
    pub cross_channel: BTreeMap<String, Vec<RegionMeasurement>>,
    /// Frame dimensions.
    pub dimensions: Dimensions,
}

impl AnalysisResult {
    /// Number of nuclei detected.
    #[must_use]
    pub fn nuclei_count(&self) -> usize {
        self.measurements.len()
    }

    /// Distinguishes an empty segmentation from a successful one.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if self.measurements.is_empty() {
            Outcome::NoRegionsFound
        } else {
            Outcome::NucleiDetected(self.measurements.len())
        }
    }

    /// The reference channel's result.
    #[must_use]
    pub fn reference_channel(&self) -> Option<&ChannelResult> {
        self.channels.get(&self.reference.name)
    }

    /// Channel results in acquisition order.
    pub fn channels_in_order(&self) -> impl Iterator<Item = (&str, &ChannelResult)> {
        self.channel_names
            .iter()
            .filter_map(|name| self.channels.get(name).map(|c| (name.as_str(), c)))
    }
}

/// Error returned by a [`FrameSource`](crate::stack::FrameSource) when a
/// frame cannot be produced.
pub type FrameError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during pipeline processing.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Frames that must share a shape do not.
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    InputShape {
        /// Where the mismatch was detected.
        context: String,
        /// Shape of the first frame.
        expected: Dimensions,
        /// Offending shape.
        found: Dimensions,
    },

    /// The stack has no channels, no z-levels or zero-sized frames.
    #[error("image stack is empty: {0}")]
    EmptyStack(String),

    /// Two channels carry the same name.
    #[error("duplicate channel name {0:?}")]
    DuplicateChannel(String),

    /// A channel's z-stack depth differs from the first channel's.
    #[error("channel {channel:?} has {found} z-levels, expected {expected}")]
    UnevenZStack {
        /// Offending channel.
        channel: String,
        /// Depth of the first channel.
        expected: usize,
        /// Depth of the offending channel.
        found: usize,
    },

    /// An image has no dynamic range where thresholding needs one.
    #[error("degenerate image: {0}")]
    DegenerateImage(String),

    /// Segmentation and filtering produced zero regions.
    #[error("no regions found after segmentation")]
    NoRegionsFound,

    /// No usable reference channel exists.
    #[error("reference channel {0:?} not found")]
    ReferenceChannelMissing(String),

    /// The frame source failed to produce a frame.
    #[error("failed to read frame (channel {channel}, z {z}, t {t}): {source}")]
    FrameAccess {
        /// Channel index.
        channel: usize,
        /// Z index.
        z: usize,
        /// Time index.
        t: usize,
        /// Underlying decoder error.
        source: FrameError,
    },

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}
