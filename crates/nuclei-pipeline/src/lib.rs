//! nuclei-pipeline: nuclear segmentation and region measurement for
//! multi-channel fluorescence z-stacks (sans-IO).
//!
//! Each channel's z-stack is collapsed by maximum projection and
//! percentile-normalized. The reference (nuclear stain) channel is
//! additionally segmented:
//! rescale -> Gaussian smoothing -> percentile-relative threshold ->
//! closing/opening -> hole filling -> small-object removal -> labeling.
//! Every labeled region is then measured (area, mean intensity,
//! perimeter, eccentricity, circularity).
//!
//! This crate has **no I/O dependencies**. Frames come in through the
//! [`FrameSource`] trait and results go out as in-memory data;
//! serializing measurements and rendering figures lives in
//! `nuclei-export`.

pub mod diagnostics;
pub mod label;
pub mod measure;
pub mod normalize;
pub mod pipeline;
pub mod project;
pub mod reference;
pub mod segment;
pub mod stack;
pub mod stats;
pub mod types;

pub use label::LabelMap;
pub use pipeline::{Pipeline, PipelineState, Stage};
pub use reference::{ReferenceMatch, ReferenceSelection, SelectionReason};
pub use stack::{FrameSource, ImageStack, StackMetadata};
pub use stats::ChannelStats;
pub use types::{
    AnalysisResult, BinaryMask, ChannelResult, CrossChannel, Dimensions, IntensityImage, Outcome,
    PipelineConfig, PipelineError, RegionMeasurement,
};

/// Run the whole pipeline on `source`.
///
/// # Steps
///
/// 1. Read frames and choose the reference channel
/// 2. Project, segment and label the reference channel
/// 3. Project and normalize every channel
/// 4. Measure labeled regions
///
/// An empty segmentation is returned as a result whose
/// [`outcome`](AnalysisResult::outcome) is [`Outcome::NoRegionsFound`],
/// unless `config.require_regions` is set.
///
/// # Errors
///
/// Returns the first [`PipelineError`] raised by any stage; no partial
/// result is returned.
pub fn analyze<S: FrameSource + Send + 'static>(
    source: S,
    config: PipelineConfig,
) -> Result<AnalysisResult, PipelineError> {
    Pipeline::new(source, config)
        .decode()?
        .segment_reference()?
        .project_channels()?
        .measure()
        .map(pipeline::Measured::into_result)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn disk_frame(offset: f32) -> IntensityImage {
        IntensityImage::from_fn(200, 200, |x, y| {
            let inside = [(50.0, 50.0), (150.0, 140.0)]
                .iter()
                .any(|&(cx, cy): &(f32, f32)| {
                    let dx = x as f32 - cx - offset;
                    let dy = y as f32 - cy;
                    dx.mul_add(dx, dy * dy) <= 100.0
                });
            image::Luma([if inside { 800.0 } else { 5.0 }])
        })
    }

    #[test]
    fn analyze_projects_across_z_before_segmenting() {
        // The disks drift by one pixel between z-levels; the projection
        // is their union.
        let stack = ImageStack::new(vec![(
            "DAPI".to_string(),
            vec![disk_frame(0.0), disk_frame(1.0)],
        )])
        .unwrap();
        let result = analyze(stack, PipelineConfig::default()).unwrap();
        assert_eq!(result.nuclei_count(), 2);
        assert_eq!(result.dimensions, Dimensions { width: 200, height: 200 });
        for m in &result.measurements {
            assert!(m.area > 280 && m.area < 420, "area {}", m.area);
            assert!((0.0..=1.0).contains(&m.mean_intensity));
        }
    }

    #[test]
    fn empty_stack_is_rejected_before_analysis() {
        let source = ImageStack::new(vec![]);
        assert!(matches!(source, Err(PipelineError::EmptyStack(_))));
    }
}
