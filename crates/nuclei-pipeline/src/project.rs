//! Maximum-intensity projection of a z-stack.

use crate::types::{Dimensions, IntensityImage, PipelineError};

/// Collapse a channel's z-frames into one image holding, per pixel, the
/// maximum over all frames.
///
/// A single frame is returned unchanged.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyStack`] when `frames` is empty and
/// [`PipelineError::InputShape`] when frames differ in size.
pub fn max_projection(frames: &[IntensityImage]) -> Result<IntensityImage, PipelineError> {
    let (first, rest) = frames
        .split_first()
        .ok_or_else(|| PipelineError::EmptyStack("no z-frames to project".to_string()))?;
    let expected = Dimensions::of(first);

    let mut projected = first.clone();
    for frame in rest {
        let found = Dimensions::of(frame);
        if found != expected {
            return Err(PipelineError::InputShape {
                context: "max projection".to_string(),
                expected,
                found,
            });
        }
        for (acc, &v) in projected.iter_mut().zip(frame.iter()) {
            *acc = acc.max(v);
        }
    }
    Ok(projected)
}
