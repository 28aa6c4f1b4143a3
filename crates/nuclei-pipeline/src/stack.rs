//! Multi-channel z-stacks and the frame-source seam.
//!
//! The pipeline never decodes container files itself. It pulls frames
//! through [`FrameSource`], which a caller implements on top of whatever
//! microscopy decoder it uses. [`ImageStack`] is the in-memory
//! implementation used by the CLI and by tests.

use crate::types::{Dimensions, FrameError, IntensityImage, PipelineError};

/// Extents and channel names reported by a frame source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMetadata {
    /// Declared channel names, in acquisition order. May be empty when
    /// the container carries no names.
    pub channel_names: Vec<String>,
    /// Number of channels (`c` extent).
    pub channels: usize,
    /// Number of z-levels (`z` extent).
    pub z_levels: usize,
    /// Number of time points (`t` extent).
    pub time_points: usize,
}

impl StackMetadata {
    /// Channel names with positional defaults (`Channel_0`, `Channel_1`,
    /// ...) filled in when the source declares none.
    #[must_use]
    pub fn resolved_channel_names(&self) -> Vec<String> {
        if self.channel_names.is_empty() {
            (0..self.channels).map(|i| format!("Channel_{i}")).collect()
        } else {
            self.channel_names.clone()
        }
    }
}

/// Decoder seam: anything that can hand out single 2D frames.
pub trait FrameSource {
    /// Extents and channel names of the stack.
    fn metadata(&self) -> &StackMetadata;

    /// Read one frame as real-valued intensities.
    ///
    /// # Errors
    ///
    /// Returns the decoder's error when the frame cannot be produced.
    fn frame(&self, channel: usize, z: usize, t: usize) -> Result<IntensityImage, FrameError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn metadata(&self) -> &StackMetadata {
        (**self).metadata()
    }

    fn frame(&self, channel: usize, z: usize, t: usize) -> Result<IntensityImage, FrameError> {
        (**self).frame(channel, z, t)
    }
}

/// Frame index outside the stack extents.
#[derive(Debug, thiserror::Error)]
#[error("frame index out of range: channel {channel}, z {z}, t {t}")]
pub struct FrameOutOfRange {
    /// Requested channel.
    pub channel: usize,
    /// Requested z-level.
    pub z: usize,
    /// Requested time point.
    pub t: usize,
}

/// In-memory stack of named channels, each an ordered list of z-frames
/// at a single time point.
#[derive(Debug, Clone)]
pub struct ImageStack {
    metadata: StackMetadata,
    frames: Vec<Vec<IntensityImage>>,
}

impl ImageStack {
    /// Build a stack from `(name, z-frames)` pairs in acquisition order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyStack`] when there are no channels,
    /// the first channel has no frames or frames are zero-sized,
    /// [`PipelineError::DuplicateChannel`] when channel names repeat,
    /// [`PipelineError::UnevenZStack`] when z-counts differ and
    /// [`PipelineError::InputShape`] when frames differ in size.
    pub fn new(channels: Vec<(String, Vec<IntensityImage>)>) -> Result<Self, PipelineError> {
        let Some((_, first_frames)) = channels.first() else {
            return Err(PipelineError::EmptyStack("no channels".to_string()));
        };
        let z_levels = first_frames.len();
        let Some(first) = first_frames.first() else {
            return Err(PipelineError::EmptyStack(
                "first channel has no z-levels".to_string(),
            ));
        };
        let expected = Dimensions::of(first);
        if expected.pixel_count() == 0 {
            return Err(PipelineError::EmptyStack(format!(
                "zero-sized frames ({expected})"
            )));
        }

        for (i, (name, frames)) in channels.iter().enumerate() {
            if channels[..i].iter().any(|(other, _)| other == name) {
                return Err(PipelineError::DuplicateChannel(name.clone()));
            }
            if frames.len() != z_levels {
                return Err(PipelineError::UnevenZStack {
                    channel: name.clone(),
                    expected: z_levels,
                    found: frames.len(),
                });
            }
            for frame in frames {
                let found = Dimensions::of(frame);
                if found != expected {
                    return Err(PipelineError::InputShape {
                        context: format!("z-stack of channel {name}"),
                        expected,
                        found,
                    });
                }
            }
        }

        let (names, frames): (Vec<_>, Vec<_>) = channels.into_iter().unzip();
        Ok(Self {
            metadata: StackMetadata {
                channels: names.len(),
                channel_names: names,
                z_levels,
                time_points: 1,
            },
            frames,
        })
    }

    /// Frame dimensions shared by every frame.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        self.frames
            .first()
            .and_then(|c| c.first())
            .map_or(Dimensions { width: 0, height: 0 }, Dimensions::of)
    }
}

impl FrameSource for ImageStack {
    fn metadata(&self) -> &StackMetadata {
        &self.metadata
    }

    fn frame(&self, channel: usize, z: usize, t: usize) -> Result<IntensityImage, FrameError> {
        if t != 0 {
            return Err(Box::new(FrameOutOfRange { channel, z, t }));
        }
        self.frames
            .get(channel)
            .and_then(|c| c.get(z))
            .cloned()
            .ok_or_else(|| Box::new(FrameOutOfRange { channel, z, t }) as FrameError)
    }
}
