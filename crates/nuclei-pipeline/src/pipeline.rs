//! Incremental pipeline: advance state by state, inspecting each
//! intermediate result before continuing.
//!
//! ```rust
//! # use nuclei_pipeline::{ImageStack, Pipeline, PipelineConfig, PipelineError};
//! # fn run(stack: ImageStack) -> Result<(), PipelineError> {
//! let result = Pipeline::new(stack, PipelineConfig::default())
//!     .decode()?
//!     .segment_reference()?
//!     .project_channels()?
//!     .measure()?
//!     .into_result();
//! println!("{} nuclei", result.nuclei_count());
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state, so
//! stages cannot be skipped or reordered. The dynamic [`Stage`] enum
//! wraps the same states for callers that drive the run in a loop; a
//! failing transition there moves to [`Stage::Failed`], which keeps the
//! state it failed from and the error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diagnostics::StageMetrics;
use crate::label::{LabelMap, label_regions};
use crate::measure::measure_regions;
use crate::normalize::normalize_percentile;
use crate::project::max_projection;
use crate::reference::{ReferenceSelection, select_reference};
use crate::segment::{Segmentation, segment};
use crate::stack::{FrameSource, StackMetadata};
use crate::stats::ChannelStats;
use crate::types::{
    AnalysisResult, ChannelResult, CrossChannel, Dimensions, IntensityImage, PipelineConfig,
    PipelineError, RegionMeasurement,
};

/// Boxed frame source held by the [`Received`] state.
type BoxedSource = Box<dyn FrameSource + Send>;

// ───────────────────────── State 0: Received ─────────────────────────

/// Pipeline state before any frame has been read.
#[must_use = "pipeline stages are consumed by advancing — call .decode() to continue"]
pub struct Received {
    config: PipelineConfig,
    source: BoxedSource,
}

impl Received {
    /// Extents and channel names reported by the source.
    #[must_use]
    pub fn metadata(&self) -> &StackMetadata {
        self.source.metadata()
    }

    /// Validate the configuration, pick the reference channel and read
    /// every channel's z-frames at the configured time index.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for out-of-range
    /// parameters, [`PipelineError::ReferenceChannelMissing`] when no
    /// reference can be chosen, [`PipelineError::DuplicateChannel`] when
    /// the source repeats a channel name, [`PipelineError::EmptyStack`]
    /// for a stack without z-levels, [`PipelineError::FrameAccess`] when the
    /// source fails and [`PipelineError::InputShape`] when frames differ
    /// in size.
    pub fn decode(self) -> Result<Decoded, PipelineError> {
        self.config.validate()?;
        let metadata = self.source.metadata();
        let channel_names = metadata.resolved_channel_names();
        for (i, name) in channel_names.iter().enumerate() {
            if channel_names[..i].contains(name) {
                return Err(PipelineError::DuplicateChannel(name.clone()));
            }
        }
        let reference = select_reference(
            &channel_names,
            &self.config.reference_channel,
            self.config.reference_match,
        )?;

        if metadata.z_levels == 0 {
            return Err(PipelineError::EmptyStack("stack has no z-levels".to_string()));
        }
        let t = self.config.time_index;
        if t >= metadata.time_points {
            return Err(PipelineError::InvalidConfig(format!(
                "time_index {t} out of range (stack has {} time points)",
                metadata.time_points,
            )));
        }

        let mut dimensions: Option<Dimensions> = None;
        let mut frames = Vec::with_capacity(channel_names.len());
        for (channel, name) in channel_names.iter().enumerate() {
            let mut stack = Vec::with_capacity(metadata.z_levels);
            for z in 0..metadata.z_levels {
                let frame = self
                    .source
                    .frame(channel, z, t)
                    .map_err(|source| PipelineError::FrameAccess {
                        channel,
                        z,
                        t,
                        source,
                    })?;
                let found = Dimensions::of(&frame);
                match dimensions {
                    None => dimensions = Some(found),
                    Some(expected) if expected != found => {
                        return Err(PipelineError::InputShape {
                            context: format!("z-stack of channel {name}"),
                            expected,
                            found,
                        });
                    }
                    Some(_) => {}
                }
                stack.push(frame);
            }
            frames.push(stack);
        }
        let dimensions = dimensions
            .filter(|d| d.pixel_count() > 0)
            .ok_or_else(|| PipelineError::EmptyStack("zero-sized frames".to_string()))?;

        tracing::info!(
            channels = channel_names.len(),
            z_levels = metadata.z_levels,
            %dimensions,
            reference = %reference.name,
            "decoded stack",
        );
        Ok(Decoded {
            config: self.config,
            channel_names,
            frames,
            reference,
            dimensions,
        })
    }
}

// ───────────────────────── State 1: Decoded ──────────────────────────

/// Pipeline state after reading all frames.
#[must_use = "pipeline stages are consumed by advancing — call .segment_reference() to continue"]
pub struct Decoded {
    config: PipelineConfig,
    channel_names: Vec<String>,
    frames: Vec<Vec<IntensityImage>>,
    reference: ReferenceSelection,
    dimensions: Dimensions,
}

impl Decoded {
    /// Channel names in acquisition order.
    #[must_use]
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// The chosen reference channel.
    #[must_use]
    pub const fn reference(&self) -> &ReferenceSelection {
        &self.reference
    }

    /// Frame dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Metrics describing the decode transition.
    #[must_use]
    pub fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Decode {
            channels: self.channel_names.len(),
            z_levels: self.frames.first().map_or(0, Vec::len),
            width: self.dimensions.width,
            height: self.dimensions.height,
            reference: self.reference.name.clone(),
            substituted: self.reference.is_substitute(),
        }
    }

    /// Project, segment and label the reference channel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DegenerateImage`] when the reference
    /// projection is constant.
    pub fn segment_reference(self) -> Result<ReferenceSegmented, PipelineError> {
        let reference_frames = self.frames.get(self.reference.index).ok_or_else(|| {
            PipelineError::ReferenceChannelMissing(self.reference.name.clone())
        })?;
        let projection = max_projection(reference_frames)?;
        let segmentation = segment(&projection, &self.config)?;
        let labels = label_regions(&segmentation.mask, self.config.min_region_area);

        tracing::info!(
            channel = %self.reference.name,
            threshold = segmentation.threshold,
            regions = labels.count(),
            "segmented reference channel",
        );
        Ok(ReferenceSegmented {
            config: self.config,
            channel_names: self.channel_names,
            frames: self.frames,
            reference: self.reference,
            dimensions: self.dimensions,
            projection,
            segmentation,
            labels,
        })
    }
}

// ──────────────────── State 2: ReferenceSegmented ────────────────────

/// Pipeline state after segmenting the reference channel.
#[must_use = "pipeline stages are consumed by advancing — call .project_channels() to continue"]
pub struct ReferenceSegmented {
    config: PipelineConfig,
    channel_names: Vec<String>,
    frames: Vec<Vec<IntensityImage>>,
    reference: ReferenceSelection,
    dimensions: Dimensions,
    projection: IntensityImage,
    segmentation: Segmentation,
    labels: LabelMap,
}

impl ReferenceSegmented {
    /// Max projection of the reference channel.
    #[must_use]
    pub const fn projection(&self) -> &IntensityImage {
        &self.projection
    }

    /// Segmentation of the reference projection.
    #[must_use]
    pub const fn segmentation(&self) -> &Segmentation {
        &self.segmentation
    }

    /// Labeled regions that passed the area filter.
    #[must_use]
    pub const fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Metrics describing the segmentation transition.
    #[must_use]
    pub fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Segment {
            threshold: self.segmentation.threshold,
            used_max_fallback: self.segmentation.used_max_fallback,
            foreground_pixels: self.segmentation.foreground_pixels(),
            regions: self.labels.count(),
        }
    }

    /// Project and normalize every channel. The reference projection
    /// computed during segmentation is reused.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputShape`] or
    /// [`PipelineError::EmptyStack`] from projection.
    pub fn project_channels(self) -> Result<AllChannelsProjected, PipelineError> {
        let Self {
            config,
            channel_names,
            frames,
            reference,
            dimensions,
            projection,
            segmentation,
            labels,
        } = self;

        let mut reference_projection = Some(projection);
        let mut reference_outputs = Some((segmentation.mask, labels));
        let mut channels = BTreeMap::new();
        let mut flat_channels = 0;

        for (index, (name, stack)) in channel_names.iter().zip(&frames).enumerate() {
            let is_reference = index == reference.index;
            let projected = match reference_projection.take_if(|_| is_reference) {
                Some(p) => p,
                None => max_projection(stack)?,
            };
            let (normalized, range) = normalize_percentile(
                &projected,
                config.normalize_low_percentile,
                config.normalize_high_percentile,
            );
            if range.is_flat() {
                flat_channels += 1;
                tracing::debug!(channel = %name, value = range.low, "flat percentile range");
            }
            let (mask, labels) = match reference_outputs.take_if(|_| is_reference) {
                Some((mask, labels)) => (Some(mask), Some(labels)),
                None => (None, None),
            };
            let stats = ChannelStats::of(&normalized);
            channels.insert(
                name.clone(),
                ChannelResult {
                    index,
                    normalized,
                    mask,
                    labels,
                    stats,
                },
            );
        }

        tracing::info!(channels = channels.len(), flat_channels, "normalized channels");
        Ok(AllChannelsProjected {
            config,
            channel_names,
            channels,
            reference,
            dimensions,
            flat_channels,
        })
    }
}

// ─────────────────── State 3: AllChannelsProjected ───────────────────

/// Pipeline state after normalizing every channel.
#[must_use = "pipeline stages are consumed by advancing — call .measure() to continue"]
pub struct AllChannelsProjected {
    config: PipelineConfig,
    channel_names: Vec<String>,
    channels: BTreeMap<String, ChannelResult>,
    reference: ReferenceSelection,
    dimensions: Dimensions,
    flat_channels: usize,
}

impl AllChannelsProjected {
    /// Per-channel results keyed by name.
    #[must_use]
    pub const fn channels(&self) -> &BTreeMap<String, ChannelResult> {
        &self.channels
    }

    /// Metrics describing the projection transition.
    #[must_use]
    pub fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Project {
            channels: self.channels.len(),
            flat_channels: self.flat_channels,
        }
    }

    /// Measure the reference channel's regions, and every other channel
    /// against the same labels when [`CrossChannel::All`] is configured.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NoRegionsFound`] when no region survived
    /// and `config.require_regions` is set.
    pub fn measure(self) -> Result<Measured, PipelineError> {
        let missing = || PipelineError::ReferenceChannelMissing(self.reference.name.clone());
        let reference = self.channels.get(&self.reference.name).ok_or_else(missing)?;
        let labels = reference.labels.as_ref().ok_or_else(missing)?;

        let measurements = measure_regions(labels, &reference.normalized)?;
        if measurements.is_empty() {
            if self.config.require_regions {
                return Err(PipelineError::NoRegionsFound);
            }
            tracing::warn!(channel = %self.reference.name, "no regions found");
        }

        let mut cross_channel = BTreeMap::new();
        if self.config.cross_channel == CrossChannel::All {
            for (name, channel) in &self.channels {
                if *name != self.reference.name {
                    cross_channel.insert(name.clone(), measure_regions(labels, &channel.normalized)?);
                }
            }
        }

        tracing::info!(
            regions = measurements.len(),
            cross_channels = cross_channel.len(),
            "measured regions",
        );
        Ok(Measured {
            result: AnalysisResult {
                channel_names: self.channel_names,
                channels: self.channels,
                reference: self.reference,
                measurements,
                cross_channel,
                dimensions: self.dimensions,
            },
        })
    }
}

// ───────────────────────── State 4: Measured ─────────────────────────

/// Pipeline state after measurement; the result is complete.
#[must_use = "pipeline stages are consumed by advancing — call .into_result() to finish"]
pub struct Measured {
    result: AnalysisResult,
}

impl Measured {
    /// Reference-channel measurements in label order.
    #[must_use]
    pub fn measurements(&self) -> &[RegionMeasurement] {
        &self.result.measurements
    }

    /// Metrics describing the measurement transition.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stage_metrics(&self) -> StageMetrics {
        let regions = self.result.measurements.len();
        let total: u64 = self
            .result
            .measurements
            .iter()
            .map(|m| u64::from(m.area))
            .sum();
        StageMetrics::Measure {
            regions,
            cross_channels: self.result.cross_channel.len(),
            mean_area: if regions == 0 {
                0.0
            } else {
                total as f64 / regions as f64
            },
        }
    }

    /// Finish the run, yielding the immutable result.
    #[must_use]
    pub fn into_result(self) -> AnalysisResult {
        self.result
    }
}

// ──────────────────── PipelineStage trait + Stage enum ────────────────

/// States of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    /// Source attached, nothing read.
    Received,
    /// Frames read, reference chosen.
    Decoded,
    /// Reference channel segmented and labeled.
    ReferenceSegmented,
    /// Every channel projected and normalized.
    AllChannelsProjected,
    /// Regions measured.
    Measured,
    /// Result available.
    Complete,
    /// A transition failed.
    Failed,
}

/// Trait implemented by every non-terminal stage struct, enabling
/// uniform iteration through [`Stage`].
pub trait PipelineStage: Sized {
    /// Human-readable name of this stage.
    const NAME: &str;

    /// State this stage represents.
    const STATE: PipelineState;

    /// Metrics describing the work done to reach this stage, `None` for
    /// [`Received`].
    fn metrics(&self) -> Option<StageMetrics>;

    /// Advance to the next state.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] raised by the transition.
    fn next(self) -> Result<Stage, PipelineError>;

    /// Run all remaining stages to completion.
    ///
    /// # Errors
    ///
    /// Returns the first [`PipelineError`] raised by a remaining stage.
    fn complete(self) -> Result<AnalysisResult, PipelineError>;
}

impl PipelineStage for Received {
    const NAME: &str = "received";
    const STATE: PipelineState = PipelineState::Received;

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }

    fn next(self) -> Result<Stage, PipelineError> {
        Ok(Stage::Decoded(self.decode()?))
    }

    fn complete(self) -> Result<AnalysisResult, PipelineError> {
        self.decode()?.complete()
    }
}

impl PipelineStage for Decoded {
    const NAME: &str = "decoded";
    const STATE: PipelineState = PipelineState::Decoded;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Stage, PipelineError> {
        Ok(Stage::ReferenceSegmented(self.segment_reference()?))
    }

    fn complete(self) -> Result<AnalysisResult, PipelineError> {
        self.segment_reference()?.complete()
    }
}

impl PipelineStage for ReferenceSegmented {
    const NAME: &str = "reference_segmented";
    const STATE: PipelineState = PipelineState::ReferenceSegmented;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Stage, PipelineError> {
        Ok(Stage::AllChannelsProjected(self.project_channels()?))
    }

    fn complete(self) -> Result<AnalysisResult, PipelineError> {
        self.project_channels()?.complete()
    }
}

impl PipelineStage for AllChannelsProjected {
    const NAME: &str = "all_channels_projected";
    const STATE: PipelineState = PipelineState::AllChannelsProjected;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Stage, PipelineError> {
        Ok(Stage::Measured(self.measure()?))
    }

    fn complete(self) -> Result<AnalysisResult, PipelineError> {
        self.measure()?.complete()
    }
}

impl PipelineStage for Measured {
    const NAME: &str = "measured";
    const STATE: PipelineState = PipelineState::Measured;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Result<Stage, PipelineError> {
        Ok(Stage::Complete(Box::new(self.into_result())))
    }

    fn complete(self) -> Result<AnalysisResult, PipelineError> {
        Ok(self.into_result())
    }
}

/// Dynamic wrapper over every pipeline state.
///
/// ```rust
/// # use nuclei_pipeline::{ImageStack, Pipeline, PipelineConfig, PipelineError};
/// # use nuclei_pipeline::pipeline::{Advance, Stage};
/// # fn run(stack: ImageStack) -> Result<(), PipelineError> {
/// let mut stage: Stage = Pipeline::new(stack, PipelineConfig::default()).into();
/// loop {
///     match stage.advance() {
///         Advance::Next(next) => stage = next,
///         Advance::Complete(done) => { stage = done; break; }
///     }
/// }
/// let result = stage.complete()?;
/// # Ok(())
/// # }
/// ```
pub enum Stage {
    /// See [`Received`].
    Received(Received),
    /// See [`Decoded`].
    Decoded(Decoded),
    /// See [`ReferenceSegmented`].
    ReferenceSegmented(ReferenceSegmented),
    /// See [`AllChannelsProjected`].
    AllChannelsProjected(AllChannelsProjected),
    /// See [`Measured`].
    Measured(Measured),
    /// The finished result.
    Complete(Box<AnalysisResult>),
    /// A transition failed; no partial result is kept.
    Failed {
        /// State the failing transition started from.
        from: PipelineState,
        /// The originating error.
        error: PipelineError,
    },
}

/// Result of [`Stage::advance`].
#[must_use]
pub enum Advance {
    /// Moved to a new state (possibly [`Stage::Failed`]).
    Next(Stage),
    /// Already terminal; the stage is returned unchanged.
    Complete(Stage),
}

/// Dispatch a method call to whichever non-terminal stage struct the
/// enum holds; the caller supplies the arms for terminal variants.
macro_rules! delegate {
    ($self:ident, $method:ident, $($terminal:pat => $body:expr),+ $(,)?) => {
        match $self {
            Self::Received(s) => s.$method(),
            Self::Decoded(s) => s.$method(),
            Self::ReferenceSegmented(s) => s.$method(),
            Self::AllChannelsProjected(s) => s.$method(),
            Self::Measured(s) => s.$method(),
            $($terminal => $body,)+
        }
    };
}

impl Stage {
    /// The state this stage represents.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        match self {
            Self::Received(_) => Received::STATE,
            Self::Decoded(_) => Decoded::STATE,
            Self::ReferenceSegmented(_) => ReferenceSegmented::STATE,
            Self::AllChannelsProjected(_) => AllChannelsProjected::STATE,
            Self::Measured(_) => Measured::STATE,
            Self::Complete(_) => PipelineState::Complete,
            Self::Failed { .. } => PipelineState::Failed,
        }
    }

    /// Human-readable name of the current stage.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Received(_) => Received::NAME,
            Self::Decoded(_) => Decoded::NAME,
            Self::ReferenceSegmented(_) => ReferenceSegmented::NAME,
            Self::AllChannelsProjected(_) => AllChannelsProjected::NAME,
            Self::Measured(_) => Measured::NAME,
            Self::Complete(_) => "complete",
            Self::Failed { .. } => "failed",
        }
    }

    /// Stage-specific metrics; `None` for the initial and terminal
    /// states.
    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        delegate!(self, metrics, Self::Complete(_) | Self::Failed { .. } => None)
    }

    /// Whether the run reached [`Stage::Complete`] or [`Stage::Failed`].
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failed { .. })
    }

    /// Advance by one transition.
    ///
    /// A failing transition yields [`Advance::Next`] with
    /// [`Stage::Failed`]; terminal stages yield [`Advance::Complete`]
    /// with themselves.
    pub fn advance(self) -> Advance {
        let from = self.state();
        let next = delegate!(
            self,
            next,
            terminal @ (Self::Complete(_) | Self::Failed { .. }) => return Advance::Complete(terminal),
        );
        match next {
            Ok(next) => Advance::Next(next),
            Err(error) => {
                tracing::error!(?from, %error, "pipeline failed");
                Advance::Next(Self::Failed { from, error })
            }
        }
    }

    /// Run all remaining stages to completion.
    ///
    /// # Errors
    ///
    /// Returns the recorded error for [`Stage::Failed`], or the first
    /// error raised by a remaining stage.
    pub fn complete(self) -> Result<AnalysisResult, PipelineError> {
        delegate!(
            self,
            complete,
            Self::Complete(result) => Ok(*result),
            Self::Failed { error, .. } => Err(error),
        )
    }
}

impl From<Received> for Stage {
    fn from(s: Received) -> Self {
        Self::Received(s)
    }
}

impl From<Decoded> for Stage {
    fn from(s: Decoded) -> Self {
        Self::Decoded(s)
    }
}

impl From<ReferenceSegmented> for Stage {
    fn from(s: ReferenceSegmented) -> Self {
        Self::ReferenceSegmented(s)
    }
}

impl From<AllChannelsProjected> for Stage {
    fn from(s: AllChannelsProjected) -> Self {
        Self::AllChannelsProjected(s)
    }
}

impl From<Measured> for Stage {
    fn from(s: Measured) -> Self {
        Self::Measured(s)
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental nuclei analysis pipeline.
///
/// Created via [`Pipeline::new`], which stores the frame source and
/// config without reading anything.
pub struct Pipeline;

impl Pipeline {
    /// Attach a frame source and config.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<S: FrameSource + Send + 'static>(source: S, config: PipelineConfig) -> Received {
        Received {
            config,
            source: Box::new(source),
        }
    }
}
