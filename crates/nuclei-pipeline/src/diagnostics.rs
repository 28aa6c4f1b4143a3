//! Pipeline diagnostics: timing and counts for each stage.
//!
//! The pipeline crate performs no I/O and does not read the system
//! clock itself. Callers pass a [`Clock`] to
//! [`analyze_with_diagnostics`]; the CLI backs it with
//! `std::time::Instant`, tests can use a fake.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::{
    AllChannelsProjected, Decoded, Pipeline, Received, ReferenceSegmented,
};
use crate::stack::FrameSource;
use crate::types::{AnalysisResult, PipelineConfig, PipelineError};

/// Time source used to measure stage durations.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Reading frames and choosing the reference channel.
    pub decode: StageDiagnostics,
    /// Projecting, segmenting and labeling the reference channel.
    pub segment: StageDiagnostics,
    /// Projecting and normalizing every channel.
    pub project: StageDiagnostics,
    /// Measuring labeled regions.
    pub measure: StageDiagnostics,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Frame reading metrics.
    Decode {
        /// Number of channels.
        channels: usize,
        /// Number of z-levels per channel.
        z_levels: usize,
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
        /// Name of the reference channel.
        reference: String,
        /// Whether the reference channel is a substitute.
        substituted: bool,
    },
    /// Reference segmentation metrics.
    Segment {
        /// Threshold applied to the smoothed image.
        threshold: f64,
        /// Whether the threshold came from the maximum fallback.
        used_max_fallback: bool,
        /// Foreground pixels in the final mask.
        foreground_pixels: u64,
        /// Regions that survived the area filter.
        regions: u32,
    },
    /// Projection and normalization metrics.
    Project {
        /// Channels normalized.
        channels: usize,
        /// Channels whose percentile range was flat (normalized to zeros).
        flat_channels: usize,
    },
    /// Measurement metrics.
    Measure {
        /// Regions measured on the reference channel.
        regions: usize,
        /// Additional channels measured against the reference labels.
        cross_channels: usize,
        /// Mean region area in pixels.
        mean_area: f64,
    },
}

/// High-level summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Frame width in pixels.
    pub image_width: u32,
    /// Frame height in pixels.
    pub image_height: u32,
    /// Number of channels.
    pub channel_count: usize,
    /// Name of the segmented channel.
    pub reference_channel: String,
    /// Number of nuclei detected.
    pub nuclei_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}, {} channel(s), reference {}",
            self.summary.image_width,
            self.summary.image_height,
            self.summary.channel_count,
            self.summary.reference_channel,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Decode", &self.decode),
            ("Segment Reference", &self.segment),
            ("Project Channels", &self.project),
            ("Measure", &self.measure),
        ];
        for (name, diag) in stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!("Nuclei detected: {}", self.summary.nuclei_count));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Decode {
            channels,
            z_levels,
            width,
            height,
            reference,
            substituted,
        } => {
            let note = if *substituted { " (substitute)" } else { "" };
            format!("{channels} ch x {z_levels} z, {width}x{height}, ref={reference}{note}")
        }
        StageMetrics::Segment {
            threshold,
            used_max_fallback,
            foreground_pixels,
            regions,
        } => {
            let source = if *used_max_fallback { "max" } else { "pct" };
            format!("thr={threshold:.3} ({source}) fg={foreground_pixels} regions={regions}")
        }
        StageMetrics::Project {
            channels,
            flat_channels,
        } => format!("{channels} normalized, {flat_channels} flat"),
        StageMetrics::Measure {
            regions,
            cross_channels,
            mean_area,
        } => format!("{regions} regions (mean area {mean_area:.1}), cross={cross_channels}"),
    }
}

/// Time one stage transition.
fn timed<C: Clock, S, T>(
    clock: &C,
    stage: S,
    advance: impl FnOnce(S) -> Result<T, PipelineError>,
) -> Result<(T, Duration), PipelineError> {
    let start = clock.now();
    let next = advance(stage)?;
    Ok((next, clock.elapsed(&start)))
}

/// Run the full pipeline, collecting per-stage diagnostics.
///
/// # Errors
///
/// Returns the first [`PipelineError`] raised by any stage.
pub fn analyze_with_diagnostics<S, C>(
    source: S,
    config: PipelineConfig,
    clock: &C,
) -> Result<(AnalysisResult, PipelineDiagnostics), PipelineError>
where
    S: FrameSource + Send + 'static,
    C: Clock,
{
    let total_start = clock.now();
    let received = Pipeline::new(source, config);

    let (decoded, duration) = timed(clock, received, Received::decode)?;
    let decode = StageDiagnostics {
        duration,
        metrics: decoded.stage_metrics(),
    };
    let (segmented, duration) = timed(clock, decoded, Decoded::segment_reference)?;
    let segment = StageDiagnostics {
        duration,
        metrics: segmented.stage_metrics(),
    };
    let (projected, duration) = timed(clock, segmented, ReferenceSegmented::project_channels)?;
    let project = StageDiagnostics {
        duration,
        metrics: projected.stage_metrics(),
    };
    let (measured, duration) = timed(clock, projected, AllChannelsProjected::measure)?;
    let measure = StageDiagnostics {
        duration,
        metrics: measured.stage_metrics(),
    };
    let result = measured.into_result();
    let total_duration = clock.elapsed(&total_start);

    let summary = PipelineSummary {
        image_width: result.dimensions.width,
        image_height: result.dimensions.height,
        channel_count: result.channel_names.len(),
        reference_channel: result.reference.name.clone(),
        nuclei_count: result.nuclei_count(),
    };
    Ok((
        result,
        PipelineDiagnostics {
            decode,
            segment,
            project,
            measure,
            total_duration,
            summary,
        },
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::stack::ImageStack;
    use crate::types::IntensityImage;

    /// Clock that advances one millisecond per reading.
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    fn two_disk_stack() -> ImageStack {
        let disks = IntensityImage::from_fn(200, 200, |x, y| {
            let inside = [(50.0, 50.0), (150.0, 150.0)].iter().any(|&(cx, cy): &(f32, f32)| {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                dx.mul_add(dx, dy * dy) <= 100.0
            });
            image::Luma([if inside { 500.0 } else { 0.0 }])
        });
        ImageStack::new(vec![("DAPI".to_string(), vec![disks])]).unwrap()
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        assert!((duration_ms(d) - 1234.0).abs() < 0.01);
    }

    #[test]
    fn collects_metrics_for_every_stage() {
        let clock = TickClock(Cell::new(0));
        let (result, diag) =
            analyze_with_diagnostics(two_disk_stack(), PipelineConfig::default(), &clock).unwrap();
        assert_eq!(result.nuclei_count(), 2);
        assert_eq!(diag.summary.nuclei_count, 2);
        assert_eq!(diag.summary.reference_channel, "DAPI");
        assert!(matches!(
            diag.decode.metrics,
            StageMetrics::Decode {
                channels: 1,
                z_levels: 1,
                substituted: false,
                ..
            }
        ));
        assert!(matches!(
            diag.segment.metrics,
            StageMetrics::Segment { regions: 2, .. }
        ));
        assert!(matches!(
            diag.measure.metrics,
            StageMetrics::Measure { regions: 2, .. }
        ));
        assert!(diag.total_duration >= diag.decode.duration);
    }

    #[test]
    fn report_lists_stages() {
        let clock = TickClock(Cell::new(0));
        let (_, diag) =
            analyze_with_diagnostics(two_disk_stack(), PipelineConfig::default(), &clock).unwrap();
        let report = diag.report();
        assert!(report.contains("Pipeline Diagnostics Report"));
        assert!(report.contains("Segment Reference"));
        assert!(report.contains("Nuclei detected: 2"));
    }

    #[test]
    fn diagnostics_serialize_durations_as_seconds() {
        let diag = StageDiagnostics {
            duration: Duration::from_millis(1500),
            metrics: StageMetrics::Project {
                channels: 2,
                flat_channels: 0,
            },
        };
        let json = serde_json::to_value(&diag).unwrap();
        assert!((json["duration"].as_f64().unwrap() - 1.5).abs() < 1e-9);
        let back: StageDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }
}
