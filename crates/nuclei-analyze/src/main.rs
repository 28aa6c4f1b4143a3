//! nuclei-analyze: run nuclear segmentation on per-channel z-frames.
//!
//! Each `--channel` names a channel and lists its z-frames in focal
//! order as ordinary grayscale image files (8- or 16-bit PNG/TIFF/BMP,
//! or anything else `image` decodes, converted to luminance). The run
//! writes two artifacts into `--out`:
//!
//! - `measurements_<run-id>.csv`: one row per detected nucleus
//! - `visualization_<run-id>.png`: composite figure
//!
//! plus `cross_channel_<run-id>.csv` when cross-channel measurement is
//! enabled. Per-stage diagnostics go to stdout.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin nuclei-analyze -- \
//!     --channel DAPI=dapi_z0.tif,dapi_z1.tif \
//!     --channel GFP=gfp_z0.tif,gfp_z1.tif \
//!     --out results/
//! ```
//!
//! Set `RUST_LOG=debug` to see segmentation thresholds.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, ValueEnum};
use image::{DynamicImage, Luma};
use nuclei_pipeline::diagnostics::{Clock, analyze_with_diagnostics};
use nuclei_pipeline::{
    AnalysisResult, CrossChannel, ImageStack, IntensityImage, Outcome, PipelineConfig,
    ReferenceMatch,
};
use tracing_subscriber::EnvFilter;

/// Nuclear segmentation and per-nucleus measurement for fluorescence
/// z-stacks.
#[derive(Parser)]
#[command(name = "nuclei-analyze", version)]
struct Cli {
    /// Channel and its z-frames: `NAME=frame0,frame1,...` (repeatable,
    /// acquisition order).
    #[arg(long = "channel", value_name = "NAME=PATHS", value_parser = parse_channel, required = true)]
    channels: Vec<ChannelArg>,

    /// Output directory for the CSV and PNG artifacts.
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// Run identifier used in artifact names (defaults to a timestamp).
    #[arg(long)]
    run_id: Option<String>,

    /// Name of the nuclear stain channel.
    #[arg(long, default_value = PipelineConfig::DEFAULT_REFERENCE_CHANNEL)]
    reference: String,

    /// Substitution rule when no channel has exactly the reference name.
    #[arg(long, value_enum, default_value_t = Match::Substring)]
    reference_match: Match,

    /// Gaussian smoothing sigma.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SMOOTHING_SIGMA)]
    sigma: f32,

    /// Percentile of the smoothed image used as threshold reference.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_THRESHOLD_PERCENTILE)]
    threshold_percentile: f64,

    /// Fraction of the reference level above which pixels are foreground.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_THRESHOLD_FRACTION)]
    threshold_fraction: f64,

    /// Minimum nucleus area in pixels, applied both when cleaning the
    /// mask and when labeling.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MIN_REGION_AREA)]
    min_area: u32,

    /// Also measure every other channel against the nucleus labels.
    #[arg(long)]
    cross_channel: bool,

    /// Exit with failure when no nuclei are found.
    #[arg(long)]
    require_regions: bool,

    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,
}

/// Reference substitution rule.
#[derive(Clone, Copy, ValueEnum)]
enum Match {
    /// Case-insensitive substring match, else the first channel.
    Substring,
    /// The first channel.
    First,
    /// No substitution.
    Exact,
}

/// One `--channel` argument.
#[derive(Debug, Clone)]
struct ChannelArg {
    name: String,
    frames: Vec<PathBuf>,
}

fn parse_channel(arg: &str) -> Result<ChannelArg, String> {
    let (name, paths) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATHS, got {arg:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("channel name missing in {arg:?}"));
    }
    let frames: Vec<PathBuf> = paths
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    if frames.is_empty() {
        return Err(format!("channel {name} has no frames"));
    }
    Ok(ChannelArg {
        name: name.to_string(),
        frames,
    })
}

/// Errors raised outside the pipeline.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Error parsing --config-json: {0}")]
    ConfigJson(serde_json::Error),

    #[error("Error serializing diagnostics: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error reading {path}: {source}")]
    Load {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Error writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Pipeline(#[from] nuclei_pipeline::PipelineError),

    #[error(transparent)]
    Export(#[from] nuclei_export::ExportError),
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, CliError> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(CliError::ConfigJson);
    }

    Ok(PipelineConfig {
        reference_channel: cli.reference.clone(),
        reference_match: match cli.reference_match {
            Match::Substring => ReferenceMatch::SubstringThenFirst,
            Match::First => ReferenceMatch::FirstChannel,
            Match::Exact => ReferenceMatch::ExactOnly,
        },
        smoothing_sigma: cli.sigma,
        threshold_percentile: cli.threshold_percentile,
        threshold_fraction: cli.threshold_fraction,
        segment_min_area: cli.min_area,
        min_region_area: cli.min_area,
        cross_channel: if cli.cross_channel {
            CrossChannel::All
        } else {
            CrossChannel::None
        },
        require_regions: cli.require_regions,
        ..PipelineConfig::default()
    })
}

/// Decode one frame, keeping raw detector counts for 8/16-bit gray.
fn load_frame(path: &Path) -> Result<IntensityImage, CliError> {
    let decoded = image::open(path).map_err(|source| CliError::Load {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match decoded {
        DynamicImage::ImageLuma8(gray) => {
            IntensityImage::from_fn(gray.width(), gray.height(), |x, y| {
                Luma([f32::from(gray.get_pixel(x, y).0[0])])
            })
        }
        DynamicImage::ImageLuma16(gray) => {
            IntensityImage::from_fn(gray.width(), gray.height(), |x, y| {
                Luma([f32::from(gray.get_pixel(x, y).0[0])])
            })
        }
        other => other.to_luma32f(),
    })
}

fn load_stack(channels: &[ChannelArg]) -> Result<ImageStack, CliError> {
    let mut loaded = Vec::with_capacity(channels.len());
    for channel in channels {
        let frames = channel
            .frames
            .iter()
            .map(|p| load_frame(p))
            .collect::<Result<Vec<_>, _>>()?;
        loaded.push((channel.name.clone(), frames));
    }
    Ok(ImageStack::new(loaded)?)
}

/// Seconds and milliseconds since the epoch, e.g. `1760870400_123`.
fn timestamp_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    format!("{}_{:03}", now.as_secs(), now.subsec_millis())
}

fn write_artifact(path: PathBuf, bytes: &[u8]) -> Result<(), CliError> {
    std::fs::write(&path, bytes).map_err(|source| CliError::Write {
        path: path.clone(),
        source,
    })?;
    eprintln!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

fn write_artifacts(result: &AnalysisResult, out: &Path, run_id: &str) -> Result<(), CliError> {
    std::fs::create_dir_all(out).map_err(|source| CliError::Write {
        path: out.to_path_buf(),
        source,
    })?;

    let csv = nuclei_export::to_csv(&result.measurements);
    write_artifact(out.join(format!("measurements_{run_id}.csv")), csv.as_bytes())?;

    if !result.cross_channel.is_empty() {
        let csv = nuclei_export::to_cross_channel_csv(&result.cross_channel);
        write_artifact(out.join(format!("cross_channel_{run_id}.csv")), csv.as_bytes())?;
    }

    let png = nuclei_export::encode_png(&nuclei_export::render_composite(result))?;
    write_artifact(out.join(format!("visualization_{run_id}.png")), &png)
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = config_from_cli(cli)?;
    let stack = load_stack(&cli.channels)?;
    eprintln!("Stack: {} channel(s), {}", cli.channels.len(), stack.dimensions());
    eprintln!("Config: {config:#?}");
    eprintln!();

    let (result, diagnostics) = analyze_with_diagnostics(stack, config, &StdClock)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else {
        println!("{}", diagnostics.report());
    }

    if result.reference.is_substitute() {
        eprintln!(
            "Note: reference channel {:?} not found, used {:?} ({:?})",
            result.reference.requested, result.reference.name, result.reference.reason,
        );
    }
    match result.outcome() {
        Outcome::NucleiDetected(n) => eprintln!("{n} nuclei detected"),
        Outcome::NoRegionsFound => eprintln!("0 nuclei detected"),
    }

    let run_id = cli.run_id.clone().unwrap_or_else(timestamp_run_id);
    write_artifacts(&result, &cli.out, &run_id)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn channel_argument_splits_name_and_frames() {
        let arg = parse_channel("DAPI=z0.tif, z1.tif").unwrap();
        assert_eq!(arg.name, "DAPI");
        assert_eq!(arg.frames, [PathBuf::from("z0.tif"), PathBuf::from("z1.tif")]);
    }

    #[test]
    fn channel_argument_rejects_missing_parts() {
        assert!(parse_channel("DAPI").is_err());
        assert!(parse_channel("=a.tif").is_err());
        assert!(parse_channel("DAPI=").is_err());
    }

    #[test]
    fn flags_map_onto_config() {
        let cli = Cli::parse_from([
            "nuclei-analyze",
            "--channel",
            "Hoechst=a.png",
            "--reference",
            "Hoechst",
            "--reference-match",
            "exact",
            "--min-area",
            "20",
            "--cross-channel",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.reference_channel, "Hoechst");
        assert_eq!(config.reference_match, ReferenceMatch::ExactOnly);
        assert_eq!(config.min_region_area, 20);
        assert_eq!(config.segment_min_area, 20);
        assert_eq!(config.cross_channel, CrossChannel::All);
        assert_eq!(config.closing_radius, PipelineConfig::DEFAULT_CLOSING_RADIUS);
    }

    /// Two 7x7 nuclei (49 px each) on a dark 100x100 field.
    fn small_nuclei() -> ImageStack {
        let frame = IntensityImage::from_fn(100, 100, |x, y| {
            let inside = |x0: u32, y0: u32| (x0..x0 + 7).contains(&x) && (y0..y0 + 7).contains(&y);
            Luma([if inside(20, 20) || inside(60, 70) { 1000.0 } else { 0.0 }])
        });
        ImageStack::new(vec![("DAPI".to_string(), vec![frame])]).unwrap()
    }

    #[test]
    fn min_area_flag_keeps_nuclei_below_the_default() {
        let default_cli = Cli::parse_from(["nuclei-analyze", "--channel", "DAPI=a.png"]);
        let config = config_from_cli(&default_cli).unwrap();
        let result = nuclei_pipeline::analyze(small_nuclei(), config).unwrap();
        assert_eq!(result.nuclei_count(), 0);

        let cli = Cli::parse_from([
            "nuclei-analyze",
            "--channel",
            "DAPI=a.png",
            "--min-area",
            "20",
        ]);
        let config = config_from_cli(&cli).unwrap();
        let result = nuclei_pipeline::analyze(small_nuclei(), config).unwrap();
        assert_eq!(result.nuclei_count(), 2);
        assert!(result.measurements.iter().all(|m| m.area >= 20 && m.area < 50));
    }

    #[test]
    fn config_json_overrides_flags() {
        let cli = Cli::parse_from([
            "nuclei-analyze",
            "--channel",
            "DAPI=a.png",
            "--min-area",
            "20",
            "--config-json",
            r#"{"min_region_area": 75}"#,
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.min_region_area, 75);
        assert_eq!(config.reference_channel, "DAPI");
    }

    #[test]
    fn sixteen_bit_frames_keep_raw_counts() {
        let dir = std::env::temp_dir().join(format!("nuclei-analyze-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frame16.png");
        let gray = image::ImageBuffer::<Luma<u16>, Vec<u16>>::from_fn(4, 3, |x, y| {
            Luma([u16::try_from(x * 1000 + y).unwrap()])
        });
        gray.save(&path).unwrap();

        let frame = load_frame(&path).unwrap();
        assert_eq!(frame.dimensions(), (4, 3));
        assert!((frame.get_pixel(3, 2).0[0] - 3002.0).abs() < f32::EPSILON);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
