//! Measurement table serializer.
//!
//! One header row, then one row per region in identity order:
//!
//! ```text
//! ROI,Area,Mean_Intensity,Perimeter,Eccentricity,Circularity
//! 1,313,0.8123,62.627417,0.0412,1.002811
//! ```
//!
//! Floating-point values use Rust's shortest round-trip formatting, so
//! the table reloads to the exact measured values.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write;

use nuclei_pipeline::RegionMeasurement;

/// Column names, in order.
pub const HEADER: [&str; 6] = [
    "ROI",
    "Area",
    "Mean_Intensity",
    "Perimeter",
    "Eccentricity",
    "Circularity",
];

/// Quote a text field when it contains a delimiter, a quote or a line
/// break (RFC 4180).
fn quote_field(text: &str) -> Cow<'_, str> {
    if text.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", text.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(text)
    }
}

fn write_row(out: &mut String, m: &RegionMeasurement) {
    let _ = writeln!(
        out,
        "{},{},{},{},{},{}",
        m.label, m.area, m.mean_intensity, m.perimeter, m.eccentricity, m.circularity,
    );
}

/// Serialize reference-channel measurements into CSV text.
///
/// # Examples
///
/// ```
/// let csv = nuclei_export::to_csv(&[]);
/// assert_eq!(csv, "ROI,Area,Mean_Intensity,Perimeter,Eccentricity,Circularity\n");
/// ```
#[must_use]
pub fn to_csv(measurements: &[RegionMeasurement]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", HEADER.join(","));
    for m in measurements {
        write_row(&mut out, m);
    }
    out
}

/// Serialize cross-channel measurements, prefixing each row with the
/// channel it was measured on. Channels appear in name order.
#[must_use]
pub fn to_cross_channel_csv(per_channel: &BTreeMap<String, Vec<RegionMeasurement>>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Channel,{}", HEADER.join(","));
    for (channel, measurements) in per_channel {
        for m in measurements {
            let _ = write!(out, "{},", quote_field(channel));
            write_row(&mut out, m);
        }
    }
    out
}
