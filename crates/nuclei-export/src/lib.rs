//! nuclei-export: Pure serializers for pipeline results (sans-IO).
//!
//! Turns an [`AnalysisResult`](nuclei_pipeline::AnalysisResult) into
//! the artifacts a run persists: a delimited measurements table and a
//! composite figure (PNG bytes). Writing them to disk is the caller's
//! job.

pub mod composite;
pub mod csv;

pub use composite::{ExportError, encode_png, render_composite};
pub use csv::{to_cross_channel_csv, to_csv};
