//! Data models for vigil-scan

pub mod matches;
pub mod scan;
pub mod threshold;

pub use matches::{top_match, FeatureValue, ImageInput, ResolvedMatch, SiteMeta};
pub use scan::{Scan, ScanState};
pub use threshold::{ResolvedThresholds, ThresholdConfig, ThresholdSource};
