//! Scan request inputs and resolver match payloads

use serde::{Deserialize, Serialize};
use std::fmt;
use vigil_common::GeoPoint;
use zeroize::Zeroizing;

/// Image submitted for resolution
///
/// Raw bytes are wiped from memory when the value is dropped and are never
/// written to the store.
pub enum ImageInput {
    Url(String),
    Bytes(Zeroizing<Vec<u8>>),
}

impl ImageInput {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ImageInput::Bytes(Zeroizing::new(bytes))
    }

    pub fn byte_len(&self) -> Option<usize> {
        match self {
            ImageInput::Url(_) => None,
            ImageInput::Bytes(bytes) => Some(bytes.len()),
        }
    }
}

impl fmt::Debug for ImageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageInput::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ImageInput::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Where the image was captured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteMeta {
    pub site_id: Option<String>,
    pub label: Option<String>,
    pub location: Option<GeoPoint>,
}

/// One named component of a biometric feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub name: String,
    pub value: f64,
}

/// Single candidate returned by the resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMatch {
    pub subject_id: String,
    /// Confidence 0-100
    pub score: f64,
    #[serde(default)]
    pub features: Vec<FeatureValue>,
}

/// Pick the highest-scoring match
pub fn top_match(matches: &[ResolvedMatch]) -> Option<&ResolvedMatch> {
    matches
        .iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(subject: &str, score: f64) -> ResolvedMatch {
        ResolvedMatch {
            subject_id: subject.to_string(),
            score,
            features: Vec::new(),
        }
    }

    #[test]
    fn test_top_match_picks_highest_score() {
        let matches = vec![m("a", 40.0), m("b", 92.5), m("c", 77.0)];
        assert_eq!(top_match(&matches).unwrap().subject_id, "b");
        assert!(top_match(&[]).is_none());
    }

    #[test]
    fn test_image_debug_hides_bytes() {
        let image = ImageInput::from_bytes(vec![1, 2, 3, 4]);
        assert_eq!(format!("{:?}", image), "Bytes(4 bytes)");
        assert_eq!(image.byte_len(), Some(4));
    }
}
