use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Normalized label descriptions for one image, as returned by the vision
/// provider (case preserved). Set semantics: scores are not part of identity.
pub type LabelSet = BTreeSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub name: String,
    pub score: f64,
    #[serde(default)]
    pub bounds: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabel {
    pub description: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DominantColor {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub pixel_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    #[serde(default)]
    pub bounds: Vec<Point>,
}

/// One annotation pass over a single image. Produced fresh per image and
/// never mutated afterwards; the requester owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VisionAnalysis {
    pub objects: Vec<DetectedObject>,
    pub labels: Vec<ImageLabel>,
    pub colors: Vec<DominantColor>,
    pub text: Vec<TextFragment>,
}

impl VisionAnalysis {
    /// Label descriptions as a set. Empty descriptions are dropped so the
    /// set never carries the empty string.
    pub fn label_set(&self) -> LabelSet {
        self.labels
            .iter()
            .map(|label| label.description.clone())
            .filter(|description| !description.is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.labels.is_empty()
            && self.colors.is_empty()
            && self.text.is_empty()
    }
}
