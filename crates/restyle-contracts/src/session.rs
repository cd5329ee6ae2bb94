use image::DynamicImage;

use crate::analysis::VisionAnalysis;
use crate::chat::Transcript;

/// Session-lifetime state for one user working on one room.
///
/// Invalidation rules:
/// - replacing the room photo drops the cached analysis and the generated
///   image (both were derived from the old photo);
/// - changing the style text drops only the generated image — the original
///   photo's analysis stays valid;
/// - re-submitting the same style text keeps the generated image.
#[derive(Debug, Default)]
pub struct RedesignSession {
    original_image: Option<DynamicImage>,
    before_analysis: Option<VisionAnalysis>,
    style_text: Option<String>,
    generated_image: Option<DynamicImage>,
    chat: Transcript,
}

impl RedesignSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_room(&mut self, image: DynamicImage) {
        self.original_image = Some(image);
        self.before_analysis = None;
        self.generated_image = None;
    }

    pub fn room(&self) -> Option<&DynamicImage> {
        self.original_image.as_ref()
    }

    pub fn set_style(&mut self, style_text: &str) {
        if self.style_text.as_deref() == Some(style_text) {
            return;
        }
        self.style_text = Some(style_text.to_string());
        self.generated_image = None;
    }

    pub fn style(&self) -> Option<&str> {
        self.style_text.as_deref()
    }

    pub fn record_analysis(&mut self, analysis: VisionAnalysis) {
        self.before_analysis = Some(analysis);
    }

    pub fn before_analysis(&self) -> Option<&VisionAnalysis> {
        self.before_analysis.as_ref()
    }

    pub fn record_generated(&mut self, image: DynamicImage) {
        self.generated_image = Some(image);
    }

    pub fn generated(&self) -> Option<&DynamicImage> {
        self.generated_image.as_ref()
    }

    pub fn chat(&self) -> &Transcript {
        &self.chat
    }

    pub fn chat_mut(&mut self) -> &mut Transcript {
        &mut self.chat
    }
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::RedesignSession;
    use crate::analysis::{ImageLabel, VisionAnalysis};

    fn analysis() -> VisionAnalysis {
        VisionAnalysis {
            labels: vec![ImageLabel {
                description: "Sofa".to_string(),
                score: 0.9,
            }],
            ..VisionAnalysis::default()
        }
    }

    fn image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::new_rgb8(width, height)
    }

    #[test]
    fn style_change_drops_only_generated_image() {
        let mut session = RedesignSession::new();
        session.set_room(image(32, 32));
        session.record_analysis(analysis());
        session.set_style("warm lighting");
        session.record_generated(image(32, 32));

        session.set_style("vintage");
        assert!(session.generated().is_none());
        assert!(session.before_analysis().is_some());
        assert_eq!(session.style(), Some("vintage"));
    }

    #[test]
    fn same_style_keeps_generated_image() {
        let mut session = RedesignSession::new();
        session.set_room(image(32, 32));
        session.set_style("vintage");
        session.record_generated(image(32, 32));

        session.set_style("vintage");
        assert!(session.generated().is_some());
    }

    #[test]
    fn new_room_drops_analysis_and_generated_image() {
        let mut session = RedesignSession::new();
        session.set_room(image(32, 32));
        session.record_analysis(analysis());
        session.set_style("vintage");
        session.record_generated(image(32, 32));

        session.set_room(image(64, 64));
        assert!(session.before_analysis().is_none());
        assert!(session.generated().is_none());
        assert_eq!(session.style(), Some("vintage"));
    }
}
