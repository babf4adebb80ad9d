use tracing::info;

/// Counts bumblebees in an RGB888 image.
pub trait Detector: Send + Sync {
    fn count(&self, rgb: &[u8], width: u32, height: u32) -> usize;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Placeholder until a real model runs on the node. Always reports zero.
#[derive(Debug, Default)]
pub struct MockDetector;

impl Detector for MockDetector {
    fn count(&self, _rgb: &[u8], width: u32, height: u32) -> usize {
        info!(width, height, "detection not yet implemented - returning mock count");
        0
    }

    fn name(&self) -> &str {
        "mock"
    }
}
