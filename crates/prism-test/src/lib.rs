//! Test harness for the Prism renderer.
//!
//! Provides headless rendering of the scene through either path, image
//! comparison and visual regression testing.

pub mod harness;

pub use harness::{
    compare_with_baseline, create_test_camera, diff_image, image_difference, HeadlessRenderer,
    VisualRegressionTest,
};

use prism_gpu::GpuError;
use prism_render::RenderError;
use prism_rt::RtError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Ray tracing error: {0}")]
    RayTracing(#[from] RtError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Visual regression test configuration.
#[derive(Debug, Clone)]
pub struct VisualTestConfig {
    /// Maximum allowed pixel difference (0.0-1.0).
    pub threshold: f64,
    /// Directory for baseline images.
    pub baseline_dir: String,
    /// Directory for test output images.
    pub output_dir: String,
}

impl Default for VisualTestConfig {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            baseline_dir: "assets/test_data/baselines".to_string(),
            output_dir: "target/test_output".to_string(),
        }
    }
}
