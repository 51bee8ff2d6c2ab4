pub mod camera;
pub mod controls;
pub mod dedup;
pub mod engine;
pub mod inference;
pub mod latest;
pub mod render;
pub mod rgba_converter;

// Re-exports for convenience
#[cfg(feature = "camera-nokhwa")]
pub use camera::NokhwaCamera;
pub use camera::{CameraSource, FrameGrabber, FrameSource};
pub use controls::{Controls, DEFAULT_THRESHOLD};
pub use dedup::dedupe;
pub use engine::{
    DetectionEngine, Detector, ModelHandle, ModelKind, ModelLoadError, ModelLoader, OrtLoader,
};
pub use inference::{InferenceConfig, InferenceIo, InferenceLoop, LoopState};
pub use latest::Latest;
pub use render::{DrawInstruction, Rect, RenderLoop, RenderOutput};
pub use rgba_converter::RgbaFrame;
