//! presence-hw — Video sources and preview sinks.
//!
//! Provides V4L2-based camera capture, replay of still-image directories for
//! offline runs, and best-effort preview outputs for annotated frames.

pub mod camera;
pub mod frame;
pub mod preview;
pub mod source;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use preview::{NullPreview, PreviewError, PreviewSink, SnapshotPreview};
pub use source::{ImageSequenceSource, SourceError, VideoSource};
