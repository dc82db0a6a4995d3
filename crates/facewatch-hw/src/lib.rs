//! facewatch-hw: Camera sources and frame handling.
//!
//! Provides the camera open/read contract with a V4L2 implementation,
//! plus conversion of raw buffers to RGB, cropping and JPEG encoding.

pub mod camera;
pub mod frame;

pub use camera::{open_first, CameraError, CameraOpener, CameraSource, SourceConfig, V4lOpener};
pub use frame::{Frame, FrameError};
