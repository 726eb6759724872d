//! attendance-hw: V4L2 camera capture for the attendance engine.
//!
//! Implements the core `CaptureDevice`/`VideoSource` seam over a persistent
//! mmap stream and converts MJPG, YUYV, GREY and Y16 buffers to RGB.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat, V4lDevice};
