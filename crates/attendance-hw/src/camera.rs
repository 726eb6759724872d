//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use attendance_core::source::{CaptureDevice, SourceError, VideoSource};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion: {0}")]
    Frame(#[from] FrameError),
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }
}

/// An open V4L2 camera with a running mmap stream.
///
/// The stream shares the device handle and stays up for the camera's
/// lifetime; dropping the camera stops streaming and closes the device.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    sequence: u32,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Ask for YUYV; webcams that only stream MJPG and IR sensors that only
        // stream GREY/Y16 answer with their own format, which is accepted.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need MJPG, YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            sequence: 0,
        })
    }

    /// Dequeue one buffer and convert it to RGB.
    pub fn capture_rgb(&mut self) -> Result<RgbImage, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        self.sequence = meta.sequence;

        let used = (meta.bytesused as usize).min(buf.len());
        let buf = if used > 0 { &buf[..used] } else { buf };

        let image = match self.pixel_format {
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf)?,
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Y16 => frame::y16_to_rgb(buf, self.width, self.height)?,
        };
        tracing::trace!(seq = self.sequence, "frame captured");
        Ok(image)
    }

    /// Capture and throw away `count` frames while auto-exposure settles.
    pub fn discard(&mut self, count: usize) -> Result<(), CameraError> {
        for _ in 0..count {
            self.stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;
        }
        if count > 0 {
            tracing::debug!(count, "warmup frames discarded");
        }
        Ok(())
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(
            device = %self.device_path,
            last_seq = self.sequence,
            "camera released"
        );
    }
}

impl VideoSource for Camera {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        self.capture_rgb()
            .map(Some)
            .map_err(|e| SourceError::ReadFailed(e.to_string()))
    }
}

/// A camera by device path; opened afresh for every session.
#[derive(Debug, Clone)]
pub struct V4lDevice {
    pub path: String,
    pub warmup_frames: usize,
}

impl V4lDevice {
    pub fn new(path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            path: path.into(),
            warmup_frames,
        }
    }
}

impl CaptureDevice for V4lDevice {
    type Source = Camera;

    fn open(&self) -> Result<Camera, SourceError> {
        let unavailable = |e: CameraError| SourceError::Unavailable(format!("{}: {e}", self.path));
        let mut camera = Camera::open(&self.path).map_err(unavailable)?;
        camera.discard(self.warmup_frames).map_err(unavailable)?;
        Ok(camera)
    }
}
