//! Video source seam between the sessions and the camera hardware.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    Unavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// An opened stream of RGB frames.
///
/// Dropping the stream releases the underlying capture handle.
pub trait VideoSource {
    /// Read the next frame. `Ok(None)` signals end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        (**self).read_frame()
    }
}

/// Something that can be opened into a [`VideoSource`], e.g. a camera device path.
pub trait CaptureDevice {
    type Source: VideoSource;

    fn open(&self) -> Result<Self::Source, SourceError>;
}

impl<C: CaptureDevice + ?Sized> CaptureDevice for Box<C> {
    type Source = C::Source;

    fn open(&self) -> Result<Self::Source, SourceError> {
        (**self).open()
    }
}

/// Result of one [`FrameCursor::pull`].
#[derive(Debug)]
pub enum Pull {
    Frame(RgbImage),
    /// The very first read produced nothing. Treated as an unavailable camera.
    FirstReadFailed(String),
    /// The source ended or a later read failed. The source has been released.
    Ended,
}

/// Owns an opened source and releases it as soon as the stream terminates.
pub struct FrameCursor<S> {
    source: Option<S>,
    reads: u64,
}

impl<S: VideoSource> FrameCursor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            reads: 0,
        }
    }

    pub fn pull(&mut self) -> Pull {
        let Some(source) = self.source.as_mut() else {
            return Pull::Ended;
        };
        let first = self.reads == 0;
        self.reads += 1;

        let reason = match source.read_frame() {
            Ok(Some(frame)) => return Pull::Frame(frame),
            Ok(None) => "source produced no frame".to_string(),
            Err(e) => e.to_string(),
        };
        self.release();
        if first {
            Pull::FirstReadFailed(reason)
        } else {
            tracing::debug!(reads = self.reads, %reason, "video stream ended");
            Pull::Ended
        }
    }

    /// Drop the source now. Idempotent.
    pub fn release(&mut self) {
        if self.source.take().is_some() {
            tracing::debug!(reads = self.reads, "video source released");
        }
    }
}
