//! Registration capture and camera preview.

use crate::annotate::{self, REGISTRATION_BOX};
use crate::detector::{DetectorError, FaceDetector};
use crate::error::FailureKind;
use crate::recognizer::{MIN_FACE_HEIGHT, MIN_FACE_WIDTH};
use crate::samples::{SampleError, SampleStore, SampleTag};
use crate::source::{CaptureDevice, FrameCursor, Pull, VideoSource};
use crate::types::{FaceRect, StudentRecord, REGISTRATION_DETECT};
use chrono::Utc;
use image::{GrayImage, RgbImage};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_CAPTURE_LIMIT: usize = 30;
pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("sample store: {0}")]
    Samples(#[from] SampleError),
}

impl CaptureError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            CaptureError::CameraUnavailable(_) => Some(FailureKind::CameraUnavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// Samples to collect before the capture ends.
    pub limit: usize,
    /// Minimum time between two saved samples.
    pub min_interval: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_CAPTURE_LIMIT,
            min_interval: DEFAULT_CAPTURE_INTERVAL,
        }
    }
}

/// A registration frame with boxes drawn on it and the progress so far.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub image: RgbImage,
    pub captured: usize,
    pub limit: usize,
}

/// Lazy registration stream. Saves face crops of one student as it goes.
pub struct RegistrationCapture<S, D> {
    cursor: FrameCursor<S>,
    detector: D,
    samples: SampleStore,
    student: StudentRecord,
    options: CaptureOptions,
    captured: usize,
    last_saved: Option<Instant>,
    span: tracing::Span,
}

impl<S: VideoSource, D: FaceDetector> RegistrationCapture<S, D> {
    /// Open `device` and begin capturing samples for `student`, who must
    /// already be in the registry.
    pub fn start<C>(
        device: &C,
        detector: D,
        samples: SampleStore,
        student: StudentRecord,
        options: CaptureOptions,
    ) -> Result<Self, CaptureError>
    where
        C: CaptureDevice<Source = S>,
    {
        let source = device
            .open()
            .map_err(|e| CaptureError::CameraUnavailable(e.to_string()))?;

        let span = tracing::info_span!(
            "registration",
            capture = %Uuid::new_v4(),
            student_id = %student.id
        );
        span.in_scope(|| tracing::info!(limit = options.limit, "registration capture started"));

        Ok(Self {
            cursor: FrameCursor::new(source),
            detector,
            samples,
            student,
            options,
            captured: 0,
            last_saved: None,
            span,
        })
    }

    fn is_complete(&self) -> bool {
        self.captured >= self.options.limit
    }

    fn process(&mut self, mut image: RgbImage) -> Result<CaptureFrame, CaptureError> {
        let gray = image::imageops::grayscale(&image);
        let boxes = self.detector.detect(&gray, REGISTRATION_DETECT)?;

        for bbox in &boxes {
            let Some(rect) = bbox.clamp_to(gray.width(), gray.height()) else {
                continue;
            };
            annotate::draw_rect(&mut image, rect, REGISTRATION_BOX, annotate::BOX_THICKNESS);

            let due = self
                .last_saved
                .map_or(true, |at| at.elapsed() >= self.options.min_interval);
            if rect.width < MIN_FACE_WIDTH || rect.height < MIN_FACE_HEIGHT {
                tracing::debug!(width = rect.width, height = rect.height, "face crop too small to keep");
                continue;
            }
            if due && !self.is_complete() {
                self.save_sample(&gray, rect)?;
            }
        }

        annotate::draw_progress(&mut image, self.captured, self.options.limit);
        Ok(CaptureFrame {
            image,
            captured: self.captured,
            limit: self.options.limit,
        })
    }

    fn save_sample(&mut self, gray: &GrayImage, rect: FaceRect) -> Result<(), CaptureError> {
        let crop = image::imageops::crop_imm(gray, rect.x, rect.y, rect.width, rect.height).to_image();
        let tag = SampleTag {
            student_id: self.student.id.clone(),
            name: self.student.name.clone(),
            sample_index: (self.captured + 1) as u32,
            captured_at: Utc::now(),
        };
        self.samples.save(&tag, &crop)?;
        self.captured += 1;
        self.last_saved = Some(Instant::now());
        Ok(())
    }
}

impl<S: VideoSource, D: FaceDetector> Iterator for RegistrationCapture<S, D> {
    type Item = Result<CaptureFrame, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.is_complete() {
            self.cursor.release();
            return None;
        }

        let frame = match self.cursor.pull() {
            Pull::Frame(frame) => frame,
            Pull::FirstReadFailed(reason) => {
                tracing::warn!(%reason, "camera produced no frames");
                return Some(Err(CaptureError::CameraUnavailable(reason)));
            }
            Pull::Ended => return None,
        };

        match self.process(frame) {
            Ok(frame) => {
                if self.is_complete() {
                    // Last frame; free the camera before the consumer asks again.
                    self.cursor.release();
                }
                Some(Ok(frame))
            }
            Err(e) => {
                tracing::warn!(error = %e, "registration capture stopped");
                self.cursor.release();
                Some(Err(e))
            }
        }
    }
}

impl<S, D> Drop for RegistrationCapture<S, D> {
    fn drop(&mut self) {
        let _enter = self.span.enter();
        tracing::info!(
            captured = self.captured,
            limit = self.options.limit,
            "registration capture ended"
        );
    }
}

/// Camera preview: frames with face boxes drawn, nothing saved.
pub struct PreviewFrames<S, D> {
    cursor: FrameCursor<S>,
    detector: D,
}

impl<S: VideoSource, D: FaceDetector> PreviewFrames<S, D> {
    pub fn start<C>(device: &C, detector: D) -> Result<Self, CaptureError>
    where
        C: CaptureDevice<Source = S>,
    {
        let source = device
            .open()
            .map_err(|e| CaptureError::CameraUnavailable(e.to_string()))?;
        tracing::info!("camera preview started");
        Ok(Self {
            cursor: FrameCursor::new(source),
            detector,
        })
    }
}

impl<S: VideoSource, D: FaceDetector> Iterator for PreviewFrames<S, D> {
    type Item = Result<RgbImage, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut image = match self.cursor.pull() {
            Pull::Frame(frame) => frame,
            Pull::FirstReadFailed(reason) => {
                return Some(Err(CaptureError::CameraUnavailable(reason)))
            }
            Pull::Ended => return None,
        };

        let gray = image::imageops::grayscale(&image);
        match self.detector.detect(&gray, REGISTRATION_DETECT) {
            Ok(boxes) => {
                for rect in boxes.iter().filter_map(|b| b.clamp_to(gray.width(), gray.height())) {
                    annotate::draw_rect(&mut image, rect, REGISTRATION_BOX, annotate::BOX_THICKNESS);
                }
                Some(Ok(image))
            }
            Err(e) => {
                self.cursor.release();
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use crate::types::{BoundingBox, DetectParams};
    use std::collections::VecDeque;

    struct Frames(VecDeque<RgbImage>);

    impl VideoSource for Frames {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            Ok(self.0.pop_front())
        }
    }

    struct Device(usize);

    impl CaptureDevice for Device {
        type Source = Frames;

        fn open(&self) -> Result<Frames, SourceError> {
            Ok(Frames((0..self.0).map(|_| RgbImage::new(80, 80)).collect()))
        }
    }

    struct Broken;

    impl CaptureDevice for Broken {
        type Source = Frames;

        fn open(&self) -> Result<Frames, SourceError> {
            Err(SourceError::Unavailable("no such device".into()))
        }
    }

    /// Reports `faces` boxes per frame.
    struct Faces {
        faces: usize,
        seen: Option<DetectParams>,
    }

    /// A face box hanging off the right edge of the 80x80 frame.
    struct EdgeFace;

    impl FaceDetector for EdgeFace {
        fn detect(
            &mut self,
            _frame: &GrayImage,
            _params: DetectParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![BoundingBox { x: 74.0, y: 20.0, width: 32.0, height: 32.0, confidence: 0.8 }])
        }
    }

    impl FaceDetector for Faces {
        fn detect(
            &mut self,
            _frame: &GrayImage,
            params: DetectParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            self.seen = Some(params);
            Ok((0..self.faces)
                .map(|i| BoundingBox {
                    x: 4.0 + 36.0 * i as f32,
                    y: 20.0,
                    width: 32.0,
                    height: 32.0,
                    confidence: 0.8,
                })
                .collect())
        }
    }

    fn student() -> StudentRecord {
        StudentRecord { id: "S1".into(), name: "Alice".into() }
    }

    fn unthrottled(limit: usize) -> CaptureOptions {
        CaptureOptions { limit, min_interval: Duration::ZERO }
    }

    #[test]
    fn test_ends_on_frame_reaching_limit() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let mut det = Faces { faces: 1, seen: None };

        let frames: Vec<_> =
            RegistrationCapture::start(&Device(10), &mut det, samples.clone(), student(), unthrottled(3))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();

        assert_eq!(det.seen, Some(REGISTRATION_DETECT));
        let progress: Vec<_> = frames.iter().map(|f| f.captured).collect();
        assert_eq!(progress, vec![1, 2, 3]);
        assert!(frames.iter().all(|f| f.limit == 3));

        let set = samples.load_all().unwrap();
        assert_eq!(set.faces.len(), 3);
        assert!(set.faces.iter().all(|f| f.student_id == "S1"));
        assert_eq!(set.faces[0].image.dimensions(), (32, 32));
    }

    #[test]
    fn test_never_exceeds_limit_with_many_faces() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let capture = RegistrationCapture::start(
            &Device(10),
            Faces { faces: 2, seen: None },
            samples.clone(),
            student(),
            unthrottled(3),
        )
        .unwrap();

        let last = capture.last().unwrap().unwrap();
        assert_eq!(last.captured, 3);
        assert_eq!(samples.image_paths().unwrap().len(), 3);
    }

    #[test]
    fn test_interval_throttles_saves() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let options = CaptureOptions { limit: 30, min_interval: Duration::from_secs(3600) };

        let frames: Vec<_> = RegistrationCapture::start(
            &Device(5),
            Faces { faces: 1, seen: None },
            samples,
            student(),
            options,
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(frames.len(), 5, "source ended before the limit");
        assert!(frames.iter().all(|f| f.captured == 1));
    }

    #[test]
    fn test_no_faces_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let frames: Vec<_> = RegistrationCapture::start(
            &Device(4),
            Faces { faces: 0, seen: None },
            samples.clone(),
            student(),
            unthrottled(3),
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(frames.len(), 4);
        assert!(samples.image_paths().unwrap().is_empty());
        // Progress overlay is drawn even without faces.
        if annotate::label_font().is_some() {
            assert!(frames[0].image.pixels().any(|p| *p != image::Rgb([0, 0, 0])));
        }
    }

    #[test]
    fn test_sliver_crop_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let frames: Vec<_> =
            RegistrationCapture::start(&Device(3), EdgeFace, samples.clone(), student(), unthrottled(3))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.captured == 0));
        assert!(samples.image_paths().unwrap().is_empty());
    }

    #[test]
    fn test_camera_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = RegistrationCapture::start(
            &Broken,
            Faces { faces: 1, seen: None },
            SampleStore::new(dir.path()),
            student(),
            CaptureOptions::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), Some(FailureKind::CameraUnavailable));

        let mut capture = RegistrationCapture::start(
            &Device(0),
            Faces { faces: 1, seen: None },
            SampleStore::new(dir.path()),
            student(),
            CaptureOptions::default(),
        )
        .unwrap();
        assert!(matches!(capture.next(), Some(Err(CaptureError::CameraUnavailable(_)))));
        assert!(capture.next().is_none());
    }

    #[test]
    fn test_preview_draws_boxes_only() {
        let frames: Vec<_> = PreviewFrames::start(&Device(2), Faces { faces: 1, seen: None })
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(*frames[0].get_pixel(4, 20), REGISTRATION_BOX);
    }
}
