//! Live recognition session.
//!
//! An [`AttendanceSession`] owns the roster of students seen since the last
//! commit. [`AttendanceSession::start`] opens the camera and hands back a lazy
//! [`LiveFrames`] iterator; every recognized face lands in the roster, and
//! [`AttendanceSession::commit`] writes the roster to today's ledger.

use crate::annotate::{self, RECOGNITION_BOX};
use crate::detector::{DetectorError, FaceDetector};
use crate::error::FailureKind;
use crate::recognizer::{FaceRecognizer, LbphRecognizer, RecognizerError};
use crate::source::{CaptureDevice, FrameCursor, Pull, VideoSource};
use crate::store::{MarkOutcome, RosterStore, StoreError, UNKNOWN_NAME};
use crate::types::{passes_gate, Recognition, RECOGNITION_DETECT};
use image::RgbImage;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no trained model: register students and train first")]
    ModelNotTrained,
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SessionError::ModelNotTrained => Some(FailureKind::ModelNotTrained),
            SessionError::CameraUnavailable(_) => Some(FailureKind::CameraUnavailable),
            SessionError::Store(e) => e.kind(),
            _ => None,
        }
    }
}

/// Load the persisted model, mapping a missing file to `ModelNotTrained`.
pub fn load_model(path: &Path) -> Result<LbphRecognizer, SessionError> {
    match LbphRecognizer::load(path) {
        Ok(recognizer) => Ok(recognizer),
        Err(RecognizerError::ModelNotFound(_)) => Err(SessionError::ModelNotTrained),
        Err(e) => Err(e.into()),
    }
}

/// Result of writing the roster to the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CommitSummary {
    pub saved: usize,
    pub already_marked: usize,
}

/// Roster of students recognized since the last commit or clear.
#[derive(Debug)]
pub struct AttendanceSession {
    id: Uuid,
    roster: Mutex<BTreeSet<String>>,
}

impl Default for AttendanceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AttendanceSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            roster: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        // A panic mid-insert cannot leave a BTreeSet half-updated.
        self.roster.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `id`. Returns whether it was new.
    pub fn add(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    /// Sorted snapshot of the roster.
    pub fn roster(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Mark attendance for every roster id, then empty the roster.
    ///
    /// The roster stays locked for the whole pass. On a storage error it is
    /// left untouched, so ids marked before the failure will count as
    /// `already_marked` on retry.
    pub fn commit(&self, store: &RosterStore) -> Result<CommitSummary, SessionError> {
        let mut roster = self.lock();
        let mut summary = CommitSummary::default();

        for id in roster.iter() {
            let name = store.student_name(id);
            match store.mark_attendance(id, &name)? {
                MarkOutcome::Marked(_) => summary.saved += 1,
                MarkOutcome::AlreadyMarkedToday => summary.already_marked += 1,
            }
        }
        roster.clear();

        tracing::info!(
            session = %self.id,
            saved = summary.saved,
            already_marked = summary.already_marked,
            "roster committed"
        );
        Ok(summary)
    }

    /// Open `device` and start recognizing.
    ///
    /// The model is checked before the camera is touched. The returned
    /// iterator holds the camera until it ends or is dropped.
    pub fn start<C, D, R>(
        self: &Arc<Self>,
        device: &C,
        detector: D,
        recognizer: R,
        store: RosterStore,
    ) -> Result<LiveFrames<C::Source, D, R>, SessionError>
    where
        C: CaptureDevice,
        D: FaceDetector,
        R: FaceRecognizer,
    {
        if !recognizer.is_trained() {
            return Err(SessionError::ModelNotTrained);
        }
        let source = device
            .open()
            .map_err(|e| SessionError::CameraUnavailable(e.to_string()))?;

        let span = tracing::info_span!("live_session", session = %self.id, run = %Uuid::new_v4());
        span.in_scope(|| tracing::info!("live recognition started"));

        Ok(LiveFrames {
            session: Arc::clone(self),
            cursor: FrameCursor::new(source),
            detector,
            recognizer,
            store,
            span,
        })
    }
}

/// One annotated frame of a live session.
#[derive(Debug, Clone)]
pub struct LiveFrame {
    pub image: RgbImage,
    /// Faces in this frame that passed the confidence gate.
    pub recognized: Vec<Recognition>,
}

/// Lazy stream of annotated frames. Dropping it releases the camera.
pub struct LiveFrames<S, D, R> {
    session: Arc<AttendanceSession>,
    cursor: FrameCursor<S>,
    detector: D,
    recognizer: R,
    store: RosterStore,
    span: tracing::Span,
}

impl<S, D, R> LiveFrames<S, D, R>
where
    S: VideoSource,
    D: FaceDetector,
    R: FaceRecognizer,
{
    fn process(&mut self, mut image: RgbImage) -> Result<LiveFrame, SessionError> {
        let gray = image::imageops::grayscale(&image);
        let boxes = self.detector.detect(&gray, RECOGNITION_DETECT)?;
        let mut recognized = Vec::new();

        for bbox in &boxes {
            let Some(rect) = bbox.clamp_to(gray.width(), gray.height()) else {
                continue;
            };
            let crop = image::imageops::crop_imm(&gray, rect.x, rect.y, rect.width, rect.height)
                .to_image();

            let prediction = match self.recognizer.predict(&crop) {
                Ok(p) => Some(p),
                Err(RecognizerError::FaceTooSmall { width, height, .. }) => {
                    tracing::debug!(width, height, "face too small to recognize");
                    None
                }
                Err(e) => return Err(e.into()),
            };

            let label = match prediction {
                Some(p) if passes_gate(p.confidence) => {
                    let name = self.store.student_name(&p.student_id);
                    let label = format!("{} ({})", name, p.confidence as i64);
                    if self.session.add(&p.student_id) {
                        tracing::info!(student_id = %p.student_id, %name, confidence = p.confidence, "student recognized");
                    }
                    recognized.push(Recognition {
                        student_id: p.student_id,
                        name,
                        confidence: p.confidence,
                    });
                    label
                }
                Some(p) => {
                    tracing::debug!(candidate = %p.student_id, confidence = p.confidence, "below gate");
                    UNKNOWN_NAME.to_string()
                }
                None => UNKNOWN_NAME.to_string(),
            };
            annotate::label_face(&mut image, rect, &label, RECOGNITION_BOX);
        }

        tracing::trace!(faces = boxes.len(), recognized = recognized.len(), "frame processed");
        Ok(LiveFrame { image, recognized })
    }
}

impl<S, D, R> Iterator for LiveFrames<S, D, R>
where
    S: VideoSource,
    D: FaceDetector,
    R: FaceRecognizer,
{
    type Item = Result<LiveFrame, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.span.clone();
        let _enter = span.enter();

        let frame = match self.cursor.pull() {
            Pull::Frame(frame) => frame,
            Pull::FirstReadFailed(reason) => {
                tracing::warn!(%reason, "camera produced no frames");
                return Some(Err(SessionError::CameraUnavailable(reason)));
            }
            Pull::Ended => return None,
        };

        match self.process(frame) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                tracing::warn!(error = %e, "live recognition stopped");
                self.cursor.release();
                Some(Err(e))
            }
        }
    }
}

impl<S, D, R> Drop for LiveFrames<S, D, R> {
    fn drop(&mut self) {
        let _enter = self.span.enter();
        tracing::info!(
            roster = self.session.lock().len(),
            "live recognition ended"
        );
    }
}
