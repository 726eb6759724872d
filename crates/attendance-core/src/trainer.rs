//! Train a recognizer from the sample store and persist the model.

use crate::error::FailureKind;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::samples::{SampleError, SampleStore};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no training images found")]
    NoSamples,
    #[error("no valid faces found to train ({skipped} unusable)")]
    NoValidSamples { skipped: usize },
    #[error("sample store: {0}")]
    Samples(#[from] SampleError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl TrainError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            TrainError::NoSamples => Some(FailureKind::NoSamples),
            TrainError::NoValidSamples { .. } => Some(FailureKind::NoValidSamples),
            _ => None,
        }
    }
}

/// What a successful training run consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainSummary {
    pub faces: usize,
    pub skipped: usize,
    /// Sample count per student id.
    pub per_student: BTreeMap<String, usize>,
}

/// Train `recognizer` on every usable sample and save it to `model_path`.
///
/// On any error the file at `model_path` is left as it was.
pub fn train_model<R: FaceRecognizer>(
    samples: &SampleStore,
    recognizer: &mut R,
    model_path: &Path,
) -> Result<TrainSummary, TrainError> {
    let set = samples.load_all()?;
    if set.total == 0 {
        return Err(TrainError::NoSamples);
    }

    let (faces, too_small): (Vec<_>, Vec<_>) =
        set.faces.into_iter().partition(|face| recognizer.accepts(&face.image));
    for face in &too_small {
        tracing::warn!(
            student_id = %face.student_id,
            width = face.image.width(),
            height = face.image.height(),
            "skipping sample too small to train on"
        );
    }
    let skipped = set.skipped + too_small.len();
    if faces.is_empty() {
        return Err(TrainError::NoValidSamples { skipped });
    }

    let mut per_student = BTreeMap::new();
    for face in &faces {
        *per_student.entry(face.student_id.clone()).or_insert(0) += 1;
    }

    recognizer.train(&faces)?;
    recognizer.save(model_path)?;

    tracing::info!(
        faces = faces.len(),
        skipped,
        students = per_student.len(),
        path = %model_path.display(),
        "model trained"
    );

    Ok(TrainSummary {
        faces: faces.len(),
        skipped,
        per_student,
    })
}
