//! Training sample store.
//!
//! Each sample is a grayscale PNG face crop named by a random UUID, with a JSON
//! sidecar of the same stem carrying its [`SampleTag`]. Identity lives only in
//! the sidecar, never in the file name.

use crate::recognizer::LabeledFace;
use chrono::{DateTime, Utc};
use image::{GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const IMAGE_EXT: &str = "png";
const TAG_EXT: &str = "json";

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured identity of one training sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTag {
    pub student_id: String,
    pub name: String,
    pub sample_index: u32,
    pub captured_at: DateTime<Utc>,
}

/// Result of loading every sample in the store.
#[derive(Debug, Default)]
pub struct SampleSet {
    pub faces: Vec<LabeledFace>,
    /// Number of sample images found, usable or not.
    pub total: usize,
    /// Images skipped because they or their sidecar could not be read.
    pub skipped: usize,
}

/// Directory of tagged face crops.
#[derive(Debug, Clone)]
pub struct SampleStore {
    dir: PathBuf,
}

impl SampleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist one face crop with its tag. Returns the image path.
    pub fn save(&self, tag: &SampleTag, face: &GrayImage) -> Result<PathBuf, SampleError> {
        fs::create_dir_all(&self.dir)?;
        let stem = Uuid::new_v4().to_string();
        let image_path = self.dir.join(&stem).with_extension(IMAGE_EXT);
        let tag_path = self.dir.join(&stem).with_extension(TAG_EXT);

        face.save_with_format(&image_path, ImageFormat::Png)?;
        fs::write(&tag_path, serde_json::to_vec_pretty(tag)?)?;

        tracing::debug!(
            student_id = %tag.student_id,
            index = tag.sample_index,
            path = %image_path.display(),
            "training sample saved"
        );
        Ok(image_path)
    }

    /// Image files currently in the store.
    pub fn image_paths(&self) -> Result<Vec<PathBuf>, SampleError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == IMAGE_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Load every readable, tagged sample. Unreadable ones are logged and counted.
    pub fn load_all(&self) -> Result<SampleSet, SampleError> {
        let paths = self.image_paths()?;
        let mut set = SampleSet {
            total: paths.len(),
            ..SampleSet::default()
        };

        for path in paths {
            match load_sample(&path) {
                Ok((tag, image)) => set.faces.push(LabeledFace {
                    student_id: tag.student_id,
                    image,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping training sample");
                    set.skipped += 1;
                }
            }
        }
        Ok(set)
    }
}

fn load_sample(image_path: &Path) -> Result<(SampleTag, GrayImage), SampleError> {
    let raw = fs::read(image_path.with_extension(TAG_EXT))?;
    let tag: SampleTag = serde_json::from_slice(&raw)?;
    let image = image::open(image_path)?.to_luma8();
    Ok((tag, image))
}
