//! LBPH (Local Binary Patterns Histograms) face recognizer.
//!
//! Each training face is reduced to a grid of 256-bin LBP histograms; a query
//! is matched against every stored histogram with the chi-square distance.
//! The returned confidence is that distance, so lower is better.

use crate::types::Prediction;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

const LBPH_RADIUS: u32 = 1;
const LBPH_NEIGHBORS: u32 = 8;
const LBPH_GRID_X: u32 = 8;
const LBPH_GRID_Y: u32 = 8;
const LBPH_BINS: usize = 1 << LBPH_NEIGHBORS;

/// Smallest crop the default grid can histogram: at least one LBP code per cell.
pub const MIN_FACE_WIDTH: u32 = 2 * LBPH_RADIUS + LBPH_GRID_X;
pub const MIN_FACE_HEIGHT: u32 = 2 * LBPH_RADIUS + LBPH_GRID_Y;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("recognizer has not been trained")]
    NotTrained,
    #[error("no training faces supplied")]
    EmptyTrainingSet,
    #[error("face crop {width}x{height} is too small for an {grid_x}x{grid_y} LBPH grid")]
    FaceTooSmall { width: u32, height: u32, grid_x: u32, grid_y: u32 },
    #[error("model file is malformed: {0}")]
    Malformed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A grayscale face crop paired with the student it belongs to.
#[derive(Debug, Clone)]
pub struct LabeledFace {
    pub student_id: String,
    pub image: GrayImage,
}

/// Trainable face classifier.
pub trait FaceRecognizer {
    /// Replace any prior training with `faces`.
    fn train(&mut self, faces: &[LabeledFace]) -> Result<(), RecognizerError>;

    /// Closest known student for a face crop.
    fn predict(&self, face: &GrayImage) -> Result<Prediction, RecognizerError>;

    /// Persist the trained model to `path`.
    fn save(&self, path: &Path) -> Result<(), RecognizerError>;

    /// Whether `predict` has anything to compare against.
    fn is_trained(&self) -> bool;

    /// Whether `face` is large enough to train on or predict from.
    fn accepts(&self, _face: &GrayImage) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LbphSample {
    label: String,
    histogram: Vec<f32>,
}

/// Serialized form of a trained LBPH model.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LbphModel {
    radius: u32,
    neighbors: u32,
    grid_x: u32,
    grid_y: u32,
    samples: Vec<LbphSample>,
}

/// LBPH recognizer with radius 1, 8 neighbours and an 8x8 grid.
#[derive(Debug, Clone)]
pub struct LbphRecognizer {
    grid_x: u32,
    grid_y: u32,
    samples: Vec<LbphSample>,
}

impl Default for LbphRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LbphRecognizer {
    /// An untrained recognizer.
    pub fn new() -> Self {
        Self {
            grid_x: LBPH_GRID_X,
            grid_y: LBPH_GRID_Y,
            samples: Vec::new(),
        }
    }

    /// Load a model previously written by [`FaceRecognizer::save`].
    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(path.display().to_string()));
        }
        let raw = fs::read(path)?;
        let model: LbphModel = serde_json::from_slice(&raw)?;

        if model.radius != LBPH_RADIUS || model.neighbors != LBPH_NEIGHBORS {
            return Err(RecognizerError::Malformed(format!(
                "unsupported LBP operator radius={} neighbors={}",
                model.radius, model.neighbors
            )));
        }
        if model.grid_x == 0 || model.grid_y == 0 {
            return Err(RecognizerError::Malformed("grid dimensions must be non-zero".into()));
        }
        let expected = (model.grid_x * model.grid_y) as usize * LBPH_BINS;
        if let Some(bad) = model.samples.iter().find(|s| s.histogram.len() != expected) {
            return Err(RecognizerError::Malformed(format!(
                "sample for {} has {} bins, expected {expected}",
                bad.label,
                bad.histogram.len()
            )));
        }

        tracing::info!(
            path = %path.display(),
            samples = model.samples.len(),
            "loaded LBPH model"
        );

        Ok(Self {
            grid_x: model.grid_x,
            grid_y: model.grid_y,
            samples: model.samples,
        })
    }

    /// Number of stored training histograms.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn fits_grid(&self, width: u32, height: u32) -> bool {
        width >= 2 * LBPH_RADIUS + self.grid_x && height >= 2 * LBPH_RADIUS + self.grid_y
    }

    fn histogram(&self, face: &GrayImage) -> Result<Vec<f32>, RecognizerError> {
        let codes = lbp_codes(face);
        spatial_histogram(&codes, self.grid_x, self.grid_y).ok_or(RecognizerError::FaceTooSmall {
            width: face.width(),
            height: face.height(),
            grid_x: self.grid_x,
            grid_y: self.grid_y,
        })
    }
}

impl FaceRecognizer for LbphRecognizer {
    fn train(&mut self, faces: &[LabeledFace]) -> Result<(), RecognizerError> {
        if faces.is_empty() {
            return Err(RecognizerError::EmptyTrainingSet);
        }
        let samples = faces
            .iter()
            .map(|face| {
                Ok(LbphSample {
                    label: face.student_id.clone(),
                    histogram: self.histogram(&face.image)?,
                })
            })
            .collect::<Result<Vec<_>, RecognizerError>>()?;
        self.samples = samples;
        Ok(())
    }

    fn predict(&self, face: &GrayImage) -> Result<Prediction, RecognizerError> {
        if self.samples.is_empty() {
            return Err(RecognizerError::NotTrained);
        }
        let query = self.histogram(face)?;

        let mut best: Option<(&LbphSample, f64)> = None;
        for sample in &self.samples {
            let dist = chi_square(&sample.histogram, &query);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((sample, dist));
            }
        }

        match best {
            Some((sample, confidence)) => Ok(Prediction {
                student_id: sample.label.clone(),
                confidence,
            }),
            None => Err(RecognizerError::NotTrained),
        }
    }

    fn save(&self, path: &Path) -> Result<(), RecognizerError> {
        let model = LbphModel {
            radius: LBPH_RADIUS,
            neighbors: LBPH_NEIGHBORS,
            grid_x: self.grid_x,
            grid_y: self.grid_y,
            samples: self.samples.clone(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write beside the target and rename so a crash never leaves a torn model.
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, &model)?;
            file.flush()?;
        }
        fs::rename(&tmp, path)?;

        tracing::info!(path = %path.display(), samples = model.samples.len(), "saved LBPH model");
        Ok(())
    }

    fn is_trained(&self) -> bool {
        !self.samples.is_empty()
    }

    fn accepts(&self, face: &GrayImage) -> bool {
        self.fits_grid(face.width(), face.height())
    }
}

/// Basic 3x3 LBP operator. The output is `(w - 2) x (h - 2)`; border pixels
/// have no full neighbourhood and are skipped.
fn lbp_codes(face: &GrayImage) -> GrayImage {
    let (w, h) = face.dimensions();
    let r = LBPH_RADIUS;
    if w <= 2 * r || h <= 2 * r {
        return GrayImage::new(0, 0);
    }

    // Clockwise from the top-left neighbour.
    const OFFSETS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    GrayImage::from_fn(w - 2 * r, h - 2 * r, |x, y| {
        let cx = x + r;
        let cy = y + r;
        let center = face.get_pixel(cx, cy).0[0];
        let mut code = 0u8;
        for (bit, (dx, dy)) in OFFSETS.iter().enumerate() {
            let nx = (cx as i32 + dx) as u32;
            let ny = (cy as i32 + dy) as u32;
            if face.get_pixel(nx, ny).0[0] >= center {
                code |= 1 << bit;
            }
        }
        image::Luma([code])
    })
}

/// Concatenated per-cell histograms, each normalized by its cell's pixel count.
///
/// Returns `None` when the code image is smaller than the grid.
fn spatial_histogram(codes: &GrayImage, grid_x: u32, grid_y: u32) -> Option<Vec<f32>> {
    let (w, h) = codes.dimensions();
    let cell_w = w / grid_x;
    let cell_h = h / grid_y;
    if cell_w == 0 || cell_h == 0 {
        return None;
    }

    let cell_pixels = (cell_w * cell_h) as f32;
    let mut histogram = vec![0f32; (grid_x * grid_y) as usize * LBPH_BINS];

    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let base = (gy * grid_x + gx) as usize * LBPH_BINS;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    histogram[base + codes.get_pixel(x, y).0[0] as usize] += 1.0;
                }
            }
            for bin in &mut histogram[base..base + LBPH_BINS] {
                *bin /= cell_pixels;
            }
        }
    }

    Some(histogram)
}

/// Symmetric chi-square distance: `sum 2 (a - b)^2 / (a + b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&p, &q)| {
            let sum = (p + q) as f64;
            if sum > f64::EPSILON {
                let diff = (p - q) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(size: u32, cell: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                image::Luma([30])
            } else {
                image::Luma([220])
            }
        })
    }

    fn gradient(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| image::Luma([((x * 3 + y * 5) % 256) as u8]))
    }

    fn face(id: &str, image: GrayImage) -> LabeledFace {
        LabeledFace { student_id: id.to_string(), image }
    }

    #[test]
    fn test_lbp_uniform_image_is_all_ones() {
        // Every neighbour equals the centre, so every bit is set.
        let img = GrayImage::from_pixel(10, 10, image::Luma([77]));
        let codes = lbp_codes(&img);
        assert_eq!(codes.dimensions(), (8, 8));
        assert!(codes.pixels().all(|p| p.0[0] == 0xFF));
    }

    #[test]
    fn test_lbp_too_small() {
        let img = GrayImage::from_pixel(2, 2, image::Luma([0]));
        assert_eq!(lbp_codes(&img).dimensions(), (0, 0));
    }

    #[test]
    fn test_spatial_histogram_cells_sum_to_one() {
        let codes = lbp_codes(&gradient(66));
        let hist = spatial_histogram(&codes, 8, 8).unwrap();
        assert_eq!(hist.len(), 64 * LBPH_BINS);
        for cell in hist.chunks(LBPH_BINS) {
            let sum: f32 = cell.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "cell sums to {sum}");
        }
    }

    #[test]
    fn test_chi_square_identical_is_zero() {
        let a = vec![0.25f32, 0.25, 0.5, 0.0];
        assert_eq!(chi_square(&a, &a), 0.0);
    }

    #[test]
    fn test_chi_square_disjoint() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        // 2*1/1 + 2*1/1
        assert!((chi_square(&a, &b) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_predict_untrained() {
        let rec = LbphRecognizer::new();
        assert!(!rec.is_trained());
        assert!(matches!(rec.predict(&gradient(40)), Err(RecognizerError::NotTrained)));
    }

    #[test]
    fn test_train_rejects_empty() {
        let mut rec = LbphRecognizer::new();
        assert!(matches!(rec.train(&[]), Err(RecognizerError::EmptyTrainingSet)));
    }

    #[test]
    fn test_train_rejects_tiny_face() {
        let mut rec = LbphRecognizer::new();
        let err = rec.train(&[face("S1", gradient(6))]).unwrap_err();
        assert!(matches!(err, RecognizerError::FaceTooSmall { .. }));
        assert!(!rec.is_trained());
    }

    #[test]
    fn test_accepts_matches_grid_minimum() {
        let rec = LbphRecognizer::new();
        assert!(rec.accepts(&GrayImage::new(MIN_FACE_WIDTH, MIN_FACE_HEIGHT)));
        assert!(!rec.accepts(&GrayImage::new(MIN_FACE_WIDTH - 1, 40)));
        assert!(!rec.accepts(&GrayImage::new(40, MIN_FACE_HEIGHT - 1)));

        let mut rec = LbphRecognizer::new();
        rec.train(&[face("S1", GrayImage::new(MIN_FACE_WIDTH, MIN_FACE_HEIGHT))]).unwrap();
        assert!(rec.is_trained());
    }

    #[test]
    fn test_predict_picks_closest_student() {
        let mut rec = LbphRecognizer::new();
        rec.train(&[face("S1", checker(64, 8)), face("S2", gradient(64))]).unwrap();

        let p = rec.predict(&checker(64, 8)).unwrap();
        assert_eq!(p.student_id, "S1");
        assert!(p.confidence < 1e-9);

        let p = rec.predict(&gradient(64)).unwrap();
        assert_eq!(p.student_id, "S2");
        assert!(p.confidence < 1e-9);
    }

    #[test]
    fn test_save_load_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/trainer.json");

        let mut rec = LbphRecognizer::new();
        rec.train(&[face("S1", checker(48, 6)), face("S2", gradient(48))]).unwrap();
        rec.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = LbphRecognizer::load(&path).unwrap();
        assert_eq!(loaded.sample_count(), 2);
        let before = rec.predict(&gradient(48)).unwrap();
        let after = loaded.predict(&gradient(48)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_load_missing() {
        let err = LbphRecognizer::load(Path::new("/nonexistent/trainer.json")).unwrap_err();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }

    #[test]
    fn test_load_rejects_wrong_bin_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        fs::write(
            &path,
            r#"{"radius":1,"neighbors":8,"grid_x":8,"grid_y":8,"samples":[{"label":"S1","histogram":[1.0]}]}"#,
        )
        .unwrap();
        assert!(matches!(LbphRecognizer::load(&path), Err(RecognizerError::Malformed(_))));
    }
}
