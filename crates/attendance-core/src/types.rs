use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Distance below which a recognizer prediction counts as a positive match.
///
/// LBPH confidence is a chi-square distance, so lower is better and the
/// comparison is strict: a distance of exactly 50 is rejected.
pub const CONFIDENCE_GATE: f64 = 50.0;

/// Whether a prediction with this confidence passes the gate.
pub fn passes_gate(confidence: f64) -> bool {
    confidence < CONFIDENCE_GATE
}

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Integer rectangle clipped to a `width` x `height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRect> {
        let x0 = self.x.floor().max(0.0);
        let y0 = self.y.floor().max(0.0);
        let x1 = (self.x + self.width).ceil().min(width as f32);
        let y1 = (self.y + self.height).ceil().min(height as f32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(FaceRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Pixel-aligned face rectangle, guaranteed to lie inside its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Tuning passed to a detector on every call.
///
/// Each call site uses a fixed pair; see [`REGISTRATION_DETECT`] and
/// [`RECOGNITION_DETECT`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Pyramid step between successive detection scales.
    pub scale_factor: f32,
    /// Minimum number of raw candidates that must support a reported face.
    pub min_neighbors: u32,
}

/// Detection tuning used while capturing registration samples.
pub const REGISTRATION_DETECT: DetectParams = DetectParams {
    scale_factor: 1.3,
    min_neighbors: 5,
};

/// Detection tuning used by live recognition sessions.
pub const RECOGNITION_DETECT: DetectParams = DetectParams {
    scale_factor: 1.2,
    min_neighbors: 5,
};

/// Recognizer output for a single face crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub student_id: String,
    /// Distance-style score; lower means a closer match.
    pub confidence: f64,
}

/// A face that passed the confidence gate in one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub student_id: String,
    pub name: String,
    pub confidence: f64,
}

/// A registered student. Row of `students.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// One attendance mark. Row of a daily `Attendance_<date>.csv` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Time")]
    pub time: NaiveTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_gate_boundary_is_strict() {
        assert!(!passes_gate(50.0));
        assert!(passes_gate(49.999));
        assert!(passes_gate(0.0));
        assert!(!passes_gate(120.5));
    }

    #[test]
    fn test_clamp_inside_frame() {
        let rect = bbox(10.0, 20.0, 30.0, 40.0).clamp_to(100, 100).unwrap();
        assert_eq!(rect, FaceRect { x: 10, y: 20, width: 30, height: 40 });
    }

    #[test]
    fn test_clamp_partially_outside() {
        let rect = bbox(-5.0, 90.0, 20.0, 20.0).clamp_to(100, 100).unwrap();
        assert_eq!(rect, FaceRect { x: 0, y: 90, width: 15, height: 10 });
    }

    #[test]
    fn test_clamp_fully_outside() {
        assert!(bbox(150.0, 0.0, 20.0, 20.0).clamp_to(100, 100).is_none());
        assert!(bbox(10.0, 10.0, 0.0, 5.0).clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_detect_params_asymmetry() {
        assert_eq!(REGISTRATION_DETECT.min_neighbors, RECOGNITION_DETECT.min_neighbors);
        assert!(REGISTRATION_DETECT.scale_factor > RECOGNITION_DETECT.scale_factor);
    }
}
