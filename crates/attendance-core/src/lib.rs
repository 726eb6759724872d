//! attendance-core: face registration, training and live attendance.
//!
//! Detection runs SCRFD through ONNX Runtime; recognition is an LBPH
//! recognizer trained from the sample store. Registry and daily ledgers are
//! plain CSV files under one data directory.

pub mod annotate;
pub mod capture;
pub mod config;
pub mod detector;
pub mod error;
pub mod recognizer;
pub mod samples;
pub mod session;
pub mod source;
pub mod store;
pub mod trainer;
pub mod types;

pub use capture::{CaptureError, CaptureFrame, CaptureOptions, PreviewFrames, RegistrationCapture};
pub use config::{Config, SecretCheck};
pub use detector::{FaceDetector, ScrfdDetector};
pub use error::FailureKind;
pub use recognizer::{FaceRecognizer, LbphRecognizer};
pub use samples::SampleStore;
pub use session::{AttendanceSession, CommitSummary, LiveFrame, LiveFrames, SessionError};
pub use source::{CaptureDevice, SourceError, VideoSource};
pub use store::{DataLayout, MarkOutcome, RosterStore, StoreError};
pub use trainer::{train_model, TrainError, TrainSummary};
pub use types::{AttendanceRecord, DetectParams, Recognition, StudentRecord};
