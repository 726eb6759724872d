use attendance_core::config::{Config, SecretCheck};
use attendance_core::detector::{DetectorError, FaceDetector};
use attendance_core::session::{load_model, LiveFrames};
use attendance_core::source::{CaptureDevice, SourceError, VideoSource};
use attendance_core::types::{BoundingBox, DetectParams};
use attendance_core::{
    train_model, AttendanceSession, CaptureError, CommitSummary, FailureKind, LbphRecognizer,
    RegistrationCapture, RosterStore, SampleStore, SessionError, StoreError, StudentRecord,
    TrainError, TrainSummary,
};
use image::GrayImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera is in use by another stream")]
    CameraBusy,
    #[error("incorrect password")]
    Forbidden,
    #[error("bulk clear is disabled: no danger secret configured")]
    ClearDisabled,
    #[error("student {0} is not registered")]
    UnknownStudent(String),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Capture(#[from] CaptureError),
    #[error("{0}")]
    Train(#[from] TrainError),
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            EngineError::Session(e) => e.kind(),
            EngineError::Capture(e) => e.kind(),
            EngineError::Train(e) => e.kind(),
            EngineError::Store(e) => e.kind(),
            _ => None,
        }
    }

    /// HTTP status reported for this error.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::CameraBusy => 409,
            EngineError::Forbidden | EngineError::ClearDisabled => 403,
            EngineError::UnknownStudent(_) => 404,
            EngineError::Store(StoreError::MissingField) => 400,
            _ => self.kind().map_or(500, FailureKind::http_status),
        }
    }
}

pub type DynSource = Box<dyn VideoSource + Send>;
type DynDevice = Box<dyn CaptureDevice<Source = DynSource> + Send + Sync>;
type DynDetector = Box<dyn FaceDetector + Send>;
type DetectorSlot = Arc<Mutex<Option<DynDetector>>>;

/// Erases a concrete device's source type so the engine can hold any camera.
struct BoxedDevice<C>(C);

impl<C> CaptureDevice for BoxedDevice<C>
where
    C: CaptureDevice,
    C::Source: Send + 'static,
{
    type Source = DynSource;

    fn open(&self) -> Result<DynSource, SourceError> {
        Ok(Box::new(self.0.open()?))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive hold on the camera and the face detector for one stream.
///
/// Handed back to the engine when dropped.
pub struct CameraLease {
    slot: DetectorSlot,
    detector: Option<DynDetector>,
}

impl FaceDetector for CameraLease {
    fn detect(
        &mut self,
        frame: &GrayImage,
        params: DetectParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        match self.detector.as_mut() {
            Some(detector) => detector.detect(frame, params),
            None => Err(DetectorError::InferenceFailed("camera lease already returned".into())),
        }
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        if let Some(detector) = self.detector.take() {
            *lock(&self.slot) = Some(detector);
            tracing::debug!("camera lease released");
        }
    }
}

/// Dashboard numbers and the registered student list.
#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub today_count: usize,
    pub total_students: usize,
    pub students: Vec<StudentRecord>,
}

pub type AttendanceFrames = LiveFrames<DynSource, CameraLease, LbphRecognizer>;
pub type RegistrationFrames = RegistrationCapture<DynSource, CameraLease>;

/// Everything the HTTP handlers share: store, roster, camera and detector.
///
/// The camera and detector are used by at most one stream at a time; see
/// [`CameraLease`]. Registry and ledger writes are serialized by `writes`.
pub struct Engine {
    config: Config,
    store: RosterStore,
    session: Arc<AttendanceSession>,
    device: DynDevice,
    detector: DetectorSlot,
    writes: Mutex<()>,
}

impl Engine {
    pub fn new<C, D>(config: Config, device: C, detector: D) -> Result<Self, EngineError>
    where
        C: CaptureDevice + Send + Sync + 'static,
        C::Source: Send + 'static,
        D: FaceDetector + Send + 'static,
    {
        let store = RosterStore::open(config.layout())?;
        let session = Arc::new(AttendanceSession::new());
        tracing::info!(
            data_dir = %config.data_dir.display(),
            session = %session.id(),
            "engine ready"
        );
        Ok(Self {
            config,
            store,
            session,
            device: Box::new(BoxedDevice(device)),
            detector: Arc::new(Mutex::new(Some(Box::new(detector)))),
            writes: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &RosterStore {
        &self.store
    }

    pub fn session(&self) -> &Arc<AttendanceSession> {
        &self.session
    }

    fn samples(&self) -> SampleStore {
        SampleStore::new(self.store.layout().training_dir())
    }

    /// Take the camera, or fail with `CameraBusy` if a stream already has it.
    pub fn acquire_camera(&self) -> Result<CameraLease, EngineError> {
        let detector = lock(&self.detector).take().ok_or(EngineError::CameraBusy)?;
        tracing::debug!("camera lease acquired");
        Ok(CameraLease {
            slot: Arc::clone(&self.detector),
            detector: Some(detector),
        })
    }

    pub fn dashboard(&self) -> Dashboard {
        let students = self.store.students();
        Dashboard {
            today_count: self.store.today_records().len(),
            total_students: students.len(),
            students,
        }
    }

    pub fn register_student(&self, id: &str, name: &str) -> Result<StudentRecord, EngineError> {
        let _guard = lock(&self.writes);
        Ok(self.store.add_student(id, name)?)
    }

    pub fn train(&self) -> Result<TrainSummary, EngineError> {
        let _guard = lock(&self.writes);
        let model_path = self.store.layout().model_file();
        let mut recognizer = LbphRecognizer::new();
        Ok(train_model(&self.samples(), &mut recognizer, &model_path)?)
    }

    /// Roster ids with their registry names.
    pub fn current_attendance(&self) -> Vec<StudentRecord> {
        self.session
            .roster()
            .into_iter()
            .map(|id| StudentRecord {
                name: self.store.student_name(&id),
                id,
            })
            .collect()
    }

    pub fn save_attendance(&self) -> Result<CommitSummary, EngineError> {
        let _guard = lock(&self.writes);
        Ok(self.session.commit(&self.store)?)
    }

    pub fn clear_roster(&self) {
        self.session.clear();
        tracing::info!(session = %self.session.id(), "roster cleared");
    }

    /// Wipe all persisted data and the roster, if `password` matches.
    pub fn clear_all(&self, password: &str) -> Result<(), EngineError> {
        match self.config.verify_danger_secret(password) {
            SecretCheck::Accepted => {}
            SecretCheck::Rejected => {
                tracing::warn!("bulk clear rejected: incorrect password");
                return Err(EngineError::Forbidden);
            }
            SecretCheck::Disabled => return Err(EngineError::ClearDisabled),
        }
        let _guard = lock(&self.writes);
        self.store.clear_all()?;
        self.session.clear();
        Ok(())
    }

    /// Start a live recognition stream feeding the shared roster.
    pub fn attendance_stream(&self) -> Result<AttendanceFrames, EngineError> {
        let recognizer = load_model(&self.store.layout().model_file())?;
        let lease = self.acquire_camera()?;
        Ok(self
            .session
            .start(&self.device, lease, recognizer, self.store.clone())?)
    }

    /// Start capturing training samples for a registered student.
    pub fn registration_stream(&self, id: &str) -> Result<RegistrationFrames, EngineError> {
        let student = self
            .store
            .students()
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::UnknownStudent(id.to_string()))?;
        let lease = self.acquire_camera()?;
        Ok(RegistrationCapture::start(
            &self.device,
            lease,
            self.samples(),
            student,
            self.config.capture_options(),
        )?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::RgbImage;
    use std::collections::VecDeque;

    pub struct FakeSource(VecDeque<RgbImage>);

    impl VideoSource for FakeSource {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            Ok(self.0.pop_front())
        }
    }

    /// Shows the same textured frame `frames` times per open.
    pub struct FakeCamera {
        pub frames: usize,
    }

    impl CaptureDevice for FakeCamera {
        type Source = FakeSource;

        fn open(&self) -> Result<FakeSource, SourceError> {
            let frame = RgbImage::from_fn(80, 80, |x, y| {
                let v = ((x * 5 + y * 11) ^ (x + y)) as u8;
                image::Rgb([v, v, v])
            });
            Ok(FakeSource((0..self.frames).map(|_| frame.clone()).collect()))
        }
    }

    pub struct FakeDetector;

    impl FaceDetector for FakeDetector {
        fn detect(
            &mut self,
            _frame: &GrayImage,
            _params: DetectParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![BoundingBox { x: 16.0, y: 16.0, width: 48.0, height: 48.0, confidence: 0.9 }])
        }
    }

    pub fn engine(dir: &std::path::Path, secret: Option<&str>) -> Engine {
        engine_with_camera(dir, secret, FakeCamera { frames: 10 })
    }

    pub fn engine_with_camera(dir: &std::path::Path, secret: Option<&str>, camera: FakeCamera) -> Engine {
        let config = Config {
            data_dir: dir.to_path_buf(),
            capture_limit: 3,
            capture_interval_ms: 0,
            danger_secret: secret.map(str::to_string),
            ..Config::default()
        };
        Engine::new(config, camera, FakeDetector).unwrap()
    }

    #[test]
    fn test_train_waits_for_other_writes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);

        let guard = lock(&engine.writes);
        std::thread::scope(|scope| {
            let training = scope.spawn(|| engine.train());
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!training.is_finished());
            drop(guard);
            assert!(matches!(
                training.join().unwrap(),
                Err(EngineError::Train(TrainError::NoSamples))
            ));
        });
    }

    #[test]
    fn test_lease_is_exclusive_and_returned_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);

        let lease = engine.acquire_camera().unwrap();
        assert!(matches!(engine.acquire_camera(), Err(EngineError::CameraBusy)));
        assert_eq!(EngineError::CameraBusy.status(), 409);
        drop(lease);
        assert!(engine.acquire_camera().is_ok());
    }

    #[test]
    fn test_attendance_stream_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        let err = engine.attendance_stream().err().unwrap();
        assert_eq!(err.kind(), Some(FailureKind::ModelNotTrained));
        assert_eq!(err.status(), 409);
        // The failed start must not keep the camera.
        assert!(engine.acquire_camera().is_ok());
    }

    #[test]
    fn test_register_capture_train_and_attend() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);

        engine.register_student("S1", "Alice").unwrap();
        let dup = engine.register_student("S1", "Alice").unwrap_err();
        assert_eq!(dup.status(), 400);

        let captured: Vec<_> = engine.registration_stream("S1").unwrap().map(|f| f.unwrap().captured).collect();
        assert_eq!(captured, vec![1, 2, 3]);

        let summary = engine.train().unwrap();
        assert_eq!(summary.faces, 3);

        {
            let mut stream = engine.attendance_stream().unwrap();
            assert!(matches!(engine.acquire_camera(), Err(EngineError::CameraBusy)));
            let frame = stream.next().unwrap().unwrap();
            assert_eq!(frame.recognized[0].name, "Alice");
        }
        assert!(engine.acquire_camera().is_ok());

        let current = engine.current_attendance();
        assert_eq!(current, vec![StudentRecord { id: "S1".into(), name: "Alice".into() }]);
        assert_eq!(engine.save_attendance().unwrap().saved, 1);
        assert_eq!(engine.dashboard().today_count, 1);
    }

    #[test]
    fn test_registration_stream_unknown_student() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        let err = engine.registration_stream("nobody").err().unwrap();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_train_without_samples() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        let err = engine.train().unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::NoSamples));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_clear_all_password() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), Some("letmein"));
        engine.register_student("S1", "Alice").unwrap();
        engine.session().add("S1");

        assert!(matches!(engine.clear_all("guess"), Err(EngineError::Forbidden)));
        assert_eq!(engine.dashboard().total_students, 1);

        engine.clear_all("letmein").unwrap();
        assert_eq!(engine.dashboard().total_students, 0);
        assert!(engine.session().is_empty());

        let disabled = self::engine(tempfile::tempdir().unwrap().path(), None);
        assert!(matches!(disabled.clear_all(""), Err(EngineError::ClearDisabled)));
    }
}
