//! CSV-backed roster store: the student registry and the daily attendance ledgers.
//!
//! Layout under the data directory:
//!
//! ```text
//! students.csv                       Id,Name
//! attendance/Attendance_<date>.csv   Id,Name,Date,Time
//! training_images/                   see [`crate::samples`]
//! models/trainer.json                see [`crate::recognizer`]
//! ```
//!
//! Unreadable registry or ledger files are logged and treated as empty so the
//! rest of the system stays available.

use crate::error::FailureKind;
use crate::types::{AttendanceRecord, StudentRecord};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const STUDENT_FILE: &str = "students.csv";
const ATTENDANCE_DIR: &str = "attendance";
const TRAINING_DIR: &str = "training_images";
const MODELS_DIR: &str = "models";
const MODEL_FILE: &str = "trainer.json";
const LEDGER_PREFIX: &str = "Attendance_";

/// Display name for ids missing from the registry.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student id {0} already exists")]
    DuplicateIdentifier(String),
    #[error("student id and name must both be non-empty")]
    MissingField,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

impl StoreError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            StoreError::DuplicateIdentifier(_) => Some(FailureKind::DuplicateIdentifier),
            _ => None,
        }
    }
}

/// Paths of every persisted artifact under one data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn student_file(&self) -> PathBuf {
        self.root.join(STUDENT_FILE)
    }

    pub fn attendance_dir(&self) -> PathBuf {
        self.root.join(ATTENDANCE_DIR)
    }

    pub fn training_dir(&self) -> PathBuf {
        self.root.join(TRAINING_DIR)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }

    pub fn model_file(&self) -> PathBuf {
        self.models_dir().join(MODEL_FILE)
    }

    pub fn ledger_file(&self, date: NaiveDate) -> PathBuf {
        self.attendance_dir()
            .join(format!("{LEDGER_PREFIX}{}.csv", date.format("%Y-%m-%d")))
    }
}

/// Outcome of marking attendance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked(AttendanceRecord),
    /// The id already has a row in the day's ledger; nothing was written.
    AlreadyMarkedToday,
}

/// Student registry plus per-day attendance ledgers.
#[derive(Debug, Clone)]
pub struct RosterStore {
    layout: DataLayout,
}

impl RosterStore {
    /// Open the store, creating directories and a header-only registry as needed.
    pub fn open(layout: DataLayout) -> Result<Self, StoreError> {
        for dir in [
            layout.root().to_path_buf(),
            layout.attendance_dir(),
            layout.training_dir(),
            layout.models_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        let store = Self { layout };
        if !store.layout.student_file().exists() {
            store.write_empty_registry()?;
        }
        Ok(store)
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Register a student. Ids are unique regardless of name.
    pub fn add_student(&self, id: &str, name: &str) -> Result<StudentRecord, StoreError> {
        let id = id.trim();
        let name = name.trim();
        if id.is_empty() || name.is_empty() {
            return Err(StoreError::MissingField);
        }
        if self.students().iter().any(|s| s.id == id) {
            return Err(StoreError::DuplicateIdentifier(id.to_string()));
        }

        let record = StudentRecord { id: id.to_string(), name: name.to_string() };
        let path = self.layout.student_file();
        let needs_header = file_is_empty(&path);
        append_row(&path, needs_header, &record)?;

        tracing::info!(id, name, "student registered");
        Ok(record)
    }

    /// All registered students in registry order.
    pub fn students(&self) -> Vec<StudentRecord> {
        read_rows(&self.layout.student_file())
    }

    /// Display name for `id`, or [`UNKNOWN_NAME`].
    pub fn student_name(&self, id: &str) -> String {
        self.students()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.name)
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    /// Mark attendance for now, local time.
    pub fn mark_attendance(&self, id: &str, name: &str) -> Result<MarkOutcome, StoreError> {
        self.mark_attendance_at(id, name, Local::now().naive_local())
    }

    /// Mark attendance at `at`. At most one row per id per calendar date.
    pub fn mark_attendance_at(
        &self,
        id: &str,
        name: &str,
        at: NaiveDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        let date = at.date();
        let path = self.layout.ledger_file(date);

        // Re-read right before appending; the duplicate check and the append
        // are not atomic across processes.
        let existing: Vec<AttendanceRecord> = read_rows(&path);
        if existing.iter().any(|r| r.id == id) {
            tracing::debug!(id, %date, "attendance already marked");
            return Ok(MarkOutcome::AlreadyMarkedToday);
        }

        let time = at.time().with_nanosecond(0).unwrap_or(at.time());
        let record = AttendanceRecord {
            id: id.to_string(),
            name: name.to_string(),
            date,
            time,
        };
        let needs_header = file_is_empty(&path);
        append_row(&path, needs_header, &record)?;

        tracing::info!(id, name, %date, %time, "attendance marked");
        Ok(MarkOutcome::Marked(record))
    }

    /// Ledger rows for today, local time.
    pub fn today_records(&self) -> Vec<AttendanceRecord> {
        self.records_on(Local::now().date_naive())
    }

    /// Ledger rows for `date`; empty if no ledger exists.
    pub fn records_on(&self, date: NaiveDate) -> Vec<AttendanceRecord> {
        read_rows(&self.layout.ledger_file(date))
    }

    /// Wipe the registry to its header, every training sample, the trained
    /// model and every ledger.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.write_empty_registry()?;
        remove_dir_contents(&self.layout.training_dir())?;

        let model = self.layout.model_file();
        if model.exists() {
            fs::remove_file(&model)?;
        }

        remove_dir_contents(&self.layout.attendance_dir())?;

        tracing::warn!(root = %self.layout.root().display(), "all student data cleared");
        Ok(())
    }

    fn write_empty_registry(&self) -> Result<(), StoreError> {
        let mut writer = csv::Writer::from_path(self.layout.student_file())?;
        writer.write_record(["Id", "Name"])?;
        writer.flush()?;
        Ok(())
    }
}

fn file_is_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

fn append_row<T: serde::Serialize>(path: &Path, with_header: bool, row: &T) -> Result<(), StoreError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(with_header)
        .from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}

/// Deserialize every row of a CSV file with headers.
///
/// A missing file yields no rows; an unreadable or malformed one is reported
/// and also yields no rows.
fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    if !path.exists() {
        return Vec::new();
    }
    let parsed = csv::Reader::from_path(path).and_then(|mut reader| {
        reader
            .deserialize()
            .collect::<Result<Vec<T>, csv::Error>>()
    });
    match parsed {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                kind = ?FailureKind::StorageUnreadable,
                "unreadable CSV treated as empty"
            );
            Vec::new()
        }
    }
}

fn remove_dir_contents(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
