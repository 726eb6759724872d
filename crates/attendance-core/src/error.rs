//! Boundary-facing failure taxonomy.
//!
//! Every module keeps its own error enum; the ones a user can act on classify
//! themselves into a [`FailureKind`], which the daemon and CLI map to HTTP
//! statuses and exit codes.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// The video source could not be opened.
    CameraUnavailable,
    /// Live recognition was requested before any model was trained.
    ModelNotTrained,
    /// Registration of an id that is already in the registry.
    DuplicateIdentifier,
    /// Informational: the id already has a row in today's ledger.
    AlreadyMarkedToday,
    /// Training found no sample images.
    NoSamples,
    /// Training found samples but none were usable.
    NoValidSamples,
    /// A registry or ledger file could not be parsed.
    StorageUnreadable,
}

impl FailureKind {
    /// HTTP status used by the daemon.
    pub fn http_status(self) -> u16 {
        match self {
            FailureKind::CameraUnavailable => 503,
            FailureKind::ModelNotTrained => 409,
            FailureKind::DuplicateIdentifier => 400,
            FailureKind::AlreadyMarkedToday => 200,
            FailureKind::NoSamples | FailureKind::NoValidSamples => 500,
            FailureKind::StorageUnreadable => 500,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::AlreadyMarkedToday => 0,
            FailureKind::CameraUnavailable => 10,
            FailureKind::ModelNotTrained => 11,
            FailureKind::DuplicateIdentifier => 12,
            FailureKind::NoSamples => 13,
            FailureKind::NoValidSamples => 14,
            FailureKind::StorageUnreadable => 15,
        }
    }
}
