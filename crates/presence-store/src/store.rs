//! Boundaries the session controller and enrollment talk to.

use crate::records::NewStudent;
use presence_core::KnownIdentity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("corrupt vector for student {student_id}: {reason}")]
    CorruptVector { student_id: i64, reason: String },
}

/// Source of registered identities for known-set reloads.
pub trait IdentityStore: Send + Sync {
    /// Every student with a stored, decodable vector, in insertion order.
    fn list_identities(&self) -> Result<Vec<KnownIdentity>, StoreError>;

    fn add_student(&self, student: &NewStudent) -> Result<i64, StoreError>;
}

pub trait AttendanceStore: Send + Sync {
    /// Record a check-in. Returns `false` when the pair was already recorded.
    fn mark_attendance(&self, session_id: i64, student_id: i64) -> Result<bool, StoreError>;
}

pub trait SessionStore: Send + Sync {
    fn create_session(&self, professor_id: i64, subject: &str) -> Result<i64, StoreError>;

    /// Stamp the session's end time.
    fn end_session(&self, session_id: i64) -> Result<(), StoreError>;
}
