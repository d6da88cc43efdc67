//! presence-store — Persistence boundaries and their SQLite implementation.

pub mod codec;
pub mod records;
pub mod sqlite;
pub mod store;

pub use records::{
    AttendanceRecord, AttendanceStatus, NewStudent, Professor, ReportRow, Session, SessionStats,
    Student,
};
pub use sqlite::SqliteStore;
pub use store::{AttendanceStore, IdentityStore, SessionStore, StoreError};
