//! presence-session — Attendance sessions on top of the feature extractor.
//!
//! The [`SessionController`](controller::SessionController) runs a capture
//! loop on its own thread and hands matches to a single attendance consumer
//! over a channel. Enrollment and known-set maintenance live alongside it.

pub mod controller;
pub mod enrollment;
pub mod overlay;
pub mod registry;

pub use controller::{
    ControllerError, ControllerOptions, ControllerState, ControllerStatus, MatchEvent,
    SessionController, SessionSummary,
};
pub use enrollment::{check_photo, enroll_student, EnrolledStudent, EnrollmentError, PhotoCheck};
pub use registry::{reencode_students, reload_known_set, ReencodeReport};
