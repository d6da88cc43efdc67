use presence_core::{EncodingMode, FeatureVector};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Professor {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub subject: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub photo_path: Option<String>,
    /// Mode of the stored vector; `None` when the student has no vector.
    pub encoding_mode: Option<EncodingMode>,
    pub created_at: String,
}

impl Student {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Insert payload for a student.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub first_name: String,
    pub last_name: String,
    pub photo_path: Option<String>,
    pub vector: FeatureVector,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: i64,
    pub professor_id: i64,
    pub subject: String,
    pub date: String,
    pub start_time: String,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub session_id: i64,
    pub student_id: i64,
    pub check_in_time: String,
    pub status: String,
}

/// One line of a session report; every current student appears once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub student_id: i64,
    pub name: String,
    pub check_in_time: Option<String>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub total: u32,
    pub present: u32,
    pub absent: u32,
    pub percentage: f64,
}
