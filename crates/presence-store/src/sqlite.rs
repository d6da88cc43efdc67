use crate::codec::{decode_vector, encode_vector};
use crate::records::{
    AttendanceRecord, AttendanceStatus, NewStudent, Professor, ReportRow, Session, SessionStats,
    Student,
};
use crate::store::{AttendanceStore, IdentityStore, SessionStore, StoreError};
use chrono::Local;
use parking_lot::Mutex;
use presence_core::{EncodingMode, FeatureVector, KnownIdentity};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        tracing::debug!(path = %db_path.display(), "opened attendance database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        // In-memory databases answer "memory" instead of switching to WAL.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS professors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              first_name TEXT NOT NULL,
              last_name TEXT NOT NULL,
              subject TEXT NOT NULL,
              created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS students (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              first_name TEXT NOT NULL,
              last_name TEXT NOT NULL,
              photo_path TEXT,
              encoding BLOB,
              encoding_mode TEXT,
              created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS sessions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              professor_id INTEGER,
              subject TEXT,
              session_date DATE,
              start_time TIME,
              end_time TIME,
              FOREIGN KEY (professor_id) REFERENCES professors(id)
            );

            CREATE TABLE IF NOT EXISTS attendance (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id INTEGER,
              student_id INTEGER,
              check_in_time TIMESTAMP,
              status TEXT DEFAULT 'present',
              FOREIGN KEY (session_id) REFERENCES sessions(id),
              FOREIGN KEY (student_id) REFERENCES students(id),
              UNIQUE(session_id, student_id)
            );
            "#,
        )?;

        // Databases created before vectors were tagged lack the mode column.
        let has_mode = conn
            .prepare("SELECT 1 FROM pragma_table_info('students') WHERE name = 'encoding_mode'")?
            .exists([])?;
        if !has_mode {
            conn.execute("ALTER TABLE students ADD COLUMN encoding_mode TEXT", [])?;
            tracing::info!("added encoding_mode column to students");
        }

        Ok(())
    }

    // --- Professors ---

    pub fn add_professor(
        &self,
        first_name: &str,
        last_name: &str,
        subject: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO professors (first_name, last_name, subject) VALUES (?1, ?2, ?3)",
            params![first_name, last_name, subject],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_professors(&self) -> Result<Vec<Professor>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, subject, created_at
             FROM professors ORDER BY last_name, first_name, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Professor {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                subject: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn professor(&self, id: i64) -> Result<Option<Professor>, StoreError> {
        let conn = self.conn.lock();
        let professor = conn
            .query_row(
                "SELECT id, first_name, last_name, subject, created_at FROM professors WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Professor {
                        id: row.get(0)?,
                        first_name: row.get(1)?,
                        last_name: row.get(2)?,
                        subject: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(professor)
    }

    /// Returns `false` if no such professor exists.
    pub fn delete_professor(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM professors WHERE id = ?1", params![id])? == 1)
    }

    // --- Students ---

    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, photo_path, encoding_mode, created_at
             FROM students ORDER BY last_name, first_name, id",
        )?;
        let rows = stmt.query_map([], student_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn student(&self, id: i64) -> Result<Option<Student>, StoreError> {
        let conn = self.conn.lock();
        let student = conn
            .query_row(
                "SELECT id, first_name, last_name, photo_path, encoding_mode, created_at
                 FROM students WHERE id = ?1",
                params![id],
                student_from_row,
            )
            .optional()?;
        Ok(student)
    }

    pub fn update_student_encoding(
        &self,
        id: i64,
        vector: &FeatureVector,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE students SET encoding = ?1, encoding_mode = ?2 WHERE id = ?3",
            params![encode_vector(&vector.values), vector.mode.as_str(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { kind: "student", id });
        }
        Ok(())
    }

    /// Delete a student and their stored photo. Returns `false` if no such student.
    pub fn delete_student(&self, id: i64) -> Result<bool, StoreError> {
        let photo_path: Option<Option<String>> = {
            let conn = self.conn.lock();
            let photo = conn
                .query_row(
                    "SELECT photo_path FROM students WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if photo.is_some() {
                conn.execute("DELETE FROM students WHERE id = ?1", params![id])?;
            }
            photo
        };

        let Some(photo_path) = photo_path else {
            return Ok(false);
        };

        if let Some(path) = photo_path {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path, "removed student photo"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path, error = %e, "failed to remove student photo"),
            }
        }
        Ok(true)
    }

    // --- Sessions / attendance ---

    pub fn session(&self, id: i64) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT id, professor_id, subject, session_date, start_time, end_time
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        professor_id: row.get(1)?,
                        subject: row.get(2)?,
                        date: row.get(3)?,
                        start_time: row.get(4)?,
                        end_time: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    fn require_session(&self, id: i64) -> Result<(), StoreError> {
        match self.session(id)? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound { kind: "session", id }),
        }
    }

    pub fn session_attendance(&self, session_id: i64) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, student_id, check_in_time, status
             FROM attendance WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(AttendanceRecord {
                session_id: row.get(0)?,
                student_id: row.get(1)?,
                check_in_time: row.get(2)?,
                status: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every current student with their check-in for `session_id`, ordered by name.
    pub fn session_report(&self, session_id: i64) -> Result<Vec<ReportRow>, StoreError> {
        self.require_session(session_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.first_name, s.last_name, a.check_in_time
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.session_id = ?1
             ORDER BY s.last_name, s.first_name, s.id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let first: String = row.get(1)?;
            let last: String = row.get(2)?;
            let check_in: Option<String> = row.get(3)?;
            Ok(ReportRow {
                student_id: row.get(0)?,
                name: format!("{first} {last}"),
                status: if check_in.is_some() {
                    AttendanceStatus::Present
                } else {
                    AttendanceStatus::Absent
                },
                check_in_time: check_in,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn session_stats(&self, session_id: i64) -> Result<SessionStats, StoreError> {
        self.require_session(session_id)?;
        let conn = self.conn.lock();
        let total: u32 = conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        let present: u32 = conn.query_row(
            "SELECT COUNT(*) FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let percentage = if total > 0 {
            present as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(SessionStats {
            total,
            present,
            absent: total - present,
            percentage,
        })
    }
}

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    let mode: Option<String> = row.get(4)?;
    Ok(Student {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        photo_path: row.get(3)?,
        encoding_mode: mode.and_then(|m| m.parse().ok()),
        created_at: row.get(5)?,
    })
}

impl IdentityStore for SqliteStore {
    fn list_identities(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, encoding, encoding_mode
             FROM students WHERE encoding IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, first, last, blob, mode) = row?;
            match decode_identity(id, &blob, mode.as_deref()) {
                Ok(vector) => identities.push(KnownIdentity {
                    id,
                    display_name: format!("{first} {last}"),
                    vector,
                }),
                Err(e) => tracing::warn!(error = %e, "skipping student vector"),
            }
        }
        Ok(identities)
    }

    fn add_student(&self, student: &NewStudent) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO students (first_name, last_name, photo_path, encoding, encoding_mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                student.first_name,
                student.last_name,
                student.photo_path,
                encode_vector(&student.vector.values),
                student.vector.mode.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn decode_identity(
    student_id: i64,
    blob: &[u8],
    mode: Option<&str>,
) -> Result<FeatureVector, StoreError> {
    let mode: EncodingMode = mode
        .ok_or_else(|| StoreError::CorruptVector {
            student_id,
            reason: "no encoding mode recorded; re-encode the student".into(),
        })?
        .parse()
        .map_err(|reason| StoreError::CorruptVector { student_id, reason })?;
    let values =
        decode_vector(blob).map_err(|reason| StoreError::CorruptVector { student_id, reason })?;
    Ok(FeatureVector::new(values, mode))
}

impl AttendanceStore for SqliteStore {
    fn mark_attendance(&self, session_id: i64, student_id: i64) -> Result<bool, StoreError> {
        let check_in = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO attendance (session_id, student_id, check_in_time, status)
             VALUES (?1, ?2, ?3, 'present')",
            params![session_id, student_id, check_in],
        )?;
        Ok(inserted == 1)
    }
}

impl SessionStore for SqliteStore {
    fn create_session(&self, professor_id: i64, subject: &str) -> Result<i64, StoreError> {
        let now = Local::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (professor_id, subject, session_date, start_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                professor_id,
                subject,
                now.format(DATE_FORMAT).to_string(),
                now.format(TIME_FORMAT).to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(session_id = id, professor_id, subject, "session created");
        Ok(id)
    }

    fn end_session(&self, session_id: i64) -> Result<(), StoreError> {
        let end_time = Local::now().format(TIME_FORMAT).to_string();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sessions SET end_time = ?1 WHERE id = ?2",
            params![end_time, session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { kind: "session", id: session_id });
        }
        tracing::info!(session_id, end_time = %end_time, "session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn new_student(first: &str, last: &str, values: Vec<f32>) -> NewStudent {
        NewStudent {
            first_name: first.into(),
            last_name: last.into(),
            photo_path: None,
            vector: FeatureVector::new(values, EncodingMode::Histogram),
        }
    }

    #[test]
    fn test_mark_attendance_is_idempotent() {
        let store = store();
        let prof = store.add_professor("Alan", "Turing", "Computability").unwrap();
        let student = store.add_student(&new_student("Ada", "Lovelace", vec![0.5])).unwrap();
        let session = store.create_session(prof, "Computability").unwrap();

        assert!(store.mark_attendance(session, student).unwrap());
        assert!(!store.mark_attendance(session, student).unwrap());

        let records = store.session_attendance(session).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].student_id, student);
        assert_eq!(records[0].status, "present");
    }

    #[test]
    fn test_list_identities_roundtrips_vectors() {
        let store = store();
        let a = store.add_student(&new_student("Ada", "Lovelace", vec![0.1, 0.2])).unwrap();
        let b = store.add_student(&new_student("Grace", "Hopper", vec![0.3, 0.4])).unwrap();

        let identities = store.list_identities().unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].id, a);
        assert_eq!(identities[0].display_name, "Ada Lovelace");
        assert_eq!(identities[0].vector.values, vec![0.1, 0.2]);
        assert_eq!(identities[1].id, b);
        assert_eq!(identities[1].vector.mode, EncodingMode::Histogram);
    }

    #[test]
    fn test_list_identities_skips_corrupt_rows() {
        let store = store();
        store.add_student(&new_student("Ada", "Lovelace", vec![0.1])).unwrap();
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO students (first_name, last_name, encoding, encoding_mode)
                 VALUES ('Bad', 'Blob', x'010203', 'histogram')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO students (first_name, last_name, encoding) VALUES ('Old', 'Row', x'0000803f')",
                [],
            )
            .unwrap();
        }
        let identities = store.list_identities().unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].display_name, "Ada Lovelace");
    }

    #[test]
    fn test_update_student_encoding() {
        let store = store();
        let id = store.add_student(&new_student("Ada", "Lovelace", vec![0.1])).unwrap();
        let vector = FeatureVector::new(vec![0.9, 0.8], EncodingMode::Embedding);
        store.update_student_encoding(id, &vector).unwrap();

        let identities = store.list_identities().unwrap();
        assert_eq!(identities[0].vector, vector);
        assert_eq!(store.student(id).unwrap().unwrap().encoding_mode, Some(EncodingMode::Embedding));

        assert!(matches!(
            store.update_student_encoding(999, &vector),
            Err(StoreError::NotFound { kind: "student", id: 999 })
        ));
    }

    #[test]
    fn test_delete_student_removes_photo() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("ada.png");
        std::fs::write(&photo, b"png").unwrap();

        let store = store();
        let mut student = new_student("Ada", "Lovelace", vec![0.1]);
        student.photo_path = Some(photo.to_string_lossy().into_owned());
        let id = store.add_student(&student).unwrap();

        assert!(store.delete_student(id).unwrap());
        assert!(!photo.exists());
        assert!(store.student(id).unwrap().is_none());
        assert!(!store.delete_student(id).unwrap());
    }

    #[test]
    fn test_session_lifecycle() {
        let store = store();
        let prof = store.add_professor("Alan", "Turing", "Logic").unwrap();
        let id = store.create_session(prof, "Logic").unwrap();

        let session = store.session(id).unwrap().unwrap();
        assert_eq!(session.professor_id, prof);
        assert_eq!(session.subject, "Logic");
        assert!(session.end_time.is_none());

        store.end_session(id).unwrap();
        assert!(store.session(id).unwrap().unwrap().end_time.is_some());
        assert!(matches!(store.end_session(id + 1), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_session_report_ordered_by_name() {
        let store = store();
        let prof = store.add_professor("Alan", "Turing", "Logic").unwrap();
        let hopper = store.add_student(&new_student("Grace", "Hopper", vec![0.1])).unwrap();
        let _lovelace = store.add_student(&new_student("Ada", "Lovelace", vec![0.2])).unwrap();
        let babbage = store.add_student(&new_student("Charles", "Babbage", vec![0.3])).unwrap();
        let session = store.create_session(prof, "Logic").unwrap();
        store.mark_attendance(session, hopper).unwrap();

        let report = store.session_report(session).unwrap();
        let names: Vec<&str> = report.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["Charles Babbage", "Grace Hopper", "Ada Lovelace"]);
        assert_eq!(report[0].student_id, babbage);
        assert_eq!(report[0].status, AttendanceStatus::Absent);
        assert!(report[0].check_in_time.is_none());
        assert_eq!(report[1].status, AttendanceStatus::Present);
        assert!(report[1].check_in_time.is_some());

        assert!(matches!(store.session_report(999), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_session_stats() {
        let store = store();
        let prof = store.add_professor("Alan", "Turing", "Logic").unwrap();
        let a = store.add_student(&new_student("Ada", "Lovelace", vec![0.1])).unwrap();
        store.add_student(&new_student("Grace", "Hopper", vec![0.2])).unwrap();
        store.add_student(&new_student("Charles", "Babbage", vec![0.3])).unwrap();
        store.add_student(&new_student("Kurt", "Godel", vec![0.4])).unwrap();
        let session = store.create_session(prof, "Logic").unwrap();
        store.mark_attendance(session, a).unwrap();

        let stats = store.session_stats(session).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.present, 1);
        assert_eq!(stats.absent, 3);
        assert!((stats.percentage - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_professors_crud() {
        let store = store();
        let b = store.add_professor("Barbara", "Liskov", "Types").unwrap();
        let a = store.add_professor("Edsger", "Dijkstra", "Algorithms").unwrap();

        let list = store.list_professors().unwrap();
        assert_eq!(list.iter().map(|p| p.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(store.professor(b).unwrap().unwrap().subject, "Types");

        assert!(store.delete_professor(a).unwrap());
        assert!(!store.delete_professor(a).unwrap());
        assert_eq!(store.list_professors().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.add_student(&new_student("Ada", "Lovelace", vec![0.1])).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_students().unwrap().len(), 1);
    }
}
