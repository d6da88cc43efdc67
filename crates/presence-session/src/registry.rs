//! Known-set maintenance over the identity store.

use crate::enrollment::decode_image;
use presence_core::{FeatureExtractor, KnownSet, KnownSetCell};
use presence_store::{IdentityStore, SqliteStore, StoreError};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Rebuild the shared snapshot from the store. Call after any student change.
pub fn reload_known_set(
    store: &dyn IdentityStore,
    cell: &KnownSetCell,
) -> Result<Arc<KnownSet>, StoreError> {
    let identities = store.list_identities()?;
    Ok(cell.reload(identities))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReencodeReport {
    pub updated: usize,
    pub failed: usize,
    pub missing_photo: usize,
}

/// Re-encode every student from their stored photo with the extractor's
/// current mode. Students whose photo cannot be used keep their old vector.
pub fn reencode_students(
    extractor: &FeatureExtractor,
    store: &SqliteStore,
) -> Result<ReencodeReport, StoreError> {
    let mut report = ReencodeReport::default();

    for student in store.list_students()? {
        let name = student.display_name();
        let Some(photo_path) = student.photo_path.as_deref() else {
            tracing::warn!(student_id = student.id, %name, "no photo recorded");
            report.missing_photo += 1;
            continue;
        };

        let bytes = match std::fs::read(Path::new(photo_path)) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(student_id = student.id, %name, path = %photo_path, error = %e, "photo unreadable");
                report.failed += 1;
                continue;
            }
        };

        let frame = match decode_image(&bytes) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(student_id = student.id, %name, error = %e, "photo does not decode");
                report.failed += 1;
                continue;
            }
        };

        let regions = extractor.detect_faces(&frame);
        let Some(region) = regions.first() else {
            tracing::warn!(student_id = student.id, %name, "no face in stored photo");
            report.failed += 1;
            continue;
        };
        if regions.len() > 1 {
            tracing::warn!(student_id = student.id, %name, count = regions.len(), "several faces in stored photo; using the first");
        }

        match extractor.encode_region(&frame, region) {
            Ok(vector) => {
                store.update_student_encoding(student.id, &vector)?;
                report.updated += 1;
            }
            Err(e) => {
                tracing::warn!(student_id = student.id, %name, error = %e, "re-encode failed");
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        mode = %extractor.mode(),
        updated = report.updated,
        failed = report.failed,
        missing_photo = report.missing_photo,
        "students re-encoded"
    );
    Ok(report)
}
