//! Preview outputs for annotated frames. Rendering is best-effort: callers
//! log failures and carry on.

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("preview io: {0}")]
    Io(#[from] std::io::Error),
    #[error("preview encode: {0}")]
    Encode(#[from] image::ImageError),
    #[error("preview writer stopped")]
    WriterGone,
}

pub trait PreviewSink: Send {
    /// Asked once per frame before anything is drawn; `false` means the
    /// caller skips annotating and rendering this frame.
    fn wants_frame(&mut self) -> bool {
        true
    }

    fn render_frame(&mut self, frame: RgbImage) -> Result<(), PreviewError>;
}

/// Discards every frame.
pub struct NullPreview;

impl PreviewSink for NullPreview {
    fn wants_frame(&mut self) -> bool {
        false
    }

    fn render_frame(&mut self, _frame: RgbImage) -> Result<(), PreviewError> {
        Ok(())
    }
}

/// Writes every Nth frame to a JPEG file on a background thread, replacing
/// it atomically so viewers never see a half-written image. A frame offered
/// while the previous one is still being written is skipped.
pub struct SnapshotPreview {
    path: PathBuf,
    every: u64,
    seen: u64,
    frames: Option<SyncSender<RgbImage>>,
    writer: Option<JoinHandle<()>>,
}

impl SnapshotPreview {
    pub fn new(path: impl Into<PathBuf>, every: u64) -> Result<Self, PreviewError> {
        let path = path.into();
        let (tx, rx) = mpsc::sync_channel::<RgbImage>(1);
        let target = path.clone();
        let writer = std::thread::Builder::new()
            .name("presence-preview".into())
            .spawn(move || {
                for frame in rx {
                    if let Err(e) = write_snapshot(&target, &frame) {
                        tracing::warn!(path = %target.display(), error = %e, "preview write failed");
                    }
                }
            })?;

        Ok(Self {
            path,
            every: every.max(1),
            seen: 0,
            frames: Some(tx),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_snapshot(path: &Path, frame: &RgbImage) -> Result<(), PreviewError> {
    let tmp = path.with_extension("tmp.jpg");
    frame.save_with_format(&tmp, image::ImageFormat::Jpeg)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl PreviewSink for SnapshotPreview {
    fn wants_frame(&mut self) -> bool {
        let due = self.seen % self.every == 0;
        self.seen += 1;
        due
    }

    fn render_frame(&mut self, frame: RgbImage) -> Result<(), PreviewError> {
        let Some(frames) = &self.frames else {
            return Err(PreviewError::WriterGone);
        };
        match frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::trace!("preview writer busy; frame skipped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(PreviewError::WriterGone),
        }
    }
}

impl Drop for SnapshotPreview {
    // Lets the pending write finish.
    fn drop(&mut self) {
        self.frames.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_snapshot_wants_every_nth() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SnapshotPreview::new(dir.path().join("preview.jpg"), 3).unwrap();
        let wanted: Vec<bool> = (0..7).map(|_| sink.wants_frame()).collect();
        assert_eq!(wanted, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_snapshot_writes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let mut sink = SnapshotPreview::new(&path, 1).unwrap();

        assert!(sink.wants_frame());
        sink.render_frame(RgbImage::from_pixel(8, 8, Rgb([0, 255, 0]))).unwrap();
        // Dropping waits for the queued write.
        drop(sink);

        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 8);
        assert!(!path.with_extension("tmp.jpg").exists());
    }

    #[test]
    fn test_snapshot_never_blocks_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SnapshotPreview::new(dir.path().join("preview.jpg"), 1).unwrap();
        let frame = RgbImage::new(640, 480);
        // More frames than the queue holds: extras are skipped, not waited on.
        for _ in 0..20 {
            assert!(sink.render_frame(frame.clone()).is_ok());
        }
    }

    #[test]
    fn test_snapshot_unwritable_dir_is_not_fatal() {
        let mut sink = SnapshotPreview::new("/nonexistent-dir/preview.jpg", 1).unwrap();
        assert!(sink.render_frame(RgbImage::new(4, 4)).is_ok());
        drop(sink);
        assert!(!Path::new("/nonexistent-dir/preview.jpg").exists());
    }

    #[test]
    fn test_write_snapshot_unwritable_dir_errors() {
        let frame = RgbImage::new(4, 4);
        assert!(write_snapshot(Path::new("/nonexistent-dir/preview.jpg"), &frame).is_err());
    }

    #[test]
    fn test_null_preview() {
        assert!(!NullPreview.wants_frame());
        assert!(NullPreview.render_frame(RgbImage::new(1, 1)).is_ok());
    }
}
