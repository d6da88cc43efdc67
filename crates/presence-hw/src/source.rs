//! Video source abstraction and an image-directory replay source.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    Unavailable(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("video source is not open")]
    NotOpen,
}

/// A blocking frame producer.
///
/// `read_frame` blocks until a frame is available, the source ends, or the
/// device reports an error.
pub trait VideoSource: Send {
    fn open(&mut self) -> Result<(), SourceError>;
    fn read_frame(&mut self) -> Result<Frame, SourceError>;
    /// Release the device. Safe to call more than once.
    fn close(&mut self);
    /// Human-readable identifier for logs.
    fn describe(&self) -> String;
}

/// Replays the images of a directory in file-name order.
pub struct ImageSequenceSource {
    dir: PathBuf,
    looping: bool,
    frame_interval: Option<Duration>,
    paths: Vec<PathBuf>,
    cursor: usize,
    sequence: u32,
    opened: bool,
}

impl ImageSequenceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            looping: false,
            frame_interval: None,
            paths: Vec::new(),
            cursor: 0,
            sequence: 0,
            opened: false,
        }
    }

    /// Restart from the first image instead of ending.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Sleep between frames to mimic a camera's frame rate.
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl VideoSource for ImageSequenceSource {
    fn open(&mut self) -> Result<(), SourceError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", self.dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && Self::is_image(p))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "{}: no images found",
                self.dir.display()
            )));
        }

        tracing::info!(dir = %self.dir.display(), frames = paths.len(), looping = self.looping, "image sequence opened");
        self.paths = paths;
        self.cursor = 0;
        self.sequence = 0;
        self.opened = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.opened {
            return Err(SourceError::NotOpen);
        }
        if self.cursor >= self.paths.len() {
            if !self.looping {
                return Err(SourceError::EndOfStream);
            }
            self.cursor = 0;
        }

        if let Some(interval) = self.frame_interval {
            std::thread::sleep(interval);
        }

        let path = &self.paths[self.cursor];
        let image = image::open(path)
            .map_err(|e| SourceError::ReadFailed(format!("{}: {e}", path.display())))?
            .to_rgb8();

        self.cursor += 1;
        let frame = Frame::new(image, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    fn close(&mut self) {
        if self.opened {
            tracing::debug!(dir = %self.dir.display(), "image sequence closed");
        }
        self.opened = false;
        self.paths.clear();
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}
