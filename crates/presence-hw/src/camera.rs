//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{SourceError, VideoSource};
use image::RgbImage;
use serde::Serialize;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const MAX_DEVICE_INDEX: u32 = 16;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(PixelFormat::Mjpg)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }
}

/// State held while the device is streaming.
struct Streaming {
    // Field order matters: the stream must drop before the device.
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// V4L2 camera; opened lazily through [`VideoSource::open`].
pub struct Camera {
    device_path: String,
    requested: (u32, u32),
    streaming: Option<Streaming>,
}

impl Camera {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            requested: (DEFAULT_WIDTH, DEFAULT_HEIGHT),
            streaming: None,
        }
    }

    /// Ask the driver for a specific resolution; it may pick the closest match.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.requested = (width, height);
        self
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Negotiated (width, height), once open.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.streaming.as_ref().map(|s| (s.width, s.height))
    }

    fn start(&self) -> Result<Streaming, SourceError> {
        let path = self.device_path.as_str();
        if !Path::new(path).exists() {
            return Err(SourceError::Unavailable(format!("device not found: {path}")));
        }

        let device = Device::with_path(path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                SourceError::Unavailable(format!("{path}: device busy"))
            } else {
                SourceError::Unavailable(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| SourceError::Unavailable(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::Unavailable(format!("{path}: not a capture device")));
        }

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::Unavailable(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.requested.0;
        fmt.height = self.requested.1;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::Unavailable(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            SourceError::Unavailable(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| SourceError::Unavailable(format!("failed to create mmap stream: {e}")))?;

        Ok(Streaming {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..MAX_DEVICE_INDEX {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn to_rgb(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<RgbImage, frame::FrameError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Mjpg => frame::decode_mjpeg(buf),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
        PixelFormat::Y16 => frame::y16_to_rgb(buf, width, height),
    }
}

impl VideoSource for Camera {
    fn open(&mut self) -> Result<(), SourceError> {
        if self.streaming.is_some() {
            return Ok(());
        }
        self.streaming = Some(self.start()?);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let s = self.streaming.as_mut().ok_or(SourceError::NotOpen)?;

        let (buf, meta) = s
            .stream
            .next()
            .map_err(|e| SourceError::ReadFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let image = to_rgb(buf, s.pixel_format, s.width, s.height)
            .map_err(|e| SourceError::ReadFailed(format!("{:?} conversion failed: {e}", s.pixel_format)))?;

        Ok(Frame::new(image, sequence))
    }

    fn close(&mut self) {
        if self.streaming.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}
