//! Camera sources: the open/read contract and its V4L2 implementation.
//!
//! A source is chosen from an ordered list of [`SourceConfig`] candidates;
//! the first one that opens wins. Releasing a source is dropping it.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no camera source could be opened (tried {tried:?})")]
    Unavailable { tried: Vec<String> },
}

/// One candidate camera configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Device path, e.g. `/dev/video0`.
    pub device: String,
    pub width: u32,
    pub height: u32,
}

/// An open camera.
pub trait CameraSource: Send {
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Opens camera sources from configuration.
pub trait CameraOpener: Send {
    fn open(&mut self, config: &SourceConfig) -> Result<Box<dyn CameraSource>, CameraError>;
}

/// Try each candidate in order and return the first source that opens.
pub fn open_first(
    opener: &mut dyn CameraOpener,
    candidates: &[SourceConfig],
) -> Result<(Box<dyn CameraSource>, SourceConfig), CameraError> {
    for candidate in candidates {
        match opener.open(candidate) {
            Ok(source) => {
                tracing::info!(
                    device = %candidate.device,
                    source = %source.describe(),
                    "camera opened"
                );
                return Ok((source, candidate.clone()));
            }
            Err(e) => {
                tracing::warn!(device = %candidate.device, error = %e, "camera candidate failed");
            }
        }
    }

    Err(CameraError::Unavailable {
        tried: candidates.iter().map(|c| c.device.clone()).collect(),
    })
}

/// Pixel formats we know how to turn into RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// Opens V4L2 devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lOpener;

impl CameraOpener for V4lOpener {
    fn open(&mut self, config: &SourceConfig) -> Result<Box<dyn CameraSource>, CameraError> {
        Ok(Box::new(V4lCamera::open(config)?))
    }
}

/// V4L2 camera streaming through memory-mapped buffers.
pub struct V4lCamera {
    // Declared before `device` so the stream is torn down first.
    stream: MmapStream<'static>,
    _device: Device,
    device_path: String,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lCamera {
    pub fn open(config: &SourceConfig) -> Result<Self, CameraError> {
        let path = config.device.as_str();
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceNotFound(path.to_string()));
        }

        let device = Device::with_path(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ResourceBusy {
                CameraError::DeviceBusy(path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureFailed(format!("{path} is not a capture device")));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = config.width;
        fmt.height = config.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need MJPG, YUYV or GREY)",
                negotiated.fourcc
            ))
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated camera format"
        );

        Ok(Self {
            stream,
            _device: device,
            device_path: path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }
}

impl CameraSource for V4lCamera {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let image = match self.pixel_format {
            PixelFormat::Mjpg => frame::decode_mjpeg(buf),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
        }
        .map_err(|e| {
            CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format))
        })?;

        Ok(Frame::new(image, sequence))
    }

    fn describe(&self) -> String {
        format!("{} {}x{} {:?}", self.device_path, self.width, self.height, self.pixel_format)
    }
}

/// Info about a discovered V4L2 capture device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    (0..16)
        .filter_map(|i| {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                return None;
            }
            let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
            caps.capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                .then(|| DeviceInfo {
                    path,
                    name: caps.card.clone(),
                    driver: caps.driver.clone(),
                    bus: caps.bus.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource(String);

    impl CameraSource for StubSource {
        fn read(&mut self) -> Result<Frame, CameraError> {
            Ok(Frame::new(image::RgbImage::new(4, 4), 0))
        }

        fn describe(&self) -> String {
            self.0.clone()
        }
    }

    /// Opens only the listed device paths and records every attempt.
    struct ListOpener {
        openable: Vec<&'static str>,
        attempts: Vec<String>,
    }

    impl CameraOpener for ListOpener {
        fn open(&mut self, config: &SourceConfig) -> Result<Box<dyn CameraSource>, CameraError> {
            self.attempts.push(config.device.clone());
            if self.openable.contains(&config.device.as_str()) {
                Ok(Box::new(StubSource(config.device.clone())))
            } else {
                Err(CameraError::DeviceNotFound(config.device.clone()))
            }
        }
    }

    fn candidates(devices: &[&str]) -> Vec<SourceConfig> {
        devices
            .iter()
            .map(|d| SourceConfig {
                device: d.to_string(),
                width: 640,
                height: 480,
            })
            .collect()
    }

    #[test]
    fn test_open_first_tries_in_order() {
        let mut opener = ListOpener {
            openable: vec!["/dev/video2", "/dev/video1"],
            attempts: Vec::new(),
        };
        let devices = candidates(&["/dev/video0", "/dev/video1", "/dev/video2"]);
        let (source, chosen) = open_first(&mut opener, &devices).unwrap();
        assert_eq!(chosen.device, "/dev/video1");
        assert_eq!(source.describe(), "/dev/video1");
        assert_eq!(opener.attempts, vec!["/dev/video0", "/dev/video1"]);
    }

    #[test]
    fn test_open_first_all_fail() {
        let mut opener = ListOpener {
            openable: Vec::new(),
            attempts: Vec::new(),
        };
        let err = open_first(&mut opener, &candidates(&["/dev/video0", "/dev/video1"]))
            .err()
            .unwrap();
        match err {
            CameraError::Unavailable { tried } => assert_eq!(tried.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_open_first_empty_candidates() {
        let mut opener = ListOpener {
            openable: vec!["/dev/video0"],
            attempts: Vec::new(),
        };
        assert!(matches!(
            open_first(&mut opener, &[]),
            Err(CameraError::Unavailable { .. })
        ));
        assert!(opener.attempts.is_empty());
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }
}
