//! roster-hw: frame sources for the attendance kiosk.
//!
//! Provides V4L2 webcam capture and a still-image directory source behind
//! one `FrameSource` trait, plus pixel conversion and JPEG export.

pub mod camera;
pub mod frame;
pub mod stills;

use std::path::Path;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use stills::StillImages;

/// Anything that can hand out RGB frames on demand.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable description for logs and status output.
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        (**self).capture()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Open `path` as a still-image directory if it is one, else as a V4L2 device.
pub fn open_source(path: &str) -> Result<Box<dyn FrameSource>, CameraError> {
    if Path::new(path).is_dir() {
        Ok(Box::new(StillImages::open(path)?))
    } else {
        Ok(Box::new(Camera::open(path)?))
    }
}
