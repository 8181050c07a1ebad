//! Frame source backed by a directory of still images.
//!
//! Used when the configured camera path is a directory: kiosk demos on
//! machines without a webcam, and integration tests.

use crate::camera::CameraError;
use crate::frame::Frame;
use crate::FrameSource;
use std::path::{Path, PathBuf};

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Cycles through the image files of a directory in name order.
pub struct StillImages {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
    sequence: u32,
}

impl StillImages {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CameraError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(CameraError::NoImages(dir.display().to_string()));
        }

        tracing::info!(dir = %dir.display(), images = paths.len(), "opened still-image source");

        Ok(Self {
            dir: dir.to_path_buf(),
            paths,
            next: 0,
            sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for StillImages {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        let path = &self.paths[self.next % self.paths.len()];
        // Advance first so an unreadable file is skipped on the next tick.
        self.next = (self.next + 1) % self.paths.len();
        let image = image::open(path)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_rgb8();

        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame::new(image, self.sequence))
    }

    fn describe(&self) -> String {
        format!("{} ({} images)", self.dir.display(), self.paths.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roster-stills-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_cycles_in_name_order() {
        let dir = scratch_dir("cycle");
        RgbImage::from_pixel(4, 4, Rgb([200, 0, 0])).save(dir.join("a.png")).unwrap();
        RgbImage::from_pixel(6, 6, Rgb([0, 200, 0])).save(dir.join("b.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut source = StillImages::open(&dir).unwrap();
        assert_eq!(source.len(), 2);

        let sizes: Vec<u32> = (0..3).map(|_| source.capture().unwrap().width()).collect();
        assert_eq!(sizes, vec![4, 6, 4]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corrupt_file_does_not_stall() {
        let dir = scratch_dir("corrupt");
        std::fs::write(dir.join("a.jpg"), b"not a jpeg").unwrap();
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 200])).save(dir.join("b.png")).unwrap();

        let mut source = StillImages::open(&dir).unwrap();
        assert!(matches!(source.capture(), Err(CameraError::CaptureFailed(_))));
        assert_eq!(source.capture().unwrap().width(), 8);
        assert!(source.capture().is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_dir_rejected() {
        let dir = scratch_dir("empty");
        assert!(matches!(StillImages::open(&dir), Err(CameraError::NoImages(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_dir_rejected() {
        assert!(matches!(
            StillImages::open("/nonexistent/roster/stills"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
