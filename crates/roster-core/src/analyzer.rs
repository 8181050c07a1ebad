//! The detector capability: RGB frame in, faces with descriptors out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Face detection plus descriptor extraction.
pub trait FaceAnalyzer: Send {
    /// The most confident face in the frame, if any.
    fn detect_single(&mut self, frame: &RgbImage) -> Result<Option<Detection>, AnalyzerError>;

    /// Every face in the frame, most confident first.
    fn detect_all(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, AnalyzerError>;
}

/// SCRFD detection + SFace recognition.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect_single(&mut self, frame: &RgbImage) -> Result<Option<Detection>, AnalyzerError> {
        let faces = self.detector.detect(frame)?;
        let Some(bbox) = faces.into_iter().next() else {
            return Ok(None);
        };
        let descriptor = self.recognizer.extract(frame, &bbox)?;
        Ok(Some(Detection { bbox, descriptor }))
    }

    fn detect_all(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        let faces = self.detector.detect(frame)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "skipping face without landmarks");
                continue;
            }
            let descriptor = self.recognizer.extract(frame, &bbox)?;
            detections.push(Detection { bbox, descriptor });
        }
        Ok(detections)
    }
}
