//! roster-core: face descriptors, detection and matching policy.
//!
//! Uses SCRFD for face detection and SFace for 128-d face descriptors, both
//! running via ONNX Runtime on the CPU. Enrollment, matching and attendance
//! rules live here so the daemon and the store share one definition.

pub mod alignment;
pub mod analyzer;
pub mod attendance;
pub mod detector;
pub mod enrollment;
pub mod matcher;
pub mod recognizer;
pub mod report;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use attendance::{AttendanceAction, AttendanceStatus};
pub use enrollment::{CapturePolicy, CaptureRejection, EnrollmentError, EnrollmentSession, FaceEnrollment};
pub use matcher::{MatchCandidate, MatchPolicy, ReferenceSet};
pub use types::{BoundingBox, Descriptor, DescriptorError, Detection, Pose, PoseDescriptors, DESCRIPTOR_DIM};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the SFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "face_recognition_sface_2021dec.onnx";

/// Default model directory: `$XDG_DATA_HOME/roster/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("roster/models")
}
