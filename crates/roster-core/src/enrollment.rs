//! Multi-pose enrollment policy.
//!
//! An enrollment collects one descriptor for each of the five [`Pose`]s. Each
//! capture is validated for presence, size and centering before it is kept.
//! The stored primary descriptor is the element-wise mean of the five.

use crate::types::{Descriptor, DescriptorError, Detection, Pose, PoseDescriptors};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MIN_FACE_AREA_RATIO: f32 = 0.10;
pub const DEFAULT_MAX_CENTER_OFFSET: f32 = 0.20;
/// Cap on the JSON-serialized size of each stored descriptor payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1_000_000;

/// Geometry checks applied to an enrollment capture.
#[derive(Debug, Clone, Copy)]
pub struct CapturePolicy {
    /// Minimum face box area as a fraction of frame area.
    pub min_face_area_ratio: f32,
    /// Maximum distance of the face center from the frame center, as a
    /// fraction of the frame dimension, per axis.
    pub max_center_offset: f32,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            min_face_area_ratio: DEFAULT_MIN_FACE_AREA_RATIO,
            max_center_offset: DEFAULT_MAX_CENTER_OFFSET,
        }
    }
}

/// Why a capture must be retaken.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CaptureRejection {
    #[error("no face found in the image, please retake")]
    NoFace,
    #[error("face is too small ({:.0}% of the frame), please move closer to the camera", .area_ratio * 100.0)]
    FaceTooSmall { area_ratio: f32 },
    #[error("face is not centered, please face the camera")]
    OffCenter { offset_x: f32, offset_y: f32 },
}

impl CapturePolicy {
    /// Validate a single-face detection against a `frame_width` × `frame_height` frame.
    pub fn check(
        &self,
        frame_width: u32,
        frame_height: u32,
        detection: Option<&Detection>,
    ) -> Result<(), CaptureRejection> {
        let detection = detection.ok_or(CaptureRejection::NoFace)?;
        let (w, h) = (frame_width as f32, frame_height as f32);
        if w <= 0.0 || h <= 0.0 {
            return Err(CaptureRejection::NoFace);
        }

        let area_ratio = detection.bbox.area() / (w * h);
        if area_ratio < self.min_face_area_ratio {
            return Err(CaptureRejection::FaceTooSmall { area_ratio });
        }

        let (cx, cy) = detection.bbox.center();
        let offset_x = (cx - w / 2.0).abs() / w;
        let offset_y = (cy - h / 2.0).abs() / h;
        if offset_x > self.max_center_offset || offset_y > self.max_center_offset {
            return Err(CaptureRejection::OffCenter { offset_x, offset_y });
        }

        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentError {
    #[error("capture all poses before saving (missing: {})", join_poses(.0))]
    MissingPoses(Vec<Pose>),
    #[error("{field} payload is too large ({size} bytes, limit {limit}), please try again")]
    PayloadTooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("no captured frame to use as profile image")]
    NoProfileImage,
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("failed to serialize descriptors: {0}")]
    Serialize(String),
}

fn join_poses(poses: &[Pose]) -> String {
    poses.iter().map(Pose::as_str).collect::<Vec<_>>().join(", ")
}

/// Everything written to the store when an enrollment completes.
#[derive(Debug, Clone)]
pub struct FaceEnrollment {
    pub primary: Descriptor,
    pub poses: PoseDescriptors,
    /// JPEG of the last accepted capture.
    pub profile_image: Vec<u8>,
}

/// Working state of one employee's enrollment.
#[derive(Debug, Clone)]
pub struct EnrollmentSession {
    employee_id: String,
    poses: PoseDescriptors,
    last_frame: Option<Vec<u8>>,
}

impl EnrollmentSession {
    pub fn new(employee_id: impl Into<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            poses: PoseDescriptors::default(),
            last_frame: None,
        }
    }

    pub fn employee_id(&self) -> &str {
        &self.employee_id
    }

    pub fn poses(&self) -> &PoseDescriptors {
        &self.poses
    }

    /// Keep an accepted capture. A repeated pose replaces the earlier one.
    pub fn record(&mut self, pose: Pose, descriptor: Descriptor, frame_jpeg: Vec<u8>) {
        self.poses.set(pose, descriptor);
        self.last_frame = Some(frame_jpeg);
    }

    pub fn missing(&self) -> Vec<Pose> {
        self.poses.missing()
    }

    /// First pose still to capture.
    pub fn next_pose(&self) -> Option<Pose> {
        self.missing().into_iter().next()
    }

    pub fn is_complete(&self) -> bool {
        self.next_pose().is_none()
    }

    /// Average the five poses and check payload sizes.
    pub fn finish(&self, max_payload_bytes: usize) -> Result<FaceEnrollment, EnrollmentError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(EnrollmentError::MissingPoses(missing));
        }

        let primary = Descriptor::mean(self.poses.present().map(|(_, d)| d))?;

        check_payload("face_descriptor", &primary, max_payload_bytes)?;
        check_payload("face_angles", &self.poses, max_payload_bytes)?;

        let profile_image = self.last_frame.clone().ok_or(EnrollmentError::NoProfileImage)?;

        Ok(FaceEnrollment {
            primary,
            poses: self.poses.clone(),
            profile_image,
        })
    }
}

fn check_payload<T: Serialize>(
    field: &'static str,
    value: &T,
    limit: usize,
) -> Result<(), EnrollmentError> {
    let size = serde_json::to_string(value)
        .map_err(|e| EnrollmentError::Serialize(e.to_string()))?
        .len();
    tracing::debug!(field, size, "enrollment payload size");
    if size > limit {
        return Err(EnrollmentError::PayloadTooLarge { field, size, limit });
    }
    Ok(())
}
