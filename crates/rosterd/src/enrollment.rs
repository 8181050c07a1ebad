//! Per-employee enrollment sessions held by the daemon between captures.

use crate::engine::{EngineError, EngineHandle};
use roster_core::{CapturePolicy, CaptureRejection, EnrollmentError, EnrollmentSession, Pose};
use roster_hw::FrameError;
use roster_store::{Store, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot encode capture: {0}")]
    Frame(#[from] FrameError),
}

/// Result of one pose capture, accepted or not.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub pose: Pose,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<CaptureRejection>,
    /// Operator-facing retake message when rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub missing: Vec<Pose>,
    pub next_pose: Option<Pose>,
    /// What to tell the employee for `next_pose`.
    pub instruction: Option<&'static str>,
}

pub struct EnrollmentSettings {
    pub policy: CapturePolicy,
    pub jpeg_quality: u8,
    pub max_payload_bytes: usize,
}

pub struct Enrollments {
    store: Store,
    engine: EngineHandle,
    settings: EnrollmentSettings,
    sessions: Mutex<HashMap<String, EnrollmentSession>>,
}

impl Enrollments {
    pub fn new(store: Store, engine: EngineHandle, settings: EnrollmentSettings) -> Self {
        Self {
            store,
            engine,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Capture a frame for `pose`, validate it and keep it in the session.
    pub async fn capture(&self, employee_id: &str, pose: Pose) -> Result<CaptureOutcome, EnrollError> {
        if self.store.get_employee(employee_id).await?.is_none() {
            return Err(StoreError::EmployeeNotFound(employee_id.to_string()).into());
        }

        let capture = self.engine.detect_single().await?;
        let check = self.settings.policy.check(
            capture.frame.width(),
            capture.frame.height(),
            capture.detection.as_ref(),
        );

        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(employee_id.to_string())
            .or_insert_with(|| EnrollmentSession::new(employee_id));

        let (accepted, rejection) = match (check, capture.detection) {
            (Ok(()), Some(detection)) => {
                let jpeg = capture.frame.to_jpeg(self.settings.jpeg_quality)?;
                session.record(pose, detection.descriptor, jpeg);
                tracing::info!(employee = employee_id, %pose, "pose captured");
                (true, None)
            }
            (Err(rejection), _) => {
                tracing::info!(employee = employee_id, %pose, reason = %rejection, "capture rejected");
                (false, Some(rejection))
            }
            (Ok(()), None) => (false, Some(CaptureRejection::NoFace)),
        };

        let next_pose = session.next_pose();
        Ok(CaptureOutcome {
            pose,
            accepted,
            message: rejection.as_ref().map(ToString::to_string),
            rejection,
            missing: session.missing(),
            next_pose,
            instruction: next_pose.map(|p| p.instruction()),
        })
    }

    /// Average the captured poses and overwrite the employee's face data.
    /// On failure the session is kept so the operator can retake.
    pub async fn save(&self, employee_id: &str) -> Result<(), EnrollError> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(employee_id) else {
            return Err(EnrollmentError::MissingPoses(Pose::ALL.to_vec()).into());
        };

        let enrollment = session.finish(self.settings.max_payload_bytes).map_err(|e| {
            tracing::warn!(employee = employee_id, error = %e, "enrollment not saved");
            e
        })?;
        self.store.save_face_enrollment(employee_id, &enrollment).await?;
        sessions.remove(employee_id);
        Ok(())
    }

    /// Discard the session. Returns whether one existed.
    pub async fn reset(&self, employee_id: &str) -> bool {
        self.sessions.lock().await.remove(employee_id).is_some()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
