//! Attendance recorder: turns a recognition into a check-in or check-out
//! proposal and writes it once the operator confirms.

use crate::recognition::Recognition;
use chrono::NaiveDateTime;
use roster_core::{AttendanceAction, AttendanceStatus};
use roster_store::{Attendance, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("no pending proposal with id {0}")]
    UnknownProposal(String),
    #[error("another proposal is awaiting confirmation")]
    ProposalPending,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProposedAction {
    /// `status` is the projection at proposal time; the stored status uses
    /// the confirmation time.
    CheckIn { status: AttendanceStatus },
    CheckOut {
        attendance_id: String,
        check_in_time: NaiveDateTime,
    },
}

impl ProposedAction {
    pub fn kind(&self) -> AttendanceAction {
        match self {
            ProposedAction::CheckIn { .. } => AttendanceAction::CheckIn,
            ProposedAction::CheckOut { .. } => AttendanceAction::CheckOut,
        }
    }
}

/// A pending check-in or check-out.
#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub id: Uuid,
    pub employee_id: String,
    pub employee_name: String,
    pub position: String,
    pub department: String,
    pub confidence: u8,
    pub distance: f32,
    pub proposed_at: NaiveDateTime,
    #[serde(flatten)]
    pub action: ProposedAction,
    #[serde(skip)]
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    CheckedIn { attendance: Attendance },
    CheckedOut { attendance: Attendance },
}

pub struct Recorder {
    store: Store,
    late_cutoff_hour: u32,
    pending: Mutex<Option<Proposal>>,
}

impl Recorder {
    pub fn new(store: Store, late_cutoff_hour: u32) -> Self {
        Self {
            store,
            late_cutoff_hour,
            pending: Mutex::new(None),
        }
    }

    /// Decide check-in or check-out for a recognized employee and hold the
    /// proposal until it is confirmed or cancelled.
    pub async fn propose(
        &self,
        recognition: &Recognition,
        now: NaiveDateTime,
    ) -> Result<Proposal, RecorderError> {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            return Err(RecorderError::ProposalPending);
        }

        let employee_id = &recognition.candidate.employee_id;
        let employee = self
            .store
            .get_employee(employee_id)
            .await?
            .ok_or_else(|| StoreError::EmployeeNotFound(employee_id.clone()))?;

        let open = self.store.open_attendance(employee_id, now.date()).await?;
        let action = match open {
            Some(record) => ProposedAction::CheckOut {
                attendance_id: record.id,
                check_in_time: record.check_in_time,
            },
            None => ProposedAction::CheckIn {
                status: AttendanceStatus::for_check_in(now, self.late_cutoff_hour),
            },
        };

        let proposal = Proposal {
            id: Uuid::new_v4(),
            employee_id: employee.id,
            employee_name: employee.name,
            position: employee.position,
            department: employee.department,
            confidence: recognition.candidate.confidence,
            distance: recognition.candidate.distance,
            proposed_at: now,
            action,
            snapshot: recognition.snapshot.clone(),
        };

        tracing::info!(
            proposal = %proposal.id,
            employee = %proposal.employee_id,
            action = ?proposal.action.kind(),
            confidence = proposal.confidence,
            "attendance proposed"
        );
        *pending = Some(proposal.clone());
        Ok(proposal)
    }

    /// Write the pending proposal. The proposal is consumed whether or not
    /// the write succeeds.
    pub async fn confirm(
        &self,
        proposal_id: &str,
        now: NaiveDateTime,
    ) -> Result<Outcome, RecorderError> {
        let proposal = self.take(proposal_id).await?;

        let outcome = match proposal.action {
            ProposedAction::CheckIn { .. } => {
                let status = AttendanceStatus::for_check_in(now, self.late_cutoff_hour);
                let attendance = self
                    .store
                    .check_in(&proposal.employee_id, now, status, Some(proposal.snapshot))
                    .await?;
                Outcome::CheckedIn { attendance }
            }
            ProposedAction::CheckOut { attendance_id, .. } => {
                let attendance = self.store.check_out(&attendance_id, now).await?;
                Outcome::CheckedOut { attendance }
            }
        };
        Ok(outcome)
    }

    pub async fn cancel(&self, proposal_id: &str) -> Result<(), RecorderError> {
        let proposal = self.take(proposal_id).await?;
        tracing::info!(proposal = %proposal.id, employee = %proposal.employee_id, "proposal cancelled");
        Ok(())
    }

    /// Drop any pending proposal.
    pub async fn clear(&self) {
        if let Some(p) = self.pending.lock().await.take() {
            tracing::debug!(proposal = %p.id, "pending proposal discarded");
        }
    }

    pub async fn pending(&self) -> Option<Proposal> {
        self.pending.lock().await.clone()
    }

    /// JPEG of the frame behind the pending proposal.
    pub async fn snapshot(&self, proposal_id: &str) -> Result<Vec<u8>, RecorderError> {
        let pending = self.pending.lock().await;
        match pending.as_ref() {
            Some(p) if is_proposal(p, proposal_id) => Ok(p.snapshot.clone()),
            _ => Err(RecorderError::UnknownProposal(proposal_id.to_string())),
        }
    }

    async fn take(&self, proposal_id: &str) -> Result<Proposal, RecorderError> {
        let mut pending = self.pending.lock().await;
        if !pending.as_ref().is_some_and(|p| is_proposal(p, proposal_id)) {
            return Err(RecorderError::UnknownProposal(proposal_id.to_string()));
        }
        pending
            .take()
            .ok_or_else(|| RecorderError::UnknownProposal(proposal_id.to_string()))
    }
}

fn is_proposal(proposal: &Proposal, proposal_id: &str) -> bool {
    proposal.id.to_string() == proposal_id.trim().to_ascii_lowercase()
}
