use crate::config::Config;
use crate::engine::EngineHandle;
use crate::enrollment::Enrollments;
use crate::recognition::{LoopSettings, RecognitionEvent, RecognitionLoop};
use crate::recorder::{Outcome, Proposal, Recorder, RecorderError};
use chrono::{Local, NaiveDate, NaiveDateTime};
use roster_core::report;
use roster_core::Pose;
use roster_store::{AttendanceRow, Employee, NewEmployee, Store};
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use zbus::interface;

pub const BUS_NAME: &str = "org.roster.Kiosk1";
pub const OBJECT_PATH: &str = "/org/roster/Kiosk1";

/// Longest a single `NextEvent` call may block.
const MAX_EVENT_WAIT_SECS: u32 = 60;
const EVENT_BUFFER: usize = 8;

/// D-Bus interface for the attendance kiosk daemon.
///
/// Bus name: org.roster.Kiosk1
/// Object path: /org/roster/Kiosk1
///
/// Every method except `Snapshot` returns a JSON document; failures are `org.freedesktop.DBus.Error.Failed`
/// carrying an operator-facing message.
pub struct RosterService {
    config: Arc<Config>,
    store: Store,
    engine: EngineHandle,
    enrollments: Enrollments,
    recorder: Recorder,
    kiosk: Mutex<Option<RecognitionLoop>>,
    events: Mutex<Option<mpsc::Receiver<RecognitionEvent>>>,
}

impl RosterService {
    pub fn new(config: Arc<Config>, store: Store, engine: EngineHandle) -> Self {
        let enrollments = Enrollments::new(
            store.clone(),
            engine.clone(),
            crate::enrollment::EnrollmentSettings {
                policy: config.capture_policy(),
                jpeg_quality: config.jpeg_quality,
                max_payload_bytes: config.max_payload_bytes,
            },
        );
        let recorder = Recorder::new(store.clone(), config.late_cutoff_hour);
        Self {
            config,
            store,
            engine,
            enrollments,
            recorder,
            kiosk: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    async fn resume_kiosk(&self) {
        if let Some(kiosk) = self.kiosk.lock().await.as_ref() {
            kiosk.resume();
        }
    }

    async fn shutdown_kiosk(&self) -> bool {
        let Some(kiosk) = self.kiosk.lock().await.take() else {
            return false;
        };
        kiosk.stop().await;
        // The loop dropped its sender, so a blocked NextEvent returns promptly
        self.events.lock().await.take();
        self.recorder.clear().await;
        true
    }

    /// Turn a loop event into the JSON handed to the operator.
    async fn present(&self, event: RecognitionEvent) -> serde_json::Value {
        match event {
            RecognitionEvent::Recognized(recognition) => {
                match self.recorder.propose(&recognition, now()).await {
                    Ok(proposal) => json!({
                        "type": "proposal",
                        "faces": recognition.faces,
                        "proposal": ProposalView::from(&proposal),
                    }),
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot propose attendance");
                        self.resume_kiosk().await;
                        json!({ "type": "error", "message": e.to_string() })
                    }
                }
            }
            RecognitionEvent::NoReferenceData => json!({
                "type": "no_reference_data",
                "message": "no employee has face data yet, enroll someone first",
            }),
            RecognitionEvent::Failed(message) => json!({ "type": "error", "message": message }),
        }
    }
}

#[interface(name = "org.roster.Kiosk1")]
impl RosterService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (connected, employees) = match self.store.count_employees().await {
            Ok(count) => (true, count),
            Err(e) => {
                tracing::warn!(error = %e, "store unreachable");
                (false, 0)
            }
        };
        let kiosk = match self.kiosk.lock().await.as_ref() {
            Some(k) => k.state().as_str(),
            None => "stopped",
        };
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.engine.source(),
            "models": {
                "detector": self.config.detector_model_path(),
                "recognizer": self.config.recognizer_model_path(),
            },
            "store": {
                "path": self.config.db_path.display().to_string(),
                "connected": connected,
                "employees": employees,
            },
            "kiosk": kiosk,
            "pending_proposal": self.recorder.pending().await.map(|p| p.id.to_string()),
            "enrollment_sessions": self.enrollments.active_sessions().await,
        })
        .to_string())
    }

    /// Register a new employee without face data.
    async fn register_employee(
        &self,
        name: &str,
        email: &str,
        position: &str,
        department: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(email, "register_employee requested");
        let form = NewEmployee {
            name: name.to_string(),
            email: email.to_string(),
            position: position.to_string(),
            department: department.to_string(),
        };
        let employee = self.store.create_employee(form, now()).await.map_err(failed)?;
        to_json(&EmployeeView::from(&employee))
    }

    /// List employees ordered by name.
    async fn list_employees(&self) -> zbus::fdo::Result<String> {
        let employees = self.store.list_employees().await.map_err(failed)?;
        let views: Vec<EmployeeView> = employees.iter().map(EmployeeView::from).collect();
        to_json(&views)
    }

    async fn get_employee(&self, id: &str) -> zbus::fdo::Result<String> {
        let employee = self
            .store
            .get_employee(id)
            .await
            .map_err(failed)?
            .ok_or_else(|| failed(format!("employee not found: {id}")))?;
        let poses: Vec<Pose> = employee
            .face_angles
            .as_ref()
            .map(|a| a.present().map(|(p, _)| p).collect())
            .unwrap_or_default();
        Ok(json!({
            "employee": EmployeeView::from(&employee),
            "poses": poses,
            "profile_image_bytes": employee.profile_image.as_ref().map_or(0, Vec::len),
        })
        .to_string())
    }

    /// Capture one enrollment pose for an employee.
    async fn capture_pose(&self, employee_id: &str, pose: &str) -> zbus::fdo::Result<String> {
        let pose: Pose = pose.parse().map_err(failed)?;
        tracing::info!(employee_id, %pose, "capture_pose requested");
        let outcome = self.enrollments.capture(employee_id, pose).await.map_err(failed)?;
        to_json(&outcome)
    }

    /// Store the averaged descriptor and per-pose descriptors.
    async fn save_enrollment(&self, employee_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(employee_id, "save_enrollment requested");
        self.enrollments.save(employee_id).await.map_err(failed)?;
        Ok(json!({ "saved": true, "employee_id": employee_id }).to_string())
    }

    /// Drop any captured poses and start over from the first pose.
    async fn reset_enrollment(&self, employee_id: &str) -> zbus::fdo::Result<String> {
        let existed = self.enrollments.reset(employee_id).await;
        let first = Pose::ALL[0];
        Ok(json!({
            "reset": existed,
            "employee_id": employee_id,
            "next_pose": first,
            "instruction": first.instruction(),
        })
        .to_string())
    }

    /// Start the recognition loop.
    async fn start_kiosk(&self) -> zbus::fdo::Result<String> {
        let mut kiosk = self.kiosk.lock().await;
        if kiosk.is_some() {
            return Err(failed("kiosk is already running"));
        }
        self.recorder.clear().await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let settings = LoopSettings {
            policy: self.config.match_policy(),
            poll_interval: self.config.poll_interval(),
            jpeg_quality: self.config.jpeg_quality,
        };
        *kiosk = Some(RecognitionLoop::spawn(
            self.engine.clone(),
            self.store.clone(),
            settings,
            tx,
        ));
        *self.events.lock().await = Some(rx);
        Ok(json!({ "kiosk": "running" }).to_string())
    }

    async fn stop_kiosk(&self) -> zbus::fdo::Result<String> {
        let was_running = self.shutdown_kiosk().await;
        Ok(json!({ "kiosk": "stopped", "was_running": was_running }).to_string())
    }

    /// Wait up to `timeout_secs` for the next kiosk event.
    async fn next_event(&self, timeout_secs: u32) -> zbus::fdo::Result<String> {
        let wait = Duration::from_secs(timeout_secs.clamp(1, MAX_EVENT_WAIT_SECS) as u64);
        let received = {
            let mut events = self.events.lock().await;
            let Some(rx) = events.as_mut() else {
                return Err(failed("kiosk is not running"));
            };
            tokio::time::timeout(wait, rx.recv()).await
        };

        let value = match received {
            Err(_) => json!({ "type": "idle" }),
            Ok(None) => json!({ "type": "stopped" }),
            Ok(Some(event)) => self.present(event).await,
        };
        Ok(value.to_string())
    }

    /// Confirm the pending proposal and write the attendance record.
    async fn confirm(&self, proposal_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(proposal_id, "confirm requested");
        let result = self.recorder.confirm(proposal_id, now()).await;
        if !matches!(result, Err(RecorderError::UnknownProposal(_))) {
            self.resume_kiosk().await;
        }
        let outcome = result.map_err(failed)?;
        let value = match &outcome {
            Outcome::CheckedIn { attendance } => json!({
                "outcome": "checked_in",
                "attendance_id": attendance.id,
                "status": attendance.status,
                "time": report::format_time(Some(attendance.check_in_time)),
            }),
            Outcome::CheckedOut { attendance } => json!({
                "outcome": "checked_out",
                "attendance_id": attendance.id,
                "time": report::format_time(attendance.check_out_time),
                "duration": report::format_duration(attendance.check_in_time, attendance.check_out_time),
            }),
        };
        Ok(value.to_string())
    }

    /// JPEG of the frame behind the pending proposal.
    async fn snapshot(&self, proposal_id: &str) -> zbus::fdo::Result<Vec<u8>> {
        self.recorder.snapshot(proposal_id).await.map_err(failed)
    }

    /// Discard the pending proposal.
    async fn cancel(&self, proposal_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(proposal_id, "cancel requested");
        self.recorder.cancel(proposal_id).await.map_err(failed)?;
        self.resume_kiosk().await;
        Ok(json!({ "cancelled": true }).to_string())
    }

    /// Attendance for `date` (`YYYY-MM-DD`, empty for today).
    async fn report(&self, date: &str) -> zbus::fdo::Result<String> {
        let day = if date.trim().is_empty() {
            now().date()
        } else {
            NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
                .map_err(|e| failed(format!("invalid date '{date}': {e}")))?
        };
        let rows = self.store.attendance_for_date(day).await.map_err(failed)?;
        let rows: Vec<ReportLine> = rows.iter().map(ReportLine::from).collect();
        Ok(json!({ "date": day.to_string(), "rows": rows }).to_string())
    }
}

#[derive(Serialize)]
struct EmployeeView<'a> {
    id: &'a str,
    name: &'a str,
    email: &'a str,
    position: &'a str,
    department: &'a str,
    enrolled: bool,
    created_at: NaiveDateTime,
}

impl<'a> From<&'a Employee> for EmployeeView<'a> {
    fn from(e: &'a Employee) -> Self {
        Self {
            id: &e.id,
            name: &e.name,
            email: &e.email,
            position: &e.position,
            department: &e.department,
            enrolled: e.is_enrolled(),
            created_at: e.created_at,
        }
    }
}

#[derive(Serialize)]
struct ProposalView<'a> {
    #[serde(flatten)]
    proposal: &'a Proposal,
    snapshot_bytes: usize,
}

impl<'a> From<&'a Proposal> for ProposalView<'a> {
    fn from(proposal: &'a Proposal) -> Self {
        Self {
            proposal,
            snapshot_bytes: proposal.snapshot.len(),
        }
    }
}

/// One rendered report row.
#[derive(Serialize)]
struct ReportLine {
    employee_name: String,
    position: String,
    department: String,
    check_in: String,
    check_out: String,
    duration: String,
    status: String,
}

impl From<&AttendanceRow> for ReportLine {
    fn from(row: &AttendanceRow) -> Self {
        let a = &row.attendance;
        Self {
            employee_name: row.employee_name.clone(),
            position: row.employee_position.clone(),
            department: row.employee_department.clone(),
            check_in: report::format_time(Some(a.check_in_time)),
            check_out: report::format_time(a.check_out_time),
            duration: report::format_duration(a.check_in_time, a.check_out_time),
            status: a.status.to_string(),
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn failed(e: impl Display) -> zbus::fdo::Error {
    let message = e.to_string();
    tracing::warn!(error = %message, "request failed");
    zbus::fdo::Error::Failed(message)
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::*;
    use crate::engine::spawn_engine;
    use roster_core::{Descriptor, FaceEnrollment, PoseDescriptors, DESCRIPTOR_DIM};
    use serde_json::Value;

    fn probe() -> Descriptor {
        let mut v = vec![0.0; DESCRIPTOR_DIM];
        v[0] = 1.0;
        v[1] = 0.2;
        Descriptor::new(v).unwrap()
    }

    async fn service(faces: Vec<roster_core::Detection>) -> RosterService {
        let store = Store::open_in_memory().await.unwrap();
        let engine = spawn_engine(GreyFrames::new(), ScriptedAnalyzer::with(faces), 0).unwrap();
        let config = Config {
            poll_interval_ms: 10,
            ..Config::default()
        };
        RosterService::new(Arc::new(config), store, engine)
    }

    async fn register(service: &RosterService, name: &str, email: &str) -> String {
        let json: Value = serde_json::from_str(
            &service
                .register_employee(name, email, "Engineer", "Operations")
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(json["enrolled"], false);
        json["id"].as_str().unwrap().to_string()
    }

    async fn enroll(service: &RosterService, id: &str) {
        let mut poses = PoseDescriptors::default();
        for pose in Pose::ALL {
            poses.set(pose, unit(0, 1.0));
        }
        let enrollment = FaceEnrollment {
            primary: unit(0, 1.0),
            poses,
            profile_image: vec![0xFF, 0xD8],
        };
        service.store.save_face_enrollment(id, &enrollment).await.unwrap();
    }

    async fn next_event(service: &RosterService) -> Value {
        serde_json::from_str(&service.next_event(5).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_kiosk_check_in_then_check_out() {
        let service = service(vec![centered_face(probe())]).await;
        let id = register(&service, "Somchai", "somchai@example.com").await;
        enroll(&service, &id).await;

        service.start_kiosk().await.unwrap();
        assert!(service.start_kiosk().await.is_err());

        let event = next_event(&service).await;
        assert_eq!(event["type"], "proposal");
        assert_eq!(event["proposal"]["action"], "check_in");
        assert_eq!(event["proposal"]["employee_id"], id.as_str());
        assert_eq!(event["proposal"]["confidence"], 80);
        let proposal_id = event["proposal"]["id"].as_str().unwrap().to_string();

        let jpeg = service.snapshot(&proposal_id).await.unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(event["proposal"]["snapshot_bytes"], jpeg.len());
        assert!(service.snapshot("00000000-0000-0000-0000-000000000000").await.is_err());

        let outcome: Value =
            serde_json::from_str(&service.confirm(&proposal_id).await.unwrap()).unwrap();
        assert_eq!(outcome["outcome"], "checked_in");

        // The loop resumed and sees the open record
        let event = next_event(&service).await;
        assert_eq!(event["proposal"]["action"], "check_out");
        let second = event["proposal"]["id"].as_str().unwrap().to_string();
        assert!(service.confirm(&proposal_id).await.is_err());
        service.cancel(&second).await.unwrap();

        let report: Value = serde_json::from_str(&service.report("").await.unwrap()).unwrap();
        let rows = report["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["employee_name"], "Somchai");
        assert_eq!(rows[0]["check_out"], "-");
        assert_eq!(rows[0]["duration"], "-");

        let stopped: Value = serde_json::from_str(&service.stop_kiosk().await.unwrap()).unwrap();
        assert_eq!(stopped["was_running"], true);
        assert!(service.next_event(1).await.is_err());
    }

    #[tokio::test]
    async fn test_kiosk_without_enrollments() {
        let service = service(vec![centered_face(probe())]).await;
        register(&service, "Somchai", "somchai@example.com").await;
        service.start_kiosk().await.unwrap();
        assert_eq!(next_event(&service).await["type"], "no_reference_data");
        let idle: Value = serde_json::from_str(&service.next_event(1).await.unwrap()).unwrap();
        assert_eq!(idle["type"], "idle");
        service.stop_kiosk().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let service = service(Vec::new()).await;
        register(&service, "Somchai", "somchai@example.com").await;

        let dup = service
            .register_employee("Somchai B", "somchai@example.com", "Clerk", "Finance")
            .await
            .unwrap_err();
        assert!(dup.to_string().contains("email already registered"));

        let short = service
            .register_employee("S", "s@example.com", "Clerk", "Finance")
            .await
            .unwrap_err();
        assert!(short.to_string().contains("name"));
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let service = service(Vec::new()).await;
        let w = register(&service, "Wichai", "w@example.com").await;
        register(&service, "Anong", "a@example.com").await;
        enroll(&service, &w).await;

        let list: Value = serde_json::from_str(&service.list_employees().await.unwrap()).unwrap();
        let list = list.as_array().unwrap();
        assert_eq!(list[0]["name"], "Anong");
        assert_eq!(list[1]["enrolled"], true);

        let detail: Value = serde_json::from_str(&service.get_employee(&w).await.unwrap()).unwrap();
        assert_eq!(detail["poses"].as_array().unwrap().len(), 5);
        assert!(service.get_employee("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let service = service(Vec::new()).await;
        assert!(service.report("01/05/2024").await.is_err());
        assert!(service.capture_pose("someone", "sideways").await.is_err());
        assert!(service.next_event(1).await.is_err(), "kiosk not running");
    }

    #[tokio::test]
    async fn test_status() {
        let service = service(Vec::new()).await;
        let status: Value = serde_json::from_str(&service.status().await.unwrap()).unwrap();
        assert_eq!(status["camera"], "grey test frames");
        assert_eq!(status["store"]["connected"], true);
        assert_eq!(status["kiosk"], "stopped");
    }
}
