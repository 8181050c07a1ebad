//! Kiosk recognition loop.
//!
//! A tokio task polls the engine on a fixed interval while running, matches
//! every face against the enrolled reference set and publishes the outcome
//! on a bounded channel. After an accepted match the loop pauses itself
//! until the operator's decision resumes it.

use crate::engine::EngineHandle;
use roster_core::{MatchCandidate, MatchPolicy, ReferenceSet};
use roster_store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Paused,
    Stopped,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Stopped => "stopped",
        }
    }
}

/// An accepted match, awaiting operator confirmation.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub candidate: MatchCandidate,
    /// Faces detected in the frame the match came from.
    pub faces: usize,
    /// JPEG of that frame.
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    Recognized(Recognition),
    /// No employee is enrolled; sent once per start or resume.
    NoReferenceData,
    /// A tick failed; polling continues.
    Failed(String),
}

#[derive(Clone)]
pub struct LoopSettings {
    pub policy: MatchPolicy,
    pub poll_interval: Duration,
    pub jpeg_quality: u8,
}

/// Value carried on the control channel. `epoch` increases on every
/// resume so the task reloads references even if it never saw the pause.
#[derive(Debug, Clone, Copy)]
struct Control {
    state: LoopState,
    epoch: u64,
}

/// Control handle for a running recognition task.
pub struct RecognitionLoop {
    control: Arc<watch::Sender<Control>>,
    task: JoinHandle<()>,
}

impl RecognitionLoop {
    /// Start polling immediately.
    pub fn spawn(
        engine: EngineHandle,
        store: Store,
        settings: LoopSettings,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> Self {
        let (control, rx) = watch::channel(Control {
            state: LoopState::Running,
            epoch: 0,
        });
        let control = Arc::new(control);
        let task = tokio::spawn(run(
            engine,
            store,
            settings,
            events,
            Arc::clone(&control),
            rx,
        ));
        tracing::info!("recognition loop started");
        Self { control, task }
    }

    pub fn state(&self) -> LoopState {
        self.control.borrow().state
    }

    /// Continue polling after a pause; the reference set is reloaded first.
    pub fn resume(&self) {
        self.control.send_if_modified(|c| {
            if c.state != LoopState::Paused {
                return false;
            }
            c.state = LoopState::Running;
            c.epoch += 1;
            true
        });
    }

    #[cfg(test)]
    pub fn pause(&self) {
        pause(&self.control);
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(self) {
        self.control.send_modify(|c| c.state = LoopState::Stopped);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "recognition task ended abnormally");
        }
        tracing::info!("recognition loop stopped");
    }
}

fn pause(control: &watch::Sender<Control>) {
    control.send_if_modified(|c| {
        if c.state != LoopState::Running {
            return false;
        }
        c.state = LoopState::Paused;
        true
    });
}

async fn run(
    engine: EngineHandle,
    store: Store,
    settings: LoopSettings,
    events: mpsc::Sender<RecognitionEvent>,
    control: Arc<watch::Sender<Control>>,
    mut state: watch::Receiver<Control>,
) {
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Reference set and the epoch it was loaded for
    let mut references: Option<(u64, ReferenceSet)> = None;

    loop {
        let current = *state.borrow_and_update();
        match current.state {
            LoopState::Stopped => break,
            LoopState::Paused => {
                if state.changed().await.is_err() {
                    break;
                }
                continue;
            }
            LoopState::Running => {}
        }

        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if references.as_ref().map(|(epoch, _)| *epoch) != Some(current.epoch) {
            match load_references(&store).await {
                Ok(refs) => {
                    tracing::debug!(
                        candidates = refs.len(),
                        employees = refs.employee_count(),
                        "reference set loaded"
                    );
                    let empty = refs.is_empty();
                    references = Some((current.epoch, refs));
                    if empty && !publish(&events, &mut state, RecognitionEvent::NoReferenceData).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load reference set");
                    let event = RecognitionEvent::Failed(format!("cannot load enrolled faces: {e}"));
                    if !publish(&events, &mut state, event).await {
                        break;
                    }
                    continue;
                }
            }
        }
        let Some((_, refs)) = references.as_ref() else {
            continue;
        };

        let analyzed = match engine.detect_all().await {
            Ok(analyzed) => analyzed,
            Err(e) => {
                tracing::warn!(error = %e, "recognition tick failed");
                if !publish(&events, &mut state, RecognitionEvent::Failed(e.to_string())).await {
                    break;
                }
                continue;
            }
        };

        let Some((face, candidate)) = settings.policy.best_in_frame(refs, &analyzed.detections) else {
            continue;
        };

        let snapshot = match analyzed.frame.to_jpeg(settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode snapshot");
                if !publish(&events, &mut state, RecognitionEvent::Failed(e.to_string())).await {
                    break;
                }
                continue;
            }
        };

        tracing::info!(
            employee = %candidate.employee_id,
            distance = candidate.distance,
            confidence = candidate.confidence,
            face,
            faces = analyzed.detections.len(),
            "face recognized"
        );

        // Pause before publishing so no further ticks run while the
        // operator decides.
        pause(&control);

        let event = RecognitionEvent::Recognized(Recognition {
            candidate,
            faces: analyzed.detections.len(),
            snapshot,
        });
        if !publish(&events, &mut state, event).await {
            break;
        }
    }

    tracing::debug!("recognition task exiting");
}

/// Send an event, giving up if the loop is stopped while waiting for
/// channel capacity. Returns false when the loop should exit.
async fn publish(
    events: &mpsc::Sender<RecognitionEvent>,
    state: &mut watch::Receiver<Control>,
    event: RecognitionEvent,
) -> bool {
    let send = events.send(event);
    tokio::pin!(send);
    loop {
        tokio::select! {
            sent = &mut send => return sent.is_ok(),
            changed = state.changed() => {
                if changed.is_err() || state.borrow().state == LoopState::Stopped {
                    return false;
                }
            }
        }
    }
}

async fn load_references(store: &Store) -> Result<ReferenceSet, StoreError> {
    let mut refs = ReferenceSet::new();
    for employee in store.enrolled_employees().await? {
        refs.add_employee(
            &employee.id,
            employee.face_descriptor.as_ref(),
            employee.face_angles.as_ref(),
        );
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::*;
    use crate::engine::spawn_engine;
    use chrono::NaiveDate;
    use roster_core::{FaceEnrollment, Pose, PoseDescriptors};
    use roster_store::NewEmployee;

    fn settings() -> LoopSettings {
        LoopSettings {
            policy: MatchPolicy::default(),
            poll_interval: Duration::from_millis(5),
            jpeg_quality: 80,
        }
    }

    async fn enroll_somchai(store: &Store) -> String {
        let now = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let employee = store
            .create_employee(
                NewEmployee {
                    name: "Somchai".into(),
                    email: "somchai@example.com".into(),
                    position: "Engineer".into(),
                    department: "Operations".into(),
                },
                now,
            )
            .await
            .unwrap();
        let mut poses = PoseDescriptors::default();
        for pose in Pose::ALL {
            poses.set(pose, unit(0, 1.0));
        }
        let enrollment = FaceEnrollment {
            primary: unit(0, 1.0),
            poses,
            profile_image: vec![0xFF, 0xD8],
        };
        store.save_face_enrollment(&employee.id, &enrollment).await.unwrap();
        employee.id
    }

    /// Probe at distance 0.2 from the enrolled descriptor.
    fn probe() -> roster_core::Descriptor {
        let mut v = vec![0.0; roster_core::DESCRIPTOR_DIM];
        v[0] = 1.0;
        v[1] = 0.2;
        roster_core::Descriptor::new(v).unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<RecognitionEvent>) -> RecognitionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_recognizes_and_pauses() {
        let store = Store::open_in_memory().await.unwrap();
        let id = enroll_somchai(&store).await;
        let analyzer = ScriptedAnalyzer::with(vec![centered_face(probe())]);
        let engine = spawn_engine(GreyFrames::new(), analyzer, 0).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let kiosk = RecognitionLoop::spawn(engine, store, settings(), tx);

        let RecognitionEvent::Recognized(rec) = next(&mut rx).await else {
            panic!("expected a recognition");
        };
        assert_eq!(rec.candidate.employee_id, id);
        assert_eq!(rec.candidate.confidence, 80);
        assert_eq!(&rec.snapshot[..2], &[0xFF, 0xD8]);
        assert_eq!(kiosk.state(), LoopState::Paused);

        // Nothing more while paused
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        kiosk.resume();
        assert!(matches!(next(&mut rx).await, RecognitionEvent::Recognized(_)));
        kiosk.stop().await;
    }

    #[tokio::test]
    async fn test_no_reference_data_published_once() {
        let store = Store::open_in_memory().await.unwrap();
        let analyzer = ScriptedAnalyzer::with(vec![centered_face(probe())]);
        let engine = spawn_engine(GreyFrames::new(), analyzer, 0).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let kiosk = RecognitionLoop::spawn(engine, store, settings(), tx);

        assert!(matches!(next(&mut rx).await, RecognitionEvent::NoReferenceData));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "no recognition without references");

        kiosk.pause();
        kiosk.resume();
        assert!(matches!(next(&mut rx).await, RecognitionEvent::NoReferenceData));
        kiosk.stop().await;
    }

    #[tokio::test]
    async fn test_distant_face_not_accepted() {
        let store = Store::open_in_memory().await.unwrap();
        enroll_somchai(&store).await;
        // Orthogonal unit vector: distance sqrt(2)
        let analyzer = ScriptedAnalyzer::with(vec![centered_face(unit(5, 1.0))]);
        let engine = spawn_engine(GreyFrames::new(), analyzer, 0).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let kiosk = RecognitionLoop::spawn(engine, store, settings(), tx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(kiosk.state(), LoopState::Running);
        kiosk.stop().await;
    }

    #[tokio::test]
    async fn test_enrollment_picked_up_on_resume() {
        let store = Store::open_in_memory().await.unwrap();
        let analyzer = ScriptedAnalyzer::with(vec![centered_face(probe())]);
        let engine = spawn_engine(GreyFrames::new(), analyzer, 0).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let kiosk = RecognitionLoop::spawn(engine, store.clone(), settings(), tx);
        assert!(matches!(next(&mut rx).await, RecognitionEvent::NoReferenceData));

        let id = enroll_somchai(&store).await;
        kiosk.pause();
        kiosk.resume();
        let RecognitionEvent::Recognized(rec) = next(&mut rx).await else {
            panic!("expected a recognition after resume");
        };
        assert_eq!(rec.candidate.employee_id, id);
        kiosk.stop().await;
    }

    #[tokio::test]
    async fn test_stop_with_full_channel() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = spawn_engine(GreyFrames::new(), ScriptedAnalyzer::default(), 0).unwrap();
        // Capacity 1 and never drained: the NoReferenceData send fills it
        let (tx, _rx) = mpsc::channel(1);
        let kiosk = RecognitionLoop::spawn(engine, store, settings(), tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(5), kiosk.stop())
            .await
            .expect("stop should not hang");
    }
}
