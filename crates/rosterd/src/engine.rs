use roster_core::{AnalyzerError, Detection, FaceAnalyzer};
use roster_hw::{CameraError, Frame, FrameSource};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Single-face capture for enrollment.
pub struct PoseCapture {
    pub frame: Frame,
    pub detection: Option<Detection>,
}

/// Multi-face capture for the kiosk loop.
pub struct AnalyzedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    DetectSingle {
        reply: oneshot::Sender<Result<PoseCapture, EngineError>>,
    },
    DetectAll {
        reply: oneshot::Sender<Result<AnalyzedFrame, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    source: Arc<str>,
}

impl EngineHandle {
    /// Capture one frame and find its most confident face.
    pub async fn detect_single(&self) -> Result<PoseCapture, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::DetectSingle { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture one frame and describe every face in it.
    pub async fn detect_all(&self) -> Result<AnalyzedFrame, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::DetectAll { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Description of the frame source, for status output.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the frame source and the analyzer; ONNX sessions and
/// V4L2 handles never cross into async code. Warmup frames are discarded
/// before the first request is served.
pub fn spawn_engine<S, A>(
    mut source: S,
    mut analyzer: A,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + 'static,
    A: FaceAnalyzer + 'static,
{
    let description: Arc<str> = source.describe().into();

    // Discard warmup frames for camera AGC/AE stabilization
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = source.capture();
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::DetectSingle { reply } => {
                        let _ = reply.send(run_detect_single(&mut source, &mut analyzer));
                    }
                    EngineRequest::DetectAll { reply } => {
                        let _ = reply.send(run_detect_all(&mut source, &mut analyzer));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

    tracing::info!(source = %description, "engine ready");
    Ok(EngineHandle {
        tx,
        source: description,
    })
}

fn run_detect_single(
    source: &mut impl FrameSource,
    analyzer: &mut impl FaceAnalyzer,
) -> Result<PoseCapture, EngineError> {
    let frame = source.capture()?;
    let detection = analyzer.detect_single(&frame.image)?;
    tracing::debug!(
        seq = frame.sequence,
        face = detection.is_some(),
        "single-face capture"
    );
    Ok(PoseCapture { frame, detection })
}

fn run_detect_all(
    source: &mut impl FrameSource,
    analyzer: &mut impl FaceAnalyzer,
) -> Result<AnalyzedFrame, EngineError> {
    let frame = source.capture()?;
    if frame.is_dark {
        tracing::debug!(seq = frame.sequence, "skipping dark frame");
        return Ok(AnalyzedFrame {
            frame,
            detections: Vec::new(),
        });
    }
    let detections = analyzer.detect_all(&frame.image)?;
    tracing::trace!(seq = frame.sequence, faces = detections.len(), "multi-face capture");
    Ok(AnalyzedFrame { frame, detections })
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[tokio::test]
    async fn test_detect_single_and_all() {
        let analyzer = ScriptedAnalyzer::with(vec![
            centered_face(unit(0, 1.0)),
            centered_face(unit(1, 1.0)),
        ]);
        let engine = spawn_engine(GreyFrames::new(), analyzer, 2).unwrap();
        assert_eq!(engine.source(), "grey test frames");

        let single = engine.detect_single().await.unwrap();
        assert_eq!(single.frame.width(), FRAME_W);
        assert_eq!(single.detection.unwrap().descriptor, unit(0, 1.0));

        let all = engine.detect_all().await.unwrap();
        assert_eq!(all.detections.len(), 2);
        // Two warmup frames were discarded before the two captures
        assert_eq!(all.frame.sequence, 4);
    }

    #[tokio::test]
    async fn test_no_face() {
        let engine = spawn_engine(GreyFrames::new(), ScriptedAnalyzer::default(), 0).unwrap();
        assert!(engine.detect_single().await.unwrap().detection.is_none());
        assert!(engine.detect_all().await.unwrap().detections.is_empty());
    }
}
