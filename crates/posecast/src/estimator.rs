//! Frame → pose estimation seam and detection pacing.

use posecast_common::landmarks::Landmarks;
use posecast_common::PoseSample;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One decoded video frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFrame {
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// Capture time, unix milliseconds.
    pub timestamp_ms: u64,
    /// Encoded frame payload.
    pub data: Vec<u8>,
}

/// Per-frame estimation failures.
#[derive(Debug, Error)]
pub enum EstimatorError {
    /// The model is not loaded.
    #[error("pose model unavailable")]
    Unavailable,
    /// The model rejected this frame.
    #[error("frame processing failed: {0}")]
    Frame(String),
}

/// An external pose model.
pub trait PoseEstimator: Send {
    /// Run the model on `frame`. `Ok(None)` means nobody was in view.
    ///
    /// # Errors
    ///
    /// Any [`EstimatorError`]; callers skip the frame.
    fn estimate(&mut self, frame: &VideoFrame) -> Result<Option<Landmarks>, EstimatorError>;
}

impl<F> PoseEstimator for F
where
    F: FnMut(&VideoFrame) -> Result<Option<Landmarks>, EstimatorError> + Send,
{
    fn estimate(&mut self, frame: &VideoFrame) -> Result<Option<Landmarks>, EstimatorError> {
        self(frame)
    }
}

/// Reads landmarks an upstream model already serialized as JSON into the
/// frame payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodedLandmarks;

impl PoseEstimator for EncodedLandmarks {
    fn estimate(&mut self, frame: &VideoFrame) -> Result<Option<Landmarks>, EstimatorError> {
        if frame.data.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&frame.data)
            .map(Some)
            .map_err(|e| EstimatorError::Frame(e.to_string()))
    }
}

/// Runs an estimator no more often than once per `min_interval`, converting
/// its landmarks into samples.
pub struct EstimatorPacer {
    estimator: Box<dyn PoseEstimator>,
    min_interval: Duration,
    last_run: Option<Instant>,
}

impl EstimatorPacer {
    /// Pace `estimator` to one invocation per `min_interval`.
    #[must_use]
    pub fn new(estimator: Box<dyn PoseEstimator>, min_interval: Duration) -> Self {
        Self {
            estimator,
            min_interval,
            last_run: None,
        }
    }

    /// Offer a frame. Frames arriving inside the pacing window are skipped
    /// without touching the model; model errors are logged and the frame is
    /// skipped.
    pub fn process(&mut self, frame: &VideoFrame) -> Option<PoseSample> {
        let now = Instant::now();
        if let Some(last) = self.last_run {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }
        self.last_run = Some(now);

        match self.estimator.estimate(frame) {
            Ok(Some(landmarks)) => {
                let sample = landmarks.to_sample(frame.timestamp_ms);
                if sample.is_none() {
                    debug!("too few landmarks in frame; skipped");
                }
                sample
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "pose estimation failed; frame skipped");
                None
            }
        }
    }

    /// Process frames until the source closes, handing each sample to `emit`.
    pub async fn pump(
        &mut self,
        frames: &mut mpsc::Receiver<VideoFrame>,
        mut emit: impl FnMut(PoseSample),
    ) {
        while let Some(frame) = frames.recv().await {
            if let Some(sample) = self.process(&frame) {
                emit(sample);
            }
        }
    }
}

impl std::fmt::Debug for EstimatorPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstimatorPacer")
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}
