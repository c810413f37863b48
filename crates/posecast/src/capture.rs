//! Local camera capture seam.

use crate::estimator::{PoseEstimator, VideoFrame};
use thiserror::Error;
use tokio::sync::mpsc;

/// Why local capture could not start.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The user or the platform refused camera access.
    #[error("camera permission denied")]
    PermissionDenied,
    /// Another process holds the camera.
    #[error("camera device busy")]
    DeviceBusy,
    /// The local pose model could not be loaded.
    #[error("local pose estimator unavailable")]
    EstimatorUnavailable,
    /// No capture device is configured on this host.
    #[error("no capture device")]
    NoDevice,
}

/// A running camera with its pose model.
pub struct CaptureFeed {
    /// Frames in capture order; closes when the camera stops.
    pub frames: mpsc::Receiver<VideoFrame>,
    /// Model run on each (paced) frame.
    pub estimator: Box<dyn PoseEstimator>,
}

impl std::fmt::Debug for CaptureFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureFeed").finish_non_exhaustive()
    }
}

/// A local camera plus pose model.
pub trait CaptureDevice: Send + 'static {
    /// Start capturing.
    ///
    /// # Errors
    ///
    /// Any [`CaptureError`]; the caller falls back to synthetic samples.
    fn open(&mut self) -> Result<CaptureFeed, CaptureError>;
}

/// Host without a camera.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapture;

impl CaptureDevice for NoCapture {
    fn open(&mut self) -> Result<CaptureFeed, CaptureError> {
        Err(CaptureError::NoDevice)
    }
}
