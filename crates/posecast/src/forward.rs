//! Re-transmission of the authoritative sample stream.

use crate::cascade::{PoseConsumer, SourceTier};
use crate::relay::RelayHandle;
use posecast_common::PoseSample;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

/// A sample as handed downstream, with the tier it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedSample {
    /// Source tier.
    pub source: SourceTier,
    /// The sample.
    #[serde(flatten)]
    pub sample: PoseSample,
}

/// Cascade consumer that sends samples out through the relay link, at most
/// once per `sample_interval`, and mirrors every sample onto an optional
/// local broadcast tap.
#[derive(Debug)]
pub struct RelayForwarder {
    relay: RelayHandle,
    interval: Duration,
    last_sent: Option<Instant>,
    tap: Option<broadcast::Sender<ForwardedSample>>,
}

impl RelayForwarder {
    /// Forward through `relay`, throttled to one sample per `interval`.
    #[must_use]
    pub fn new(relay: RelayHandle, interval: Duration) -> Self {
        Self {
            relay,
            interval,
            last_sent: None,
            tap: None,
        }
    }

    /// Also publish every sample, unthrottled, on `tap`.
    #[must_use]
    pub fn with_tap(mut self, tap: broadcast::Sender<ForwardedSample>) -> Self {
        self.tap = Some(tap);
        self
    }

    fn due(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }
}

impl PoseConsumer for RelayForwarder {
    fn on_sample(&mut self, sample: &PoseSample, tier: SourceTier) {
        if let Some(tap) = &self.tap {
            // No subscribers is the common case.
            let _ = tap.send(ForwardedSample {
                source: tier,
                sample: sample.clone(),
            });
        }

        let now = Instant::now();
        if !self.due(now) {
            return;
        }
        if self.relay.send_pose_sample(sample) {
            self.last_sent = Some(now);
        } else {
            trace!(tier = %tier, "relay not connected; sample not forwarded");
        }
    }
}
