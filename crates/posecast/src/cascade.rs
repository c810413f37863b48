//! Source arbitration between peer, local capture and synthetic samples.
//!
//! The cascade always starts on the synthetic generator. The first valid
//! sample from a higher tier promotes that tier for good: lower tiers are
//! stopped and their samples dropped until [`CascadeHandle::reset`]. This
//! keeps a sparse live source from flapping back and forth with the
//! synthetic baseline.

use crate::capture::CaptureDevice;
use crate::config::AppConfig;
use crate::estimator::EstimatorPacer;
use crate::synthetic::synthetic_at;
use posecast_common::types::unix_millis;
use posecast_common::PoseSample;
use serde::Serialize;
use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const QUEUE_DEPTH: usize = 256;

/// Sample sources, lowest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Generated baseline.
    Synthetic,
    /// Local camera plus estimator.
    LocalCaptureLive,
    /// Remote side-view peer.
    PeerLive,
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Synthetic => "synthetic",
            Self::LocalCaptureLive => "local_capture",
            Self::PeerLive => "peer",
        })
    }
}

/// Downstream receiver of the authoritative sample stream.
pub trait PoseConsumer: Send + 'static {
    /// Called once per accepted sample, in arrival order.
    fn on_sample(&mut self, sample: &PoseSample, tier: SourceTier);
}

impl<F> PoseConsumer for F
where
    F: FnMut(&PoseSample, SourceTier) + Send + 'static,
{
    fn on_sample(&mut self, sample: &PoseSample, tier: SourceTier) {
        self(sample, tier);
    }
}

/// Cascade timing and capture policy.
#[derive(Debug, Clone)]
pub struct CascadeSettings {
    /// Synthetic emission period.
    pub synthetic_interval: Duration,
    /// Minimum gap between local estimator runs.
    pub detection_interval: Duration,
    /// Try the local camera at all.
    pub local_capture: bool,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            synthetic_interval: Duration::from_millis(100),
            detection_interval: Duration::from_millis(100),
            local_capture: true,
        }
    }
}

impl From<&AppConfig> for CascadeSettings {
    fn from(app: &AppConfig) -> Self {
        Self {
            synthetic_interval: Duration::from_millis(app.capture.synthetic_interval_ms.max(1)),
            detection_interval: Duration::from_millis(app.capture.detection_interval_ms),
            local_capture: app.capture.local,
        }
    }
}

/// Published on every arbitration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeStatus {
    /// Authoritative tier.
    pub active: SourceTier,
    /// Synthetic generator is ticking.
    pub synthetic_running: bool,
    /// Local capture task is alive.
    pub capture_running: bool,
    /// The peer reported it is unavailable.
    pub peer_unavailable: bool,
}

#[derive(Debug)]
enum CascadeCommand {
    Sample(PoseSample, SourceTier),
    Reset(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Source lifecycle signals. Carried on an unbounded channel so a full
/// sample queue can never swallow them.
#[derive(Debug)]
enum Control {
    Unavailable(SourceTier),
    /// The capture task with this generation ran out of frames.
    CaptureEnded(u64),
}

/// Cheap, cloneable entry point for sample producers.
#[derive(Debug, Clone)]
pub struct CascadeSender {
    tx: mpsc::Sender<CascadeCommand>,
    control: mpsc::UnboundedSender<Control>,
}

impl CascadeSender {
    /// Offer a sample from `tier`. Returns `false` if the cascade is gone or
    /// its queue is full; the sample is dropped either way.
    pub fn offer(&self, sample: PoseSample, tier: SourceTier) -> bool {
        self.tx
            .try_send(CascadeCommand::Sample(sample, tier))
            .is_ok()
    }

    /// Tell the cascade that `tier` will not produce samples. Never dropped
    /// for lack of queue space; returns `false` only if the cascade is gone.
    pub fn report_unavailable(&self, tier: SourceTier) -> bool {
        self.control.send(Control::Unavailable(tier)).is_ok()
    }
}

async fn synthetic_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// The arbitration actor.
pub struct FallbackCascade<P, D> {
    settings: CascadeSettings,
    consumer: P,
    capture: D,
    active: SourceTier,
    synthetic: Option<Interval>,
    capture_task: Option<JoinHandle<()>>,
    capture_generation: u64,
    peer_unavailable: bool,
    self_tx: mpsc::WeakSender<CascadeCommand>,
    self_control: mpsc::WeakUnboundedSender<Control>,
    status_tx: watch::Sender<CascadeStatus>,
}

impl<P: PoseConsumer, D: CaptureDevice> FallbackCascade<P, D> {
    /// Activate the cascade: synthetic samples start flowing immediately and
    /// local capture is attempted while the peer is pending.
    pub fn spawn(settings: CascadeSettings, consumer: P, capture: D) -> CascadeHandle {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (control, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CascadeStatus {
            active: SourceTier::Synthetic,
            synthetic_running: false,
            capture_running: false,
            peer_unavailable: false,
        });
        let mut cascade = Self {
            settings,
            consumer,
            capture,
            active: SourceTier::Synthetic,
            synthetic: None,
            capture_task: None,
            capture_generation: 0,
            peer_unavailable: false,
            self_tx: tx.downgrade(),
            self_control: control.downgrade(),
            status_tx,
        };
        cascade.arm();
        tokio::spawn(cascade.run(rx, control_rx));
        CascadeHandle {
            tx,
            control,
            status_rx,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<CascadeCommand>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            tokio::select! {
                Some(signal) = control_rx.recv() => match signal {
                    Control::Unavailable(tier) => self.unavailable(tier),
                    Control::CaptureEnded(generation) => self.capture_ended(generation),
                },
                cmd = rx.recv() => match cmd {
                    Some(CascadeCommand::Sample(sample, tier)) => self.accept(&sample, tier),
                    Some(CascadeCommand::Reset(ack)) => {
                        self.disarm();
                        self.arm();
                        let _ = ack.send(());
                    }
                    Some(CascadeCommand::Shutdown(ack)) => {
                        self.disarm();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.disarm();
                        break;
                    }
                },
                () = synthetic_tick(&mut self.synthetic) => {
                    if self.active == SourceTier::Synthetic {
                        let sample = synthetic_at(unix_millis());
                        self.consumer.on_sample(&sample, SourceTier::Synthetic);
                    }
                }
            }
        }
        debug!("fallback cascade stopped");
    }

    /// Start from the synthetic baseline with every tier re-armed.
    fn arm(&mut self) {
        self.active = SourceTier::Synthetic;
        self.peer_unavailable = false;
        let every = self.settings.synthetic_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.synthetic = Some(interval);
        info!(
            interval_ms = u64::try_from(every.as_millis()).unwrap_or(u64::MAX),
            "synthetic pose generator started"
        );
        self.start_capture();
        self.publish();
    }

    fn disarm(&mut self) {
        if self.synthetic.take().is_some() {
            debug!("synthetic pose generator stopped");
        }
        self.stop_capture();
        self.publish();
    }

    fn accept(&mut self, sample: &PoseSample, tier: SourceTier) {
        if let Err(e) = sample.validate() {
            debug!(tier = %tier, error = %e, "dropping invalid sample");
            return;
        }
        if tier < self.active {
            return;
        }
        if tier > self.active {
            self.promote(tier);
        }
        self.consumer.on_sample(sample, tier);
    }

    fn promote(&mut self, tier: SourceTier) {
        info!(from = %self.active, to = %tier, "promoting pose source");
        self.active = tier;
        self.synthetic = None;
        if tier == SourceTier::PeerLive {
            self.stop_capture();
        }
        self.publish();
    }

    fn unavailable(&mut self, tier: SourceTier) {
        match tier {
            SourceTier::PeerLive => {
                self.peer_unavailable = true;
                if self.active < SourceTier::PeerLive {
                    info!("peer unavailable; falling back to local sources");
                    self.start_capture();
                } else {
                    warn!(
                        "peer stream ended after promotion; lower tiers stay stopped until reset"
                    );
                }
            }
            SourceTier::LocalCaptureLive => self.stop_capture(),
            SourceTier::Synthetic => {}
        }
        self.publish();
    }

    fn capture_ended(&mut self, generation: u64) {
        if generation != self.capture_generation {
            debug!(generation, "ignoring end of a replaced capture task");
            return;
        }
        if self.capture_task.take().is_some() {
            info!("local capture ended");
            self.publish();
        }
    }

    fn start_capture(&mut self) {
        let running = self
            .capture_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if running || !self.settings.local_capture || self.active == SourceTier::PeerLive {
            return;
        }
        let (Some(tx), Some(control)) = (self.self_tx.upgrade(), self.self_control.upgrade())
        else {
            return;
        };
        let feed = match self.capture.open() {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, "local capture unavailable; staying on synthetic");
                return;
            }
        };
        self.capture_generation += 1;
        let generation = self.capture_generation;
        info!(generation, "local capture started");
        let sender = CascadeSender { tx, control };
        let mut pacer = EstimatorPacer::new(feed.estimator, self.settings.detection_interval);
        let mut frames = feed.frames;
        self.capture_task = Some(tokio::spawn(async move {
            pacer
                .pump(&mut frames, |sample| {
                    sender.offer(sample, SourceTier::LocalCaptureLive);
                })
                .await;
            let _ = sender.control.send(Control::CaptureEnded(generation));
        }));
    }

    fn stop_capture(&mut self) {
        if let Some(task) = self.capture_task.take() {
            task.abort();
            info!("local capture stopped");
        }
    }

    fn publish(&self) {
        let next = CascadeStatus {
            active: self.active,
            synthetic_running: self.synthetic.is_some(),
            capture_running: self.capture_task.is_some(),
            peer_unavailable: self.peer_unavailable,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Control handle for a running [`FallbackCascade`].
#[derive(Debug, Clone)]
pub struct CascadeHandle {
    tx: mpsc::Sender<CascadeCommand>,
    control: mpsc::UnboundedSender<Control>,
    status_rx: watch::Receiver<CascadeStatus>,
}

impl CascadeHandle {
    /// Sender for sample producers.
    #[must_use]
    pub fn sender(&self) -> CascadeSender {
        CascadeSender {
            tx: self.tx.clone(),
            control: self.control.clone(),
        }
    }

    /// See [`CascadeSender::report_unavailable`].
    pub fn report_unavailable(&self, tier: SourceTier) -> bool {
        self.sender().report_unavailable(tier)
    }

    /// Stop every tier and re-arm from the synthetic baseline. Returns once
    /// the old timers and capture are gone.
    pub async fn reset(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(CascadeCommand::Reset(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop the cascade. Returns once the synthetic timer and capture are
    /// gone; later calls return immediately.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(CascadeCommand::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Watch arbitration changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<CascadeStatus> {
        self.status_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, CaptureFeed, NoCapture};
    use crate::estimator::{EncodedLandmarks, VideoFrame};
    use posecast_common::landmarks::{Landmark, Landmarks};
    use posecast_common::{Keypoint, KeypointName, Position};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<SourceTier>>>;

    fn recorder() -> (Log, impl PoseConsumer) {
        let log: Log = Arc::default();
        let sink = Arc::clone(&log);
        (log, move |_: &PoseSample, tier: SourceTier| {
            sink.lock().unwrap().push(tier)
        })
    }

    fn count(log: &Log, tier: SourceTier) -> usize {
        log.lock().unwrap().iter().filter(|t| **t == tier).count()
    }

    fn live_sample(score: f64) -> PoseSample {
        PoseSample {
            keypoints: vec![Keypoint::new(
                KeypointName::Head,
                Position::new(0.5, 0.2, 0.0),
                score,
            )],
            timestamp_ms: 1,
            confidence: 0.9,
            is_3d: false,
        }
    }

    fn without_capture() -> CascadeSettings {
        CascadeSettings {
            local_capture: false,
            ..CascadeSettings::default()
        }
    }

    async fn wait_active(handle: &CascadeHandle, tier: SourceTier) {
        handle.status().wait_for(|s| s.active == tier).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_runs_every_interval_until_promotion() {
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(without_capture(), consumer, NoCapture);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(count(&log, SourceTier::Synthetic), 10);

        assert!(handle.sender().offer(live_sample(0.9), SourceTier::PeerLive));
        wait_active(&handle, SourceTier::PeerLive).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 11);
        assert_eq!(log.last(), Some(&SourceTier::PeerLive));
        assert!(!handle.status().borrow().synthetic_running);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_samples_are_dropped_and_do_not_promote() {
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(without_capture(), consumer, NoCapture);
        let sender = handle.sender();

        let mut empty = live_sample(0.9);
        empty.keypoints.clear();
        sender.offer(empty, SourceTier::PeerLive);
        sender.offer(live_sample(1.5), SourceTier::PeerLive);
        sender.offer(live_sample(-0.1), SourceTier::LocalCaptureLive);
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(handle.status().borrow().active, SourceTier::Synthetic);
        assert_eq!(count(&log, SourceTier::PeerLive), 0);
        assert_eq!(count(&log, SourceTier::LocalCaptureLive), 0);
        assert_eq!(count(&log, SourceTier::Synthetic), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_promotion_is_one_way_until_reset() {
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(without_capture(), consumer, NoCapture);
        let sender = handle.sender();

        sender.offer(live_sample(0.9), SourceTier::PeerLive);
        sender.offer(live_sample(0.9), SourceTier::LocalCaptureLive);
        sender.offer(live_sample(0.9), SourceTier::Synthetic);
        sender.report_unavailable(SourceTier::PeerLive);
        handle
            .status()
            .wait_for(|s| s.peer_unavailable)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*log.lock().unwrap(), vec![SourceTier::PeerLive]);

        handle.reset().await;
        assert_eq!(handle.status().borrow().active, SourceTier::Synthetic);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count(&log, SourceTier::Synthetic), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_stops_ticks() {
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(without_capture(), consumer, NoCapture);
        tokio::time::sleep(Duration::from_millis(250)).await;

        handle.shutdown().await;
        handle.shutdown().await;
        let seen = log.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().unwrap().len(), seen);
        assert!(!handle.sender().offer(live_sample(0.9), SourceTier::PeerLive));
    }

    /// Hands out scripted open results; the test keeps the frame senders.
    struct FakeCamera {
        results: VecDeque<Result<CaptureFeed, CaptureError>>,
        opens: Arc<Mutex<usize>>,
    }

    impl CaptureDevice for FakeCamera {
        fn open(&mut self) -> Result<CaptureFeed, CaptureError> {
            *self.opens.lock().unwrap() += 1;
            self.results
                .pop_front()
                .unwrap_or(Err(CaptureError::DeviceBusy))
        }
    }

    fn camera_feed() -> (mpsc::Sender<VideoFrame>, CaptureFeed) {
        let (tx, rx) = mpsc::channel(16);
        (
            tx,
            CaptureFeed {
                frames: rx,
                estimator: Box::new(EncodedLandmarks),
            },
        )
    }

    fn body_frame() -> VideoFrame {
        let landmarks = Landmarks {
            image: vec![
                Landmark {
                    x: 0.4,
                    y: 0.4,
                    z: 0.0,
                    visibility: Some(0.9),
                };
                33
            ],
            world: None,
        };
        VideoFrame {
            data: serde_json::to_vec(&landmarks).unwrap(),
            ..VideoFrame::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn denied_camera_is_retried_when_peer_is_unavailable() {
        let (frames, feed) = camera_feed();
        let opens = Arc::new(Mutex::new(0));
        let camera = FakeCamera {
            results: VecDeque::from([Err(CaptureError::PermissionDenied), Ok(feed)]),
            opens: Arc::clone(&opens),
        };
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(CascadeSettings::default(), consumer, camera);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*opens.lock().unwrap(), 1);
        assert_eq!(count(&log, SourceTier::Synthetic), 1);

        handle.report_unavailable(SourceTier::PeerLive);
        handle
            .status()
            .wait_for(|s| s.capture_running)
            .await
            .unwrap();
        assert_eq!(*opens.lock().unwrap(), 2);

        frames.send(body_frame()).await.unwrap();
        wait_active(&handle, SourceTier::LocalCaptureLive).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count(&log, SourceTier::Synthetic), 1);
        assert_eq!(count(&log, SourceTier::LocalCaptureLive), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_promotion_stops_local_capture() {
        let (frames, feed) = camera_feed();
        let camera = FakeCamera {
            results: VecDeque::from([Ok(feed)]),
            opens: Arc::default(),
        };
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(CascadeSettings::default(), consumer, camera);

        frames.send(body_frame()).await.unwrap();
        wait_active(&handle, SourceTier::LocalCaptureLive).await;

        handle.sender().offer(live_sample(0.8), SourceTier::PeerLive);
        wait_active(&handle, SourceTier::PeerLive).await;
        assert!(!handle.status().borrow().capture_running);
        frames.closed().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![SourceTier::LocalCaptureLive, SourceTier::PeerLive]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_report_survives_a_full_sample_queue() {
        let (_log, consumer) = recorder();
        let handle = FallbackCascade::spawn(without_capture(), consumer, NoCapture);
        let sender = handle.sender();

        let queued = (0..QUEUE_DEPTH + 8)
            .filter(|_| sender.offer(live_sample(0.9), SourceTier::LocalCaptureLive))
            .count();
        assert_eq!(queued, QUEUE_DEPTH);

        assert!(sender.report_unavailable(SourceTier::PeerLive));
        handle
            .status()
            .wait_for(|s| s.peer_unavailable)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_end_of_replaced_capture_keeps_the_new_one_tracked() {
        let (frames1, feed1) = camera_feed();
        let (frames2, feed2) = camera_feed();
        let opens = Arc::new(Mutex::new(0));
        let camera = FakeCamera {
            results: VecDeque::from([Ok(feed1), Ok(feed2)]),
            opens: Arc::clone(&opens),
        };
        let (log, consumer) = recorder();
        let handle = FallbackCascade::spawn(CascadeSettings::default(), consumer, camera);
        assert!(handle.status().borrow().capture_running);

        drop(frames1);
        handle.reset().await;
        assert_eq!(*opens.lock().unwrap(), 2);

        // An end report from the first capture arriving after the re-arm.
        assert!(handle.sender().control.send(Control::CaptureEnded(1)).is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.status().borrow().capture_running);

        handle.sender().offer(live_sample(0.8), SourceTier::PeerLive);
        wait_active(&handle, SourceTier::PeerLive).await;
        assert!(!handle.status().borrow().capture_running);
        tokio::time::timeout(Duration::from_secs(1), frames2.closed())
            .await
            .expect("second capture left running after promotion");
        assert_eq!(*opens.lock().unwrap(), 2);
        assert_eq!(log.lock().unwrap().last(), Some(&SourceTier::PeerLive));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_running_out_of_frames_is_reported() {
        let (frames, feed) = camera_feed();
        let camera = FakeCamera {
            results: VecDeque::from([Ok(feed)]),
            opens: Arc::default(),
        };
        let (_log, consumer) = recorder();
        let handle = FallbackCascade::spawn(CascadeSettings::default(), consumer, camera);
        assert!(handle.status().borrow().capture_running);

        drop(frames);
        handle
            .status()
            .wait_for(|s| !s.capture_running)
            .await
            .unwrap();
        assert_eq!(handle.status().borrow().active, SourceTier::Synthetic);
    }
}
