//! Peer acquisition: a side-view device paired through the signaling broker.
//!
//! The device either opens a data channel carrying finished pose samples or
//! calls with video that is run through a local estimator. Both paths may be
//! live at once; every sample reaches the cascade as [`SourceTier::PeerLive`].

use crate::broker::{
    CloseHandle, DataChannel, MediaStream, PeerError, SignalingBroker, SignalingEvent,
    SignalingSession,
};
use crate::cascade::{CascadeSender, SourceTier};
use crate::config::{default_ice_servers, AppConfig, IceServer};
use crate::estimator::{EstimatorPacer, PoseEstimator};
use crate::ids::peer_session_id;
use crate::observer::{Observers, Subscription};
use posecast_common::PoseSample;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Not started.
    Idle,
    /// Waiting for the broker to confirm the session.
    SignalingOpen,
    /// Session published; no device linked.
    AwaitingPeer,
    /// At least one data channel, no media.
    DataLinked,
    /// At least one answered call.
    MediaLinked,
    /// Torn down on request.
    Closed,
    /// Signaling failed or timed out.
    Error,
}

impl PeerState {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SignalingOpen => "signaling_open",
            Self::AwaitingPeer => "awaiting_peer",
            Self::DataLinked => "data_linked",
            Self::MediaLinked => "media_linked",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }

    fn is_open(self) -> bool {
        matches!(self, Self::AwaitingPeer | Self::DataLinked | Self::MediaLinked)
    }
}

/// Inbound channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Data channel with finished samples.
    Data,
    /// Answered video call.
    Media,
}

/// Inputs to [`PeerMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Begin negotiating.
    Start,
    /// The broker confirmed the session.
    SessionOpened,
    /// A device opened a data channel.
    DataConnected,
    /// A device call was answered.
    MediaAnswered,
    /// A data channel or call ended.
    ChannelClosed(ChannelKind),
    /// Broker error, broker disconnect, or open timeout.
    SignalingError,
    /// Operator teardown.
    Close,
}

/// Side effects requested by [`PeerMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    /// Open a signaling session under a fresh id.
    OpenSignaling,
    /// Start the open timeout.
    ArmOpenTimeout,
    /// Cancel the open timeout.
    DisarmOpenTimeout,
    /// Announce the session id for pairing.
    PublishSession,
    /// Keep the offered channel.
    AcceptChannel(ChannelKind),
    /// Refuse the offered channel.
    RejectChannel(ChannelKind),
    /// Tell the cascade no peer samples are coming.
    ReportUnavailable,
    /// Release media, then data channels, then the session.
    Teardown,
}

/// Pure peer negotiation state machine.
#[derive(Debug, Clone)]
pub struct PeerMachine {
    state: PeerState,
    data: usize,
    media: usize,
}

impl Default for PeerMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerMachine {
    /// Machine in [`PeerState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PeerState::Idle,
            data: 0,
            media: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Linked data channels and answered calls.
    #[must_use]
    pub fn channels(&self) -> (usize, usize) {
        (self.data, self.media)
    }

    fn linked_state(&self) -> PeerState {
        if self.media > 0 {
            PeerState::MediaLinked
        } else if self.data > 0 {
            PeerState::DataLinked
        } else {
            PeerState::AwaitingPeer
        }
    }

    /// Apply `event` and return the actions to perform, in order.
    pub fn handle(&mut self, event: PeerEvent) -> Vec<PeerAction> {
        use PeerAction as A;
        match (self.state, event) {
            (PeerState::Idle | PeerState::Closed | PeerState::Error, PeerEvent::Start) => {
                self.state = PeerState::SignalingOpen;
                self.data = 0;
                self.media = 0;
                vec![A::OpenSignaling, A::ArmOpenTimeout]
            }
            (PeerState::SignalingOpen, PeerEvent::SessionOpened) => {
                self.state = PeerState::AwaitingPeer;
                vec![A::DisarmOpenTimeout, A::PublishSession]
            }
            (state, PeerEvent::DataConnected) if state.is_open() => {
                self.data += 1;
                self.state = self.linked_state();
                vec![A::AcceptChannel(ChannelKind::Data)]
            }
            (state, PeerEvent::MediaAnswered) if state.is_open() => {
                self.media += 1;
                self.state = self.linked_state();
                vec![A::AcceptChannel(ChannelKind::Media)]
            }
            (_, PeerEvent::DataConnected) => vec![A::RejectChannel(ChannelKind::Data)],
            (_, PeerEvent::MediaAnswered) => vec![A::RejectChannel(ChannelKind::Media)],
            (state, PeerEvent::ChannelClosed(kind)) if state.is_open() => {
                match kind {
                    ChannelKind::Data => self.data = self.data.saturating_sub(1),
                    ChannelKind::Media => self.media = self.media.saturating_sub(1),
                }
                self.state = self.linked_state();
                vec![]
            }
            (PeerState::SignalingOpen, PeerEvent::SignalingError) => {
                self.state = PeerState::Error;
                vec![A::DisarmOpenTimeout, A::Teardown, A::ReportUnavailable]
            }
            (state, PeerEvent::SignalingError) if state.is_open() => {
                self.state = PeerState::Error;
                self.data = 0;
                self.media = 0;
                vec![A::Teardown, A::ReportUnavailable]
            }
            (PeerState::Closed, PeerEvent::Close) => vec![],
            (_, PeerEvent::Close) => {
                self.state = PeerState::Closed;
                self.data = 0;
                self.media = 0;
                vec![A::DisarmOpenTimeout, A::Teardown]
            }
            _ => vec![],
        }
    }
}

/// Parse one data-channel payload. Accepts a sample object or a JSON string
/// holding one.
///
/// # Errors
///
/// The payload is not a pose sample.
pub fn parse_peer_sample(text: &str) -> Result<PoseSample, serde_json::Error> {
    match serde_json::from_str::<Value>(text)? {
        Value::String(inner) => serde_json::from_str(&inner),
        value => serde_json::from_value(value),
    }
}

/// Builds one estimator per answered call.
pub trait EstimatorFactory: Send + 'static {
    /// A fresh estimator.
    fn create(&mut self) -> Box<dyn PoseEstimator>;
}

impl<F> EstimatorFactory for F
where
    F: FnMut() -> Box<dyn PoseEstimator> + Send + 'static,
{
    fn create(&mut self) -> Box<dyn PoseEstimator> {
        self()
    }
}

/// Peer acquisition timing and broker parameters.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Whether to negotiate at all.
    pub enabled: bool,
    /// Time allowed for the broker to confirm the session.
    pub open_timeout: Duration,
    /// Minimum spacing between estimator runs on call video.
    pub detection_interval: Duration,
    /// NAT traversal servers handed to the broker.
    pub ice_servers: Vec<IceServer>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            open_timeout: Duration::from_secs(10),
            detection_interval: Duration::from_millis(100),
            ice_servers: default_ice_servers(),
        }
    }
}

impl From<&AppConfig> for PeerSettings {
    fn from(app: &AppConfig) -> Self {
        Self {
            enabled: app.signaling.enabled,
            open_timeout: Duration::from_millis(app.signaling.open_timeout_ms),
            detection_interval: Duration::from_millis(app.capture.detection_interval_ms),
            ice_servers: app.signaling.ice_servers.clone(),
        }
    }
}

/// Snapshot published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    /// Negotiation state.
    pub state: PeerState,
    /// Id the side device pairs with, once the broker confirmed it.
    pub session_id: Option<String>,
    /// Linked data channels.
    pub data_channels: usize,
    /// Answered calls.
    pub media_streams: usize,
}

#[derive(Debug)]
enum PeerCommand {
    Close(oneshot::Sender<()>),
    ChannelEnded(ChannelKind, u64),
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<SignalingSession, PeerError>> + Send>>;

struct Attached {
    closer: CloseHandle,
    task: JoinHandle<()>,
}

impl Attached {
    fn release(mut self) {
        self.closer.close();
        self.task.abort();
    }
}

async fn next_open(slot: &mut Option<OpenFuture>) -> Result<SignalingSession, PeerError> {
    match slot {
        Some(fut) => {
            let result = fut.as_mut().await;
            *slot = None;
            result
        }
        None => pending().await,
    }
}

async fn next_event(session: &mut Option<SignalingSession>) -> Option<SignalingEvent> {
    match session {
        Some(session) => session.events.recv().await,
        None => pending().await,
    }
}

async fn open_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

/// The acquisition actor.
pub struct PeerAcquisition<B, E> {
    broker: Arc<B>,
    estimators: E,
    settings: PeerSettings,
    cascade: CascadeSender,
    machine: PeerMachine,
    session_id: String,
    published: Option<String>,
    opening: Option<OpenFuture>,
    session: Option<SignalingSession>,
    deadline: Option<Pin<Box<Sleep>>>,
    data: HashMap<u64, Attached>,
    media: HashMap<u64, Attached>,
    next_channel: u64,
    self_tx: mpsc::WeakSender<PeerCommand>,
    status_tx: watch::Sender<PeerStatus>,
    observers: Observers<PeerStatus>,
}

impl<B: SignalingBroker, E: EstimatorFactory> PeerAcquisition<B, E> {
    /// Start negotiating right away. Samples go to `cascade`; failures are
    /// reported there as [`SourceTier::PeerLive`] being unavailable.
    pub fn spawn(
        settings: PeerSettings,
        broker: B,
        estimators: E,
        cascade: CascadeSender,
    ) -> PeerHandle {
        let (tx, rx) = mpsc::channel(32);
        let initial = PeerStatus {
            state: PeerState::Idle,
            session_id: None,
            data_channels: 0,
            media_streams: 0,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let observers = Observers::new();
        let mut actor = Self {
            broker: Arc::new(broker),
            estimators,
            settings,
            cascade,
            machine: PeerMachine::new(),
            session_id: String::new(),
            published: None,
            opening: None,
            session: None,
            deadline: None,
            data: HashMap::new(),
            media: HashMap::new(),
            next_channel: 0,
            self_tx: tx.downgrade(),
            status_tx,
            observers: observers.clone(),
        };
        if actor.settings.enabled {
            actor.apply(PeerEvent::Start);
        } else {
            info!("peer acquisition disabled");
            actor.cascade.report_unavailable(SourceTier::PeerLive);
        }
        tokio::spawn(actor.run(rx));
        PeerHandle {
            tx,
            status_rx,
            observers,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PeerCommand>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(PeerCommand::Close(ack)) => {
                        self.apply(PeerEvent::Close);
                        let _ = ack.send(());
                        break;
                    }
                    Some(PeerCommand::ChannelEnded(kind, id)) => self.channel_ended(kind, id),
                    None => {
                        self.apply(PeerEvent::Close);
                        break;
                    }
                },
                result = next_open(&mut self.opening) => match result {
                    Ok(session) => {
                        debug!(session = %self.session_id, "signaling connection established");
                        self.session = Some(session);
                    }
                    Err(e) => {
                        warn!(error = %e, "signaling broker unreachable");
                        self.apply(PeerEvent::SignalingError);
                    }
                },
                event = next_event(&mut self.session) => {
                    self.on_signaling(event.unwrap_or(SignalingEvent::Closed));
                }
                () = open_deadline(&mut self.deadline) => {
                    self.deadline = None;
                    let timeout_ms =
                        u64::try_from(self.settings.open_timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(error = %PeerError::Timeout, timeout_ms, "peer acquisition unavailable");
                    self.apply(PeerEvent::SignalingError);
                }
            }
        }
        debug!("peer acquisition stopped");
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open { id } => {
                self.published = Some(id);
                self.apply(PeerEvent::SessionOpened);
            }
            SignalingEvent::Connection(channel) => {
                if self.apply(PeerEvent::DataConnected) {
                    self.attach_data(channel);
                } else {
                    let mut closer = channel.closer;
                    closer.close();
                }
            }
            SignalingEvent::Call(call) => {
                let peer = call.peer.clone();
                if self.apply(PeerEvent::MediaAnswered) {
                    info!(peer = %peer, call = %call.call_id, "answering side-view call");
                    self.attach_media(call.answer());
                } else {
                    debug!(peer = %peer, "ignoring call outside an open session");
                }
            }
            SignalingEvent::Error(msg) => {
                warn!(error = %PeerError::Signaling(msg), "peer acquisition unavailable");
                self.apply(PeerEvent::SignalingError);
            }
            SignalingEvent::Closed => {
                self.session = None;
                if self.machine.state() != PeerState::Error {
                    warn!(error = %PeerError::SessionClosed, "peer acquisition unavailable");
                }
                self.apply(PeerEvent::SignalingError);
            }
        }
    }

    /// Feed `event` through the machine and perform its actions. Returns
    /// whether an offered channel was accepted.
    fn apply(&mut self, event: PeerEvent) -> bool {
        let mut accepted = false;
        for action in self.machine.handle(event) {
            match action {
                PeerAction::OpenSignaling => {
                    self.session_id = peer_session_id();
                    self.published = None;
                    let broker = Arc::clone(&self.broker);
                    let id = self.session_id.clone();
                    let ice = self.settings.ice_servers.clone();
                    debug!(session = %id, "opening peer session");
                    self.opening = Some(Box::pin(async move { broker.open(&id, &ice).await }));
                }
                PeerAction::ArmOpenTimeout => {
                    self.deadline = Some(Box::pin(tokio::time::sleep(self.settings.open_timeout)));
                }
                PeerAction::DisarmOpenTimeout => self.deadline = None,
                PeerAction::PublishSession => {
                    let id = self.published.get_or_insert_with(|| self.session_id.clone());
                    info!(session = %id, "peer session open; pair the side device with this id");
                }
                PeerAction::AcceptChannel(_) => accepted = true,
                PeerAction::RejectChannel(kind) => {
                    debug!(kind = ?kind, state = self.machine.state().as_str(), "channel refused");
                }
                PeerAction::ReportUnavailable => {
                    self.cascade.report_unavailable(SourceTier::PeerLive);
                }
                PeerAction::Teardown => self.teardown(),
            }
        }
        self.publish();
        accepted
    }

    fn teardown(&mut self) {
        self.opening = None;
        for (_, media) in self.media.drain() {
            media.release();
        }
        for (_, data) in self.data.drain() {
            data.release();
        }
        if let Some(mut session) = self.session.take() {
            session.closer.close();
            debug!(session = %self.session_id, "signaling session closed");
        }
    }

    fn channel_id(&mut self) -> u64 {
        self.next_channel += 1;
        self.next_channel
    }

    fn attach_data(&mut self, channel: DataChannel) {
        let id = self.channel_id();
        let DataChannel {
            peer,
            mut messages,
            closer,
        } = channel;
        info!(peer = %peer, "side device data channel open");
        let sender = self.cascade.clone();
        let done = self.self_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(text) = messages.recv().await {
                match parse_peer_sample(&text) {
                    Ok(sample) => {
                        sender.offer(sample, SourceTier::PeerLive);
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "dropping malformed peer sample"),
                }
            }
            if let Some(tx) = done.upgrade() {
                let _ = tx.send(PeerCommand::ChannelEnded(ChannelKind::Data, id)).await;
            }
        });
        self.data.insert(id, Attached { closer, task });
    }

    fn attach_media(&mut self, stream: MediaStream) {
        let id = self.channel_id();
        let MediaStream { mut frames, closer } = stream;
        let mut pacer =
            EstimatorPacer::new(self.estimators.create(), self.settings.detection_interval);
        let sender = self.cascade.clone();
        let done = self.self_tx.clone();
        let task = tokio::spawn(async move {
            pacer
                .pump(&mut frames, |sample| {
                    sender.offer(sample, SourceTier::PeerLive);
                })
                .await;
            if let Some(tx) = done.upgrade() {
                let _ = tx.send(PeerCommand::ChannelEnded(ChannelKind::Media, id)).await;
            }
        });
        self.media.insert(id, Attached { closer, task });
    }

    fn channel_ended(&mut self, kind: ChannelKind, id: u64) {
        let attached = match kind {
            ChannelKind::Data => self.data.remove(&id),
            ChannelKind::Media => self.media.remove(&id),
        };
        if let Some(attached) = attached {
            info!(kind = ?kind, "side device channel closed");
            attached.release();
            self.apply(PeerEvent::ChannelClosed(kind));
        }
    }

    fn publish(&self) {
        let (data_channels, media_streams) = self.machine.channels();
        let state = self.machine.state();
        let next = PeerStatus {
            state,
            session_id: if state.is_open() {
                self.published.clone()
            } else {
                None
            },
            data_channels,
            media_streams,
        };
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            self.observers.notify(&next);
        }
    }
}

/// Control handle for a running [`PeerAcquisition`].
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PeerCommand>,
    status_rx: watch::Receiver<PeerStatus>,
    observers: Observers<PeerStatus>,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("status", &*self.status_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    /// Release the media stream, the data channels and the signaling
    /// session, in that order. Returns once they are gone; later calls
    /// return immediately.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PeerCommand::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Watch negotiation changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<PeerStatus> {
        self.status_rx.clone()
    }

    /// Latest snapshot.
    #[must_use]
    pub fn current(&self) -> PeerStatus {
        self.status_rx.borrow().clone()
    }

    /// Invoke `listener` on every status change.
    pub fn on_status(
        &self,
        listener: impl Fn(&PeerStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeBroker;
    use crate::broker::IncomingCall;
    use crate::cascade::{CascadeSettings, FallbackCascade};
    use crate::capture::NoCapture;
    use crate::estimator::{EncodedLandmarks, VideoFrame};
    use crate::synthetic::synthetic_sample;
    use std::sync::Mutex;

    #[test]
    fn machine_open_then_link_both_paths() {
        let mut m = PeerMachine::new();
        assert_eq!(
            m.handle(PeerEvent::Start),
            vec![PeerAction::OpenSignaling, PeerAction::ArmOpenTimeout]
        );
        assert_eq!(
            m.handle(PeerEvent::SessionOpened),
            vec![PeerAction::DisarmOpenTimeout, PeerAction::PublishSession]
        );
        assert_eq!(m.state(), PeerState::AwaitingPeer);

        m.handle(PeerEvent::DataConnected);
        assert_eq!(m.state(), PeerState::DataLinked);
        m.handle(PeerEvent::MediaAnswered);
        assert_eq!(m.state(), PeerState::MediaLinked);
        m.handle(PeerEvent::ChannelClosed(ChannelKind::Media));
        assert_eq!(m.state(), PeerState::DataLinked);
        m.handle(PeerEvent::ChannelClosed(ChannelKind::Data));
        assert_eq!(m.state(), PeerState::AwaitingPeer);
    }

    #[test]
    fn machine_rejects_channels_before_open() {
        let mut m = PeerMachine::new();
        m.handle(PeerEvent::Start);
        assert_eq!(
            m.handle(PeerEvent::DataConnected),
            vec![PeerAction::RejectChannel(ChannelKind::Data)]
        );
        assert_eq!(m.state(), PeerState::SignalingOpen);
    }

    #[test]
    fn machine_error_reports_unavailable_once() {
        let mut m = PeerMachine::new();
        m.handle(PeerEvent::Start);
        assert_eq!(
            m.handle(PeerEvent::SignalingError),
            vec![
                PeerAction::DisarmOpenTimeout,
                PeerAction::Teardown,
                PeerAction::ReportUnavailable,
            ]
        );
        assert_eq!(m.state(), PeerState::Error);
        assert!(m.handle(PeerEvent::SignalingError).is_empty());
    }

    #[test]
    fn machine_close_is_idempotent() {
        let mut m = PeerMachine::new();
        m.handle(PeerEvent::Start);
        m.handle(PeerEvent::SessionOpened);
        m.handle(PeerEvent::DataConnected);
        assert!(m.handle(PeerEvent::Close).contains(&PeerAction::Teardown));
        assert_eq!(m.state(), PeerState::Closed);
        assert_eq!(m.channels(), (0, 0));
        assert!(m.handle(PeerEvent::Close).is_empty());
    }

    #[test]
    fn peer_payload_object_or_wrapped_string() {
        let sample = synthetic_sample(0.5, 7);
        let object = serde_json::to_string(&sample).unwrap();
        let wrapped = serde_json::to_string(&object).unwrap();
        for text in [&object, &wrapped] {
            let parsed = parse_peer_sample(text).unwrap();
            assert_eq!(parsed.timestamp_ms, 7);
            assert_eq!(parsed.keypoints.len(), sample.keypoints.len());
        }
        assert!(parse_peer_sample("[1,2]").is_err());
        assert!(parse_peer_sample("not json").is_err());
    }

    type Seen = Arc<Mutex<Vec<SourceTier>>>;

    fn cascade() -> (crate::cascade::CascadeHandle, Seen) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let settings = CascadeSettings {
            synthetic_interval: Duration::from_secs(3600),
            ..CascadeSettings::default()
        };
        let handle = FallbackCascade::spawn(
            settings,
            move |_: &PoseSample, tier: SourceTier| sink.lock().unwrap().push(tier),
            NoCapture,
        );
        (handle, seen)
    }

    fn estimators() -> impl EstimatorFactory {
        || -> Box<dyn PoseEstimator> { Box::new(EncodedLandmarks) }
    }

    async fn wait_for(status: &mut watch::Receiver<PeerStatus>, state: PeerState) -> PeerStatus {
        status.wait_for(|s| s.state == state).await.unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn open_timeout_reports_unavailable() {
        let (cascade, _) = cascade();
        let broker = FakeBroker::default();
        let peer =
            PeerAcquisition::spawn(PeerSettings::default(), broker, estimators(), cascade.sender());
        let mut status = peer.status();
        let mut cascade_status = cascade.status();

        wait_for(&mut status, PeerState::Error).await;
        cascade_status.wait_for(|s| s.peer_unavailable).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_reports_unavailable() {
        let (cascade, _) = cascade();
        let broker = FakeBroker {
            refuse: true,
            ..FakeBroker::default()
        };
        let peer =
            PeerAcquisition::spawn(PeerSettings::default(), broker, estimators(), cascade.sender());
        wait_for(&mut peer.status(), PeerState::Error).await;
        cascade.status().wait_for(|s| s.peer_unavailable).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn data_channel_promotes_peer_tier() {
        let (cascade, seen) = cascade();
        let broker = Arc::new(FakeBroker::default());
        let peer = PeerAcquisition::spawn(
            PeerSettings::default(),
            SharedBroker(Arc::clone(&broker)),
            estimators(),
            cascade.sender(),
        );
        let mut status = peer.status();
        let events = open_session(&broker).await;

        events
            .send(SignalingEvent::Open { id: "main-ar-device-abc".into() })
            .await
            .unwrap();
        let published = wait_for(&mut status, PeerState::AwaitingPeer).await;
        assert_eq!(published.session_id.as_deref(), Some("main-ar-device-abc"));

        let (msg_tx, messages) = mpsc::channel(8);
        events
            .send(SignalingEvent::Connection(DataChannel {
                peer: "side".into(),
                messages,
                closer: CloseHandle::noop(),
            }))
            .await
            .unwrap();
        wait_for(&mut status, PeerState::DataLinked).await;

        msg_tx.send("garbage".into()).await.unwrap();
        let sample = serde_json::to_string(&synthetic_sample(1.0, 10)).unwrap();
        msg_tx.send(serde_json::to_string(&sample).unwrap()).await.unwrap();
        cascade
            .status()
            .wait_for(|s| s.active == SourceTier::PeerLive)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[SourceTier::PeerLive]);

        drop(msg_tx);
        wait_for(&mut status, PeerState::AwaitingPeer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn call_is_answered_and_frames_estimated() {
        let (cascade, seen) = cascade();
        let broker = Arc::new(FakeBroker::default());
        let peer = PeerAcquisition::spawn(
            PeerSettings::default(),
            SharedBroker(Arc::clone(&broker)),
            estimators(),
            cascade.sender(),
        );
        let mut status = peer.status();
        let events = open_session(&broker).await;
        events.send(SignalingEvent::Open { id: "x".into() }).await.unwrap();

        let (frame_tx, frames) = mpsc::channel(8);
        let hung_up = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hung_up);
        let stream = MediaStream {
            frames,
            closer: CloseHandle::new(move || *flag.lock().unwrap() = true),
        };
        let call = IncomingCall::new("side", "c1", move || stream);
        events.send(SignalingEvent::Call(call)).await.unwrap();
        wait_for(&mut status, PeerState::MediaLinked).await;

        let landmarks = posecast_common::landmarks::Landmarks {
            image: (0..33)
                .map(|i| posecast_common::landmarks::Landmark {
                    x: f64::from(i) / 40.0,
                    y: 0.5,
                    z: 0.0,
                    visibility: Some(0.9),
                })
                .collect(),
            world: None,
        };
        frame_tx
            .send(VideoFrame {
                timestamp_ms: 5,
                data: serde_json::to_vec(&landmarks).unwrap(),
                ..VideoFrame::default()
            })
            .await
            .unwrap();
        cascade
            .status()
            .wait_for(|s| s.active == SourceTier::PeerLive)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        peer.close().await;
        assert!(*hung_up.lock().unwrap());
        assert_eq!(*broker.closed.lock().unwrap(), 1);
        assert_eq!(peer.current().state, PeerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_twice_leaves_nothing_running() {
        let (cascade, _) = cascade();
        let broker = Arc::new(FakeBroker::default());
        let peer = PeerAcquisition::spawn(
            PeerSettings::default(),
            SharedBroker(Arc::clone(&broker)),
            estimators(),
            cascade.sender(),
        );
        let _events = open_session(&broker).await;
        peer.close().await;
        peer.close().await;
        assert_eq!(*broker.closed.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(peer.current().state, PeerState::Closed);
        assert!(!cascade.status().borrow().peer_unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_disconnect_after_open_falls_back() {
        let (cascade, _) = cascade();
        let broker = Arc::new(FakeBroker::default());
        let peer = PeerAcquisition::spawn(
            PeerSettings::default(),
            SharedBroker(Arc::clone(&broker)),
            estimators(),
            cascade.sender(),
        );
        let events = open_session(&broker).await;
        events.send(SignalingEvent::Open { id: "x".into() }).await.unwrap();
        wait_for(&mut peer.status(), PeerState::AwaitingPeer).await;
        drop(events);
        broker.sessions.lock().unwrap().clear();

        wait_for(&mut peer.status(), PeerState::Error).await;
        cascade.status().wait_for(|s| s.peer_unavailable).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_reports_unavailable_immediately() {
        let (cascade, _) = cascade();
        let settings = PeerSettings {
            enabled: false,
            ..PeerSettings::default()
        };
        let peer = PeerAcquisition::spawn(
            settings,
            FakeBroker::default(),
            estimators(),
            cascade.sender(),
        );
        cascade.status().wait_for(|s| s.peer_unavailable).await.unwrap();
        assert_eq!(peer.current().state, PeerState::Idle);
    }

    struct SharedBroker(Arc<FakeBroker>);

    impl SignalingBroker for SharedBroker {
        fn open(
            &self,
            session_id: &str,
            ice_servers: &[IceServer],
        ) -> impl Future<Output = Result<SignalingSession, PeerError>> + Send {
            self.0.open(session_id, ice_servers)
        }
    }

    async fn open_session(broker: &FakeBroker) -> mpsc::Sender<SignalingEvent> {
        loop {
            if let Some((_, tx)) = broker.sessions.lock().unwrap().first() {
                return tx.clone();
            }
            tokio::task::yield_now().await;
        }
    }
}
