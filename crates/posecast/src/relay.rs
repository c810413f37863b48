use crate::config::{AppConfig, ConnectionConfig};
use crate::endpoint::{discover, normalize_endpoint, warn_if_direct_from_secure};
use crate::ids;
use crate::link::{ConnectionState, FailureReason, LinkAction, LinkEvent, LinkMachine};
use crate::observer::{Observers, Subscription};
use crate::store::status_text;
use futures_util::{SinkExt, StreamExt};
use posecast_common::message::{BiometricData, PoseData, RepData};
use posecast_common::types::DEFAULT_EXERCISE;
use posecast_common::{MessageError, PoseSample, RelayMessage, SystemCommand};
use serde::Serialize;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, Sleep};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay link failures.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Socket or WebSocket protocol error.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    /// No endpoint configured and none discovered.
    #[error("endpoint required")]
    EndpointMissing,
    /// The link task or the connection is gone.
    #[error("relay link closed")]
    Closed,
    /// An outbound message could not be serialized.
    #[error(transparent)]
    Encode(#[from] MessageError),
    /// A bounded wait expired.
    #[error("timed out")]
    Timeout,
}

impl LinkError {
    /// Whether a failed connect attempt should be retried. Only a missing
    /// endpoint is final; everything else counts against the retry budget.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::EndpointMissing)
    }
}

/// Opens WebSocket connections. Abstracted so the link can run over
/// in-memory pipes.
pub trait Connector: Send + Sync + 'static {
    /// Byte stream under the WebSocket.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a WebSocket to `url`.
    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<WebSocketStream<Self::Stream>, LinkError>> + Send;
}

/// Production connector: TCP plus optional rustls TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Stream = MaybeTlsStream<TcpStream>;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<WebSocketStream<Self::Stream>, LinkError>> + Send {
        let url = url.to_string();
        async move {
            let (ws, _) = tokio_tungstenite::connect_async(url).await?;
            Ok(ws)
        }
    }
}

/// Daemon-level link settings that do not live in [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Hosting context is secure; insecure addresses are upgraded.
    pub secure_context: bool,
    /// Local ports probed when no endpoint is configured.
    pub discovery_ports: Vec<u16>,
    /// Per-port probe timeout.
    pub probe_timeout: Duration,
    /// WebSocket ping interval while connected.
    pub keepalive: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            secure_context: false,
            discovery_ports: vec![8080, 8081, 9000],
            probe_timeout: Duration::from_secs(2),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl From<&AppConfig> for LinkSettings {
    fn from(app: &AppConfig) -> Self {
        Self {
            secure_context: app.secure_context,
            discovery_ports: app.discovery.ports.clone(),
            probe_timeout: Duration::from_millis(app.discovery.probe_timeout_ms),
            keepalive: Duration::from_secs(app.keepalive.interval_s.max(1)),
        }
    }
}

/// Snapshot of the link published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Retries issued so far.
    pub attempts: u32,
    /// Retry budget.
    pub max_attempts: u32,
    /// Last address dialed successfully.
    pub endpoint: Option<String>,
    /// Set while in [`ConnectionState::Failed`].
    pub failure: Option<FailureReason>,
    /// Increments on every successful open.
    pub session: u64,
    /// Exercise label attached to outbound telemetry.
    pub exercise: String,
}

impl LinkStatus {
    fn idle(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            max_attempts,
            endpoint: None,
            failure: None,
            session: 0,
            exercise: DEFAULT_EXERCISE.to_string(),
        }
    }

    /// Operator-facing one-liner.
    #[must_use]
    pub fn text(&self) -> String {
        status_text(self.state, self.attempts, self.max_attempts)
    }
}

/// Telemetry enqueued by a [`RelayHandle`].
#[derive(Debug, Clone)]
pub enum Outbound {
    /// `pose_data`.
    Pose(PoseSample),
    /// `biometric_data`.
    Biometric {
        /// Beats per minute.
        heart_rate: u32,
        /// Reps so far.
        rep_count: u32,
    },
    /// `rep_detection`.
    Rep {
        /// Reps so far.
        rep_count: u32,
    },
}

#[derive(Debug)]
enum RelayCommand {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Reconfigure(Box<ConnectionConfig>),
    Send { session: u64, outbound: Outbound },
    SelectExercise(String),
}

type OpenFuture<S> =
    Pin<Box<dyn Future<Output = Result<(String, WebSocketStream<S>), LinkError>> + Send>>;

/// Resolve the endpoint (config, then discovery) and open the transport.
fn open_transport<C: Connector>(
    connector: Arc<C>,
    config: ConnectionConfig,
    settings: LinkSettings,
) -> OpenFuture<C::Stream> {
    Box::pin(async move {
        let configured = config.effective_endpoint().to_string();
        let url = if configured.is_empty() {
            discover(
                connector.as_ref(),
                &settings.discovery_ports,
                settings.secure_context,
                settings.probe_timeout,
            )
            .await
            .ok_or(LinkError::EndpointMissing)?
        } else {
            warn_if_direct_from_secure(&config, settings.secure_context);
            normalize_endpoint(&configured, settings.secure_context)
        };
        info!(url = %url, "connecting to relay");
        let ws = connector.connect(&url).await?;
        Ok((url, ws))
    })
}

async fn next_open<S>(
    slot: &mut Option<OpenFuture<S>>,
) -> Result<(String, WebSocketStream<S>), LinkError> {
    match slot {
        Some(fut) => {
            let result = fut.as_mut().await;
            *slot = None;
            result
        }
        None => pending().await,
    }
}

async fn retry_elapsed(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => {
            sleep.as_mut().await;
            *slot = None;
        }
        None => pending().await,
    }
}

async fn next_frame<S>(
    ws: &mut Option<WebSocketStream<S>>,
) -> Option<Result<Message, tungstenite::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match ws {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

async fn keepalive_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// The relay link actor. Owns the transport, the [`LinkMachine`] and every
/// timer; the outside world talks to it through a [`RelayHandle`].
pub struct RelayLink<C: Connector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    settings: LinkSettings,
    machine: LinkMachine,
    device_id: Arc<str>,
    exercise: String,
    session: u64,
    endpoint: Option<String>,
    failure: Option<FailureReason>,
    pending_open: Option<OpenFuture<C::Stream>>,
    retry: Option<Pin<Box<Sleep>>>,
    ws: Option<WebSocketStream<C::Stream>>,
    keepalive: Option<Interval>,
    status_tx: watch::Sender<LinkStatus>,
    status_observers: Observers<LinkStatus>,
    inbound: Observers<RelayMessage>,
}

impl<C: Connector> RelayLink<C> {
    /// Start the link task in [`ConnectionState::Idle`]. Nothing is dialed
    /// until [`RelayHandle::connect`].
    pub fn spawn(config: ConnectionConfig, settings: LinkSettings, connector: C) -> RelayHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let machine = LinkMachine::new(
            config.retry_limit(),
            Duration::from_millis(config.reconnect_interval_ms),
        );
        let (status_tx, status_rx) = watch::channel(LinkStatus::idle(machine.max_attempts()));
        let device_id: Arc<str> = ids::device_id().into();
        let inbound = Observers::new();
        let status_observers = Observers::new();
        info!(device_id = %device_id, "relay link ready");

        let link = Self {
            connector: Arc::new(connector),
            config,
            settings,
            machine,
            device_id: Arc::clone(&device_id),
            exercise: DEFAULT_EXERCISE.to_string(),
            session: 0,
            endpoint: None,
            failure: None,
            pending_open: None,
            retry: None,
            ws: None,
            keepalive: None,
            status_tx,
            status_observers: status_observers.clone(),
            inbound: inbound.clone(),
        };
        tokio::spawn(link.run(cmd_rx));

        RelayHandle {
            cmd_tx,
            status_rx,
            inbound,
            status_observers,
            device_id,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                opened = next_open(&mut self.pending_open) => self.handle_open(opened).await,
                () = retry_elapsed(&mut self.retry) => self.apply(LinkEvent::RetryElapsed).await,
                frame = next_frame(&mut self.ws) => self.handle_frame(frame).await,
                () = keepalive_tick(&mut self.keepalive) => {
                    if let Err(e) = self.transmit(Message::Ping(Vec::new())).await {
                        debug!(error = %e, "keepalive ping failed");
                        self.apply(LinkEvent::Closed).await;
                    }
                }
            }
        }
        self.close_transport().await;
        debug!("relay link task stopped");
    }

    async fn handle_command(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Connect => {
                if self.config.enabled {
                    self.apply(LinkEvent::Connect).await;
                } else {
                    info!("relay link disabled in configuration; not connecting");
                }
            }
            RelayCommand::Disconnect(ack) => {
                self.apply(LinkEvent::Disconnect).await;
                let _ = ack.send(());
            }
            RelayCommand::Reconfigure(config) => self.reconfigure(*config).await,
            RelayCommand::Send { session, outbound } => self.send_outbound(session, outbound).await,
            RelayCommand::SelectExercise(label) => {
                info!(exercise = %label, "exercise selected");
                self.exercise = label;
                self.publish();
            }
        }
    }

    async fn reconfigure(&mut self, config: ConnectionConfig) {
        let endpoint_changed = config.effective_endpoint() != self.config.effective_endpoint();
        self.machine.set_policy(
            config.retry_limit(),
            Duration::from_millis(config.reconnect_interval_ms),
        );
        self.config = config;

        let active = matches!(
            self.machine.state(),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        );
        if active && (!self.config.enabled || endpoint_changed) {
            self.apply(LinkEvent::Disconnect).await;
            if self.config.enabled {
                info!("relay endpoint changed; reconnecting");
                self.apply(LinkEvent::Connect).await;
            }
        }
        self.publish();
    }

    async fn handle_open(
        &mut self,
        opened: Result<(String, WebSocketStream<C::Stream>), LinkError>,
    ) {
        match opened {
            Ok((url, ws)) => {
                self.ws = Some(ws);
                self.endpoint = Some(url);
                self.session += 1;
                self.failure = None;
                self.apply(LinkEvent::Opened).await;
            }
            Err(e) if !e.is_transient() => {
                warn!(error = %e, "no relay endpoint configured and none discovered");
                self.apply(LinkEvent::EndpointMissing).await;
            }
            Err(e) => {
                warn!(error = %e, attempt = self.machine.attempts(), "relay connect failed");
                self.apply(LinkEvent::Closed).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(error = %e, "relay connection lost");
                self.apply(LinkEvent::Closed).await;
                return;
            }
            None => {
                info!("relay connection closed");
                self.apply(LinkEvent::Closed).await;
                return;
            }
        };
        match msg {
            Message::Text(text) => self.dispatch_inbound(&text),
            Message::Ping(data) => {
                if let Err(e) = self.transmit(Message::Pong(data)).await {
                    debug!(error = %e, "pong failed");
                    self.apply(LinkEvent::Closed).await;
                }
            }
            Message::Close(frame) => {
                info!(?frame, "relay closed the connection");
                self.apply(LinkEvent::Closed).await;
            }
            Message::Pong(_) => debug!("pong received"),
            Message::Binary(_) | Message::Frame(_) => debug!("ignoring non-text frame"),
        }
    }

    fn dispatch_inbound(&mut self, text: &str) {
        let msg = match RelayMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) if e.is_unrecognized() => {
                debug!(error = %e, "ignoring relay message");
                return;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed relay message");
                return;
            }
        };
        if let RelayMessage::SystemCommand {
            payload: SystemCommand::SelectExercise { exercise_type },
            ..
        } = &msg
        {
            self.exercise = exercise_type
                .clone()
                .unwrap_or_else(|| DEFAULT_EXERCISE.to_string());
            info!(exercise = %self.exercise, "relay selected exercise");
            self.publish();
        }
        self.inbound.notify(&msg);
    }

    async fn send_outbound(&mut self, session: u64, outbound: Outbound) {
        if session != self.session || self.machine.state() != ConnectionState::Connected {
            debug!(session, current = self.session, "dropping telemetry from a stale session");
            return;
        }
        let features = &self.config.features;
        let device_id = self.device_id.to_string();
        let exercise_type = self.exercise.clone();
        let msg = match outbound {
            Outbound::Pose(sample) if features.pose_data => RelayMessage::PoseData {
                device_id,
                data: PoseData::from_sample(&sample, &exercise_type),
            },
            Outbound::Biometric {
                heart_rate,
                rep_count,
            } if features.biometric_data => RelayMessage::BiometricData {
                device_id,
                data: BiometricData {
                    heart_rate,
                    rep_count,
                    exercise_type,
                },
            },
            Outbound::Rep { rep_count } if features.rep_detection => RelayMessage::RepDetection {
                device_id,
                data: RepData {
                    rep_count,
                    exercise_type,
                },
            },
            _ => return,
        };
        if let Err(e) = self.send_message(&msg).await {
            warn!(error = %e, kind = %msg.kind(), "relay send failed");
            self.apply(LinkEvent::Closed).await;
        }
    }

    async fn send_message(&mut self, msg: &RelayMessage) -> Result<(), LinkError> {
        let text = msg.encode()?;
        self.transmit(Message::Text(text)).await
    }

    async fn transmit(&mut self, msg: Message) -> Result<(), LinkError> {
        let ws = self.ws.as_mut().ok_or(LinkError::Closed)?;
        ws.send(msg).await?;
        Ok(())
    }

    /// Feed `event` through the machine and carry out its actions. A failed
    /// registration feeds back a `Closed` event.
    async fn apply(&mut self, event: LinkEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.perform(action).await {
                    next = Some(follow_up);
                }
            }
        }
        self.publish();
    }

    async fn perform(&mut self, action: LinkAction) -> Option<LinkEvent> {
        match action {
            LinkAction::Open => {
                self.pending_open = Some(open_transport(
                    Arc::clone(&self.connector),
                    self.config.clone(),
                    self.settings.clone(),
                ));
            }
            LinkAction::Register => {
                let register = RelayMessage::register(&self.device_id, &self.exercise);
                if let Err(e) = self.send_message(&register).await {
                    warn!(error = %e, "device registration failed");
                    return Some(LinkEvent::Closed);
                }
                let every = self.settings.keepalive;
                self.keepalive = Some(tokio::time::interval_at(Instant::now() + every, every));
                info!(
                    endpoint = self.endpoint.as_deref().unwrap_or_default(),
                    device_id = %self.device_id,
                    "registered with relay"
                );
            }
            LinkAction::ScheduleRetry(delay) => {
                info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt = self.machine.attempts(),
                    max = self.machine.max_attempts(),
                    "reconnecting"
                );
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            LinkAction::CancelRetry => self.retry = None,
            LinkAction::CloseTransport => self.close_transport().await,
            LinkAction::ReportFailed(reason) => {
                warn!(reason = %reason, "relay link failed");
                self.failure = Some(reason);
            }
        }
        None
    }

    async fn close_transport(&mut self) {
        self.pending_open = None;
        self.keepalive = None;
        if let Some(mut ws) = self.ws.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None))
                .await
                .is_err()
            {
                debug!("close handshake timed out");
            }
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        let next = LinkStatus {
            state,
            attempts: self.machine.attempts(),
            max_attempts: self.machine.max_attempts(),
            endpoint: self.endpoint.clone(),
            failure: if state == ConnectionState::Failed {
                self.failure
            } else {
                None
            },
            session: self.session,
            exercise: self.exercise.clone(),
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
            self.status_observers.notify(&next);
        }
    }
}

/// Cloneable handle to a running [`RelayLink`].
#[derive(Clone)]
pub struct RelayHandle {
    cmd_tx: mpsc::Sender<RelayCommand>,
    status_rx: watch::Receiver<LinkStatus>,
    inbound: Observers<RelayMessage>,
    status_observers: Observers<LinkStatus>,
    device_id: Arc<str>,
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("device_id", &self.device_id)
            .field("state", &self.status_rx.borrow().state)
            .finish_non_exhaustive()
    }
}

impl RelayHandle {
    /// Ask the link to connect. Resets the retry counter; a no-op while
    /// already connecting or connected.
    ///
    /// # Errors
    ///
    /// [`LinkError::Closed`] if the link task has stopped.
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.cmd_tx
            .send(RelayCommand::Connect)
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Disconnect and wait until the retry timer and transport are gone.
    /// Safe to call in any state and more than once.
    ///
    /// # Errors
    ///
    /// [`LinkError::Closed`] if the link task has stopped.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Disconnect(ack_tx))
            .await
            .map_err(|_| LinkError::Closed)?;
        ack_rx.await.map_err(|_| LinkError::Closed)
    }

    /// Replace the connection settings. The link reconnects if it is active
    /// and the effective endpoint changed.
    ///
    /// # Errors
    ///
    /// [`LinkError::Closed`] if the link task has stopped.
    pub async fn reconfigure(&self, config: ConnectionConfig) -> Result<(), LinkError> {
        self.cmd_tx
            .send(RelayCommand::Reconfigure(Box::new(config)))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Change the exercise label attached to outbound telemetry.
    ///
    /// # Errors
    ///
    /// [`LinkError::Closed`] if the link task has stopped.
    pub async fn select_exercise(&self, label: impl Into<String>) -> Result<(), LinkError> {
        self.cmd_tx
            .send(RelayCommand::SelectExercise(label.into()))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Queue a `pose_data` message. Returns `false` (and drops the sample)
    /// unless the link is connected.
    pub fn send_pose_sample(&self, sample: &PoseSample) -> bool {
        self.enqueue(Outbound::Pose(sample.clone()))
    }

    /// Queue a `biometric_data` message. Same delivery rules as
    /// [`send_pose_sample`](Self::send_pose_sample).
    pub fn send_biometric(&self, heart_rate: u32, rep_count: u32) -> bool {
        self.enqueue(Outbound::Biometric {
            heart_rate,
            rep_count,
        })
    }

    /// Queue a `rep_detection` message.
    pub fn send_rep_event(&self, rep_count: u32) -> bool {
        self.enqueue(Outbound::Rep { rep_count })
    }

    fn enqueue(&self, outbound: Outbound) -> bool {
        let session = {
            let status = self.status_rx.borrow();
            if status.state != ConnectionState::Connected {
                return false;
            }
            status.session
        };
        self.cmd_tx
            .try_send(RelayCommand::Send { session, outbound })
            .is_ok()
    }

    /// Watch the link status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Current status snapshot.
    #[must_use]
    pub fn current(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    /// Listen for every well-formed inbound relay message.
    pub fn subscribe(
        &self,
        listener: impl Fn(&RelayMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.inbound.subscribe(listener)
    }

    /// Listen for status changes.
    pub fn on_status(
        &self,
        listener: impl Fn(&LinkStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.status_observers.subscribe(listener)
    }

    /// Device id sent in `device_register`, stable for this link's lifetime.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}
