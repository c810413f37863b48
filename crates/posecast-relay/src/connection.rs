use crate::coach;
use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::server::RelayState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use posecast_common::types::{unix_millis, DEFAULT_EXERCISE};
use posecast_common::RelayMessage;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Depth of the per-connection queue fed by operator commands and metrics.
const DELIVER_QUEUE: usize = 64;

/// Owns a connection's slot in the server counters and, once the client has
/// registered, its registry entry.
struct ConnGuard {
    state: Arc<RelayState>,
    conn_id: u64,
    device_id: Option<String>,
}

impl ConnGuard {
    fn new(state: Arc<RelayState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        let conn_id = state.next_conn_id();
        Self {
            state,
            conn_id,
            device_id: None,
        }
    }

    fn release_device(&mut self) {
        if let Some(device_id) = self.device_id.take() {
            if self.state.registry.remove_if(&device_id, self.conn_id) {
                info!(device_id = %device_id, "device disconnected");
            }
            gauges::devices_registered(self.state.registry.len());
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.release_device();
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(RelayError::WebSocket)?;
    debug!(peer = %peer_addr, "client connected");

    let mut guard = ConnGuard::new(state);
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<String>(DELIVER_QUEUE);

    run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &deliver_tx,
        &mut guard,
        shutdown,
    )
    .await
}

/// Drive the select loop for one client until it closes, idles out, or the
/// server shuts down.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<String>,
    deliver_tx: &mpsc::Sender<String>,
    guard: &mut ConnGuard,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let state = Arc::clone(&guard.state);
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = process_text(&text, &state, guard, deliver_tx) {
                            ws_tx.send(Message::Text(reply)).await.map_err(RelayError::WebSocket)?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        counters::messages_dropped_total("binary");
                        debug!(len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(text) = deliver_rx.recv() => {
                ws_tx.send(Message::Text(text)).await.map_err(RelayError::WebSocket)?;
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!("idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    debug!("failed to send ping: {}", e);
                }
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Handle one inbound text frame. Returns a reply for the same connection,
/// if any. Malformed and unknown frames are logged and dropped.
fn process_text(
    text: &str,
    state: &RelayState,
    guard: &mut ConnGuard,
    deliver_tx: &mpsc::Sender<String>,
) -> Option<String> {
    let msg = match RelayMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) if e.is_unrecognized() => {
            counters::messages_dropped_total("unknown_type");
            info!(error = %e, "unknown message type");
            return None;
        }
        Err(e) => {
            counters::messages_dropped_total("malformed");
            warn!(error = %e, "dropping malformed frame");
            return None;
        }
    };
    counters::messages_received_total(msg.kind().as_str());

    match msg {
        RelayMessage::DeviceRegister {
            device_id,
            exercise_type,
        } => {
            if device_id.is_empty() {
                warn!("device_register without deviceId");
                return None;
            }
            if guard.device_id.as_deref() != Some(device_id.as_str()) {
                guard.release_device();
            }
            let index = state.registry.register(
                &device_id,
                &exercise_type,
                guard.conn_id,
                deliver_tx.clone(),
            );
            info!(device_id = %device_id, exercise = %exercise_type, index, "device registered");
            guard.device_id = Some(device_id);
            gauges::devices_registered(state.registry.len());
            None
        }
        RelayMessage::PoseData { device_id, data } => {
            let exercise = if data.exercise_type.is_empty() {
                state
                    .registry
                    .get(&device_id)
                    .map_or_else(|| DEFAULT_EXERCISE.to_string(), |d| d.exercise)
            } else {
                data.exercise_type
            };
            let payload =
                coach::feedback_payload(&exercise, unix_millis(), &mut rand::thread_rng());
            let reply = RelayMessage::AiFeedback {
                device_id: Some(device_id),
                payload,
            };
            match reply.encode() {
                Ok(text) => {
                    counters::feedback_sent_total();
                    Some(text)
                }
                Err(e) => {
                    warn!(error = %e, "failed to encode feedback");
                    None
                }
            }
        }
        RelayMessage::BiometricData { device_id, data } => {
            debug!(
                device_id = %device_id,
                heart_rate = data.heart_rate,
                reps = data.rep_count,
                "biometric data"
            );
            state.registry.update(&device_id, |device| {
                device.workout.reported_heart_rate =
                    (data.heart_rate > 0).then_some(data.heart_rate);
                if data.rep_count > 0 {
                    device.workout.rep_count = data.rep_count;
                }
            });
            None
        }
        RelayMessage::RepDetection { device_id, data } => {
            info!(
                device_id = %device_id,
                reps = data.rep_count,
                exercise = %data.exercise_type,
                "rep detected"
            );
            state.registry.update(&device_id, |device| {
                device.workout.rep_count = data.rep_count;
            });
            None
        }
        other => {
            counters::messages_dropped_total("unexpected");
            debug!(kind = %other.kind(), "ignoring relay-bound message type from device");
            None
        }
    }
}
