//! Signaling broker client.
//!
//! [`SignalingBroker`] is the seam [`crate::peer`] negotiates through.
//! [`WsBroker`] speaks a PeerJS-style JSON envelope over one WebSocket and
//! tunnels data channels and media frames through the same connection.

use crate::config::IceServer;
use crate::estimator::VideoFrame;
use crate::ids::base36_token;
use crate::relay::{Connector, LinkError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 64;
const CHANNEL_QUEUE: usize = 256;
const FRAME_QUEUE: usize = 8;

/// Peer negotiation failures.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The broker refused or reported an error.
    #[error("signaling error: {0}")]
    Signaling(String),
    /// The broker did not open the session in time.
    #[error("signaling session open timed out")]
    Timeout,
    /// The session is gone.
    #[error("signaling session closed")]
    SessionClosed,
    /// Could not reach the broker.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Idempotent release of one resource. Dropping the handle does not release.
#[must_use = "keep the handle to release the resource"]
pub struct CloseHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CloseHandle {
    /// Wrap a release action.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release the resource. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// True once [`close`](Self::close) ran (or for a no-op handle).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.release.is_none()
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Inbound data channel from a remote peer.
#[derive(Debug)]
pub struct DataChannel {
    /// Remote peer id.
    pub peer: String,
    /// Message payloads as JSON text, in arrival order.
    pub messages: mpsc::Receiver<String>,
    /// Closes the channel.
    pub closer: CloseHandle,
}

/// Answered media call.
#[derive(Debug)]
pub struct MediaStream {
    /// Video frames; closes when the call ends.
    pub frames: mpsc::Receiver<VideoFrame>,
    /// Hangs up.
    pub closer: CloseHandle,
}

/// Media call waiting for an answer.
pub struct IncomingCall {
    /// Remote peer id.
    pub peer: String,
    /// Broker-assigned call id.
    pub call_id: String,
    answer: Box<dyn FnOnce() -> MediaStream + Send>,
}

impl IncomingCall {
    /// Build a call whose answer is produced by `answer`.
    pub fn new(
        peer: impl Into<String>,
        call_id: impl Into<String>,
        answer: impl FnOnce() -> MediaStream + Send + 'static,
    ) -> Self {
        Self {
            peer: peer.into(),
            call_id: call_id.into(),
            answer: Box::new(answer),
        }
    }

    /// Accept the call and start receiving frames.
    pub fn answer(self) -> MediaStream {
        (self.answer)()
    }
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("peer", &self.peer)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// Broker events, in arrival order.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Session registered under `id`.
    Open {
        /// Id remote devices dial.
        id: String,
    },
    /// A remote peer opened a data channel.
    Connection(DataChannel),
    /// A remote peer is calling with video.
    Call(IncomingCall),
    /// Broker-reported error.
    Error(String),
    /// The broker connection ended.
    Closed,
}

/// An open signaling session.
#[derive(Debug)]
pub struct SignalingSession {
    /// Session events.
    pub events: mpsc::Receiver<SignalingEvent>,
    /// Tears the session down.
    pub closer: CloseHandle,
}

/// External signaling service.
pub trait SignalingBroker: Send + Sync + 'static {
    /// Open a session registered as `session_id`.
    fn open(
        &self,
        session_id: &str,
        ice_servers: &[IceServer],
    ) -> impl Future<Output = Result<SignalingSession, PeerError>> + Send;
}

/// `connectionId` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionBody {
    connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataBody {
    connection_id: String,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallBody {
    call_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameBody {
    call_id: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    timestamp: u64,
    /// Base64 frame payload.
    data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    msg: String,
}

/// Wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
enum Envelope {
    Open,
    Error {
        #[serde(default)]
        payload: ErrorBody,
    },
    IdTaken {
        #[serde(default)]
        payload: ErrorBody,
    },
    Expire {
        #[serde(default)]
        src: Option<String>,
    },
    Heartbeat,
    Leave {
        src: String,
    },
    Connection {
        src: String,
        payload: ConnectionBody,
    },
    Data {
        src: String,
        payload: DataBody,
    },
    Call {
        src: String,
        payload: CallBody,
    },
    Answer {
        dst: String,
        payload: CallBody,
    },
    Frame {
        src: String,
        payload: FrameBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug)]
enum Control {
    Close,
    CloseChannel(String),
    Answer {
        peer: String,
        call_id: String,
        frames: mpsc::Sender<VideoFrame>,
    },
    HangUp(String),
}

/// Broker client over the PeerJS-style WebSocket protocol.
#[derive(Debug)]
pub struct WsBroker<C> {
    connector: Arc<C>,
    url: String,
    key: String,
    heartbeat: Duration,
}

impl<C: Connector> WsBroker<C> {
    /// Broker at `url` (`ws(s)://host[:port]/path`) using API `key`.
    pub fn new(
        connector: C,
        url: impl Into<String>,
        key: impl Into<String>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            url: url.into(),
            key: key.into(),
            heartbeat,
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}?key={}&id={}&token={}",
            self.url.trim_end_matches('?'),
            self.key,
            session_id,
            base36_token(10)
        )
    }
}

impl<C: Connector> SignalingBroker for WsBroker<C> {
    fn open(
        &self,
        session_id: &str,
        ice_servers: &[IceServer],
    ) -> impl Future<Output = Result<SignalingSession, PeerError>> + Send {
        let url = self.session_url(session_id);
        let connector = Arc::clone(&self.connector);
        let heartbeat = self.heartbeat;
        let session_id = session_id.to_string();
        let relays = ice_servers.len();
        async move {
            debug!(url = %url, ice_servers = relays, "opening signaling session");
            let ws = connector.connect(&url).await?;
            let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let task = BrokerSession {
                session_id,
                events_tx,
                control_tx: control_tx.clone(),
                channels: HashMap::new(),
                calls: HashMap::new(),
            };
            tokio::spawn(task.run(ws, control_rx, heartbeat));
            Ok(SignalingSession {
                events,
                closer: CloseHandle::new(move || {
                    let _ = control_tx.send(Control::Close);
                }),
            })
        }
    }
}

struct Tunnel<T> {
    peer: String,
    tx: mpsc::Sender<T>,
}

struct BrokerSession {
    session_id: String,
    events_tx: mpsc::Sender<SignalingEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    channels: HashMap<String, Tunnel<String>>,
    calls: HashMap<String, Tunnel<VideoFrame>>,
}

impl BrokerSession {
    async fn run<S>(
        mut self,
        mut ws: WebSocketStream<S>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        heartbeat: Duration,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            self.emit(SignalingEvent::Closed).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("signaling connection closed");
                        self.emit(SignalingEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "signaling connection failed");
                        self.emit(SignalingEvent::Error(e.to_string())).await;
                        self.emit(SignalingEvent::Closed).await;
                        break;
                    }
                },
                ctl = control_rx.recv() => match ctl {
                    Some(Control::Close) | None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Some(Control::CloseChannel(id)) => {
                        self.channels.remove(&id);
                    }
                    Some(Control::HangUp(id)) => {
                        self.calls.remove(&id);
                    }
                    Some(Control::Answer { peer, call_id, frames }) => {
                        let answer = Envelope::Answer {
                            dst: peer.clone(),
                            payload: CallBody { call_id: call_id.clone() },
                        };
                        match serde_json::to_string(&answer) {
                            Ok(text) => {
                                if ws.send(Message::Text(text)).await.is_err() {
                                    self.emit(SignalingEvent::Closed).await;
                                    break;
                                }
                                self.calls.insert(call_id, Tunnel { peer, tx: frames });
                            }
                            Err(e) => warn!(error = %e, "could not encode answer"),
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    let beat = Message::Text(r#"{"type":"HEARTBEAT"}"#.to_string());
                    if ws.send(beat).await.is_err() {
                        self.emit(SignalingEvent::Closed).await;
                        break;
                    }
                }
            }
        }
        debug!(session = %self.session_id, "signaling session ended");
    }

    async fn emit(&self, event: SignalingEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("signaling event dropped: no listener");
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping malformed signaling message");
                return;
            }
        };
        match envelope {
            Envelope::Open => {
                let id = self.session_id.clone();
                self.emit(SignalingEvent::Open { id }).await;
            }
            Envelope::Error { payload } => {
                self.emit(SignalingEvent::Error(payload.msg)).await;
            }
            Envelope::IdTaken { payload } => {
                let msg = if payload.msg.is_empty() {
                    format!("id {} is taken", self.session_id)
                } else {
                    payload.msg
                };
                self.emit(SignalingEvent::Error(msg)).await;
            }
            Envelope::Expire { src } => {
                warn!(peer = src.as_deref().unwrap_or("?"), "signaling message expired");
            }
            Envelope::Heartbeat | Envelope::Answer { .. } => {}
            Envelope::Leave { src } => {
                info!(peer = %src, "peer left");
                self.channels.retain(|_, t| t.peer != src);
                self.calls.retain(|_, t| t.peer != src);
            }
            Envelope::Connection { src, payload } => {
                let (tx, messages) = mpsc::channel(CHANNEL_QUEUE);
                let id = payload.connection_id;
                self.channels.insert(
                    id.clone(),
                    Tunnel {
                        peer: src.clone(),
                        tx,
                    },
                );
                let control = self.control_tx.clone();
                let channel = DataChannel {
                    peer: src,
                    messages,
                    closer: CloseHandle::new(move || {
                        let _ = control.send(Control::CloseChannel(id));
                    }),
                };
                self.emit(SignalingEvent::Connection(channel)).await;
            }
            Envelope::Data { payload, .. } => match self.channels.get(&payload.connection_id) {
                Some(tunnel) => {
                    if tunnel.tx.try_send(payload.data.to_string()).is_err() {
                        debug!(
                            connection = %payload.connection_id,
                            "data channel backlog; message dropped"
                        );
                    }
                }
                None => debug!(connection = %payload.connection_id, "data for unknown channel"),
            },
            Envelope::Call { src, payload } => {
                let control = self.control_tx.clone();
                let call_id = payload.call_id;
                let call = IncomingCall::new(src.clone(), call_id.clone(), move || {
                    let (frames_tx, frames) = mpsc::channel(FRAME_QUEUE);
                    let _ = control.send(Control::Answer {
                        peer: src,
                        call_id: call_id.clone(),
                        frames: frames_tx,
                    });
                    MediaStream {
                        frames,
                        closer: CloseHandle::new(move || {
                            let _ = control.send(Control::HangUp(call_id));
                        }),
                    }
                });
                self.emit(SignalingEvent::Call(call)).await;
            }
            Envelope::Frame { payload, .. } => {
                let Some(tunnel) = self.calls.get(&payload.call_id) else {
                    debug!(call = %payload.call_id, "frame for unanswered call");
                    return;
                };
                match BASE64.decode(payload.data.as_bytes()) {
                    Ok(data) => {
                        let frame = VideoFrame {
                            width: payload.width,
                            height: payload.height,
                            timestamp_ms: payload.timestamp,
                            data,
                        };
                        // Late frames are worthless; drop instead of queueing.
                        let _ = tunnel.tx.try_send(frame);
                    }
                    Err(e) => warn!(error = %e, "undecodable media frame"),
                }
            }
            Envelope::Unknown => debug!("ignoring unknown signaling message"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    struct Loopback {
        dialed: Mutex<Vec<String>>,
        server: mpsc::UnboundedSender<WebSocketStream<DuplexStream>>,
    }

    impl Connector for Arc<Loopback> {
        type Stream = DuplexStream;

        fn connect(
            &self,
            url: &str,
        ) -> impl Future<Output = Result<WebSocketStream<DuplexStream>, LinkError>> + Send {
            self.dialed.lock().unwrap().push(url.to_string());
            let server = self.server.clone();
            async move {
                let (client, remote) = tokio::io::duplex(64 * 1024);
                let remote = WebSocketStream::from_raw_socket(remote, Role::Server, None).await;
                let _ = server.send(remote);
                Ok(WebSocketStream::from_raw_socket(client, Role::Client, None).await)
            }
        }
    }

    async fn open_session() -> (
        SignalingSession,
        WebSocketStream<DuplexStream>,
        Arc<Loopback>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let loopback = Arc::new(Loopback {
            dialed: Mutex::new(Vec::new()),
            server: tx,
        });
        let broker = WsBroker::new(
            Arc::clone(&loopback),
            "wss://broker.test/peerjs",
            "peerjs",
            Duration::from_secs(5),
        );
        let session = broker
            .open("main-ar-device-abc123xyz", &crate::config::default_ice_servers())
            .await
            .unwrap();
        let server = rx.recv().await.unwrap();
        (session, server, loopback)
    }

    async fn send(server: &mut WebSocketStream<DuplexStream>, json: &str) {
        server.send(Message::Text(json.to_string())).await.unwrap();
    }

    async fn next_json(server: &mut WebSocketStream<DuplexStream>) -> Value {
        match server.next().await.unwrap().unwrap() {
            Message::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn close_handle_runs_once() {
        let hits = Arc::new(Mutex::new(0));
        let mut handle = CloseHandle::new({
            let hits = hits.clone();
            move || *hits.lock().unwrap() += 1
        });
        assert!(!handle.is_closed());
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(*hits.lock().unwrap(), 1);
        CloseHandle::noop().close();
    }

    #[tokio::test(start_paused = true)]
    async fn session_url_carries_key_and_id() {
        let (_session, _server, loopback) = open_session().await;
        let url = loopback.dialed.lock().unwrap()[0].clone();
        assert!(url.starts_with(
            "wss://broker.test/peerjs?key=peerjs&id=main-ar-device-abc123xyz&token="
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn open_and_error_are_reported() {
        let (mut session, mut server, _) = open_session().await;
        send(&mut server, r#"{"type":"OPEN"}"#).await;
        send(&mut server, r#"{"type":"SOMETHING-NEW"}"#).await;
        send(&mut server, r#"{"type":"ID-TAKEN","payload":{}}"#).await;

        match session.events.recv().await.unwrap() {
            SignalingEvent::Open { id } => assert_eq!(id, "main-ar-device-abc123xyz"),
            other => panic!("unexpected {other:?}"),
        }
        match session.events.recv().await.unwrap() {
            SignalingEvent::Error(msg) => assert!(msg.contains("taken")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn data_channel_messages_are_tunnelled() {
        let (mut session, mut server, _) = open_session().await;
        send(
            &mut server,
            r#"{"type":"CONNECTION","src":"side","payload":{"connectionId":"dc1"}}"#,
        )
        .await;
        let SignalingEvent::Connection(mut channel) = session.events.recv().await.unwrap() else {
            panic!("expected connection");
        };
        assert_eq!(channel.peer, "side");

        send(
            &mut server,
            r#"{"type":"DATA","src":"side","payload":{"connectionId":"dc1","data":{"keypoints":[]}}}"#,
        )
        .await;
        send(
            &mut server,
            r#"{"type":"DATA","src":"side","payload":{"connectionId":"dc1","data":"{\"a\":1}"}}"#,
        )
        .await;
        assert_eq!(channel.messages.recv().await.unwrap(), r#"{"keypoints":[]}"#);
        assert_eq!(channel.messages.recv().await.unwrap(), r#""{\"a\":1}""#);

        send(&mut server, r#"{"type":"LEAVE","src":"side"}"#).await;
        assert!(channel.messages.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_call_receives_frames() {
        let (mut session, mut server, _) = open_session().await;
        send(&mut server, r#"{"type":"CALL","src":"side","payload":{"callId":"mc1"}}"#).await;
        let SignalingEvent::Call(call) = session.events.recv().await.unwrap() else {
            panic!("expected call");
        };
        assert_eq!(call.call_id, "mc1");
        let mut media = call.answer();

        let answer = next_json(&mut server).await;
        assert_eq!(answer["type"], "ANSWER");
        assert_eq!(answer["dst"], "side");
        assert_eq!(answer["payload"]["callId"], "mc1");

        let data = BASE64.encode(b"pixels");
        send(
            &mut server,
            &format!(
                r#"{{"type":"FRAME","src":"side","payload":{{"callId":"mc1","width":2,"height":1,"timestamp":9,"data":"{data}"}}}}"#
            ),
        )
        .await;
        let frame = media.frames.recv().await.unwrap();
        assert_eq!(frame.data, b"pixels");
        assert_eq!(frame.timestamp_ms, 9);

        media.closer.close();
        media.closer.close();
        assert!(media.frames.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_every_interval_and_close_ends_session() {
        let (mut session, mut server, _) = open_session().await;
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(next_json(&mut server).await["type"], "HEARTBEAT");

        session.closer.close();
        assert!(matches!(server.next().await, Some(Ok(Message::Close(_)))));
        assert!(session.events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_is_reported() {
        let (mut session, server, _) = open_session().await;
        drop(server);
        loop {
            match session.events.recv().await {
                Some(SignalingEvent::Closed) => break,
                Some(SignalingEvent::Error(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
