#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use posecast_relay::config::ServerConfig;
use posecast_relay::RelayState;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        metrics_interval: Duration::from_millis(100),
        drain_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<RelayState>,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait until `f` holds for the server state.
    pub async fn wait_for(&self, f: impl Fn(&RelayState) -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !f(self.state.as_ref()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timeout waiting for server state");
    }
}

pub async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(RelayState::new(test_config(addr)));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let server_state = Arc::clone(&state);
    let task = tokio::spawn(async move {
        if let Err(e) =
            posecast_relay::run_with_shutdown(listener, server_state, shutdown_rx).await
        {
            eprintln!("server error in test: {e}");
        }
    });

    TestServer {
        addr,
        state,
        shutdown,
        task,
    }
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        Self { ws }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn register(&mut self, device_id: &str, exercise: &str) {
        self.send_json(&json!({
            "type": "device_register",
            "deviceId": device_id,
            "exerciseType": exercise,
        }))
        .await;
    }

    pub async fn send_pose(&mut self, device_id: &str, exercise: &str) {
        self.send_json(&json!({
            "type": "pose_data",
            "deviceId": device_id,
            "data": {
                "exerciseType": exercise,
                "keypoints": [],
                "timestamp": 1,
            },
        }))
        .await;
    }

    /// Next text frame as JSON, skipping control frames.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .expect("timeout waiting for frame")
                .expect("stream ended")
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Next text frame of the given `type`, skipping others.
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// True once the server closes the connection.
    pub async fn closed_by_server(&mut self) -> bool {
        let closed = tokio::time::timeout(TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        closed.is_ok()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
