mod common;

use common::*;
use posecast::config::ConnectionConfig;
use posecast::link::ConnectionState;
use posecast::relay::{LinkSettings, RelayLink, WsConnector};
use posecast::synthetic::synthetic_sample;
use posecast_common::{RelayMessage, SystemCommand};
use posecast_relay::metrics::{routes, HealthState};
use posecast_relay::DeviceTarget;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[tokio::test]
async fn registered_device_gets_feedback_for_pose_data() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr).await;

    client.register("dev-1", "squats").await;
    server.wait_for(|s| s.registry.get("dev-1").is_some()).await;
    assert_eq!(server.state.registry.get("dev-1").unwrap().index, 1);

    client.send_pose("dev-1", "squats").await;
    let feedback = client.recv_type("ai_feedback").await;
    assert_eq!(feedback["deviceId"], "dev-1");
    let line = feedback["payload"]["feedback"].as_str().unwrap();
    assert!(posecast_relay::coach::templates("squats").contains(&line));
}

#[tokio::test]
async fn malformed_and_unknown_frames_do_not_drop_the_connection() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr).await;

    client.send_text("{this is not json").await;
    client.send_text(r#"{"type":"video_frame","deviceId":"dev-1"}"#).await;
    client.send_text(r#"{"deviceId":"dev-1"}"#).await;

    client.send_pose("dev-1", "push-ups").await;
    let feedback = client.recv_type("ai_feedback").await;
    assert!(feedback["payload"]["feedback"].is_string());
}

#[tokio::test]
async fn operator_command_reaches_the_addressed_device_only() {
    let server = start_server().await;
    let mut a = TestClient::connect(&server.addr).await;
    let mut b = TestClient::connect(&server.addr).await;
    a.register("dev-a", "push-ups").await;
    server.wait_for(|s| s.registry.len() == 1).await;
    b.register("dev-b", "push-ups").await;
    server.wait_for(|s| s.registry.len() == 2).await;

    let sent = server
        .state
        .command(
            &DeviceTarget::Index(2),
            SystemCommand::SelectExercise {
                exercise_type: Some("bicep-curls".into()),
            },
        )
        .unwrap();
    assert_eq!(sent, 1);

    let cmd = b.recv_type("system_command").await;
    assert_eq!(cmd["payload"]["action"], "select_exercise");
    assert_eq!(cmd["payload"]["exerciseType"], "bicep-curls");
    assert_eq!(server.state.registry.get("dev-b").unwrap().exercise, "bicep-curls");
    assert_eq!(server.state.registry.get("dev-a").unwrap().exercise, "push-ups");

    // `a` sees nothing but its own feedback.
    a.send_pose("dev-a", "push-ups").await;
    assert_eq!(a.recv_json().await["type"], "ai_feedback");
}

#[tokio::test]
async fn metrics_stream_while_workout_is_active() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr).await;
    client.register("dev-1", "squats").await;
    server.wait_for(|s| s.registry.len() == 1).await;

    server
        .state
        .command(&DeviceTarget::All, SystemCommand::StartWorkout)
        .unwrap();
    let start = client.recv_type("system_command").await;
    assert_eq!(start["payload"]["action"], "start_workout");

    let metrics = client.recv_type("performance_metrics").await;
    let payload = &metrics["payload"];
    assert_eq!(metrics["deviceId"], "dev-1");
    for field in ["heartRate", "repCount", "workoutDuration", "caloriesBurned", "timestamp"] {
        assert!(payload[field].is_u64(), "missing {field}: {payload}");
    }

    client
        .send_text(
            r#"{"type":"rep_detection","deviceId":"dev-1","data":{"repCount":3,"exerciseType":"squats"}}"#,
        )
        .await;
    server
        .wait_for(|s| s.registry.get("dev-1").map(|d| d.workout.rep_count) == Some(3))
        .await;
    loop {
        let metrics = client.recv_type("performance_metrics").await;
        if metrics["payload"]["repCount"] == 3 {
            break;
        }
    }

    server
        .state
        .command(&DeviceTarget::Id("dev-1".into()), SystemCommand::StopWorkout)
        .unwrap();
    client.recv_type("system_command").await;
    assert!(!server.state.registry.get("dev-1").unwrap().workout.active);
}

#[tokio::test]
async fn disconnect_unregisters_device() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr).await;
    client.register("dev-1", "squats").await;
    server.wait_for(|s| s.registry.len() == 1).await;

    client.close().await;
    server.wait_for(|s| s.registry.is_empty()).await;
    assert!(server
        .state
        .command(&DeviceTarget::Id("dev-1".into()), SystemCommand::StartWorkout)
        .is_err());
}

#[tokio::test]
async fn shutdown_closes_clients_and_stops_server() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr).await;
    client.register("dev-1", "squats").await;
    server.wait_for(|s| s.registry.len() == 1).await;

    server.shutdown.send(true).unwrap();
    assert!(client.closed_by_server().await);
    tokio::time::timeout(TIMEOUT, server.task)
        .await
        .expect("server did not drain")
        .unwrap();
    assert!(TcpStream::connect(server.addr).await.is_err());
}

#[tokio::test]
async fn posecast_link_registers_streams_and_follows_commands() {
    let server = start_server().await;
    let relay = RelayLink::spawn(
        ConnectionConfig {
            endpoint_url: server.url(),
            ..ConnectionConfig::default()
        },
        LinkSettings::default(),
        WsConnector,
    );
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let _sub = relay.subscribe(move |msg: &RelayMessage| {
        let _ = inbound_tx.send(msg.clone());
    });

    relay.connect().await.unwrap();
    let mut status = relay.status();
    tokio::time::timeout(TIMEOUT, status.wait_for(|s| s.state == ConnectionState::Connected))
        .await
        .expect("link did not connect")
        .unwrap();

    let device_id = relay.device_id().to_string();
    server.wait_for(|s| s.registry.get(&device_id).is_some()).await;

    assert!(relay.send_pose_sample(&synthetic_sample(0.0, 42)));
    let feedback = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(RelayMessage::AiFeedback { payload, .. }) = inbound.recv().await {
                return payload;
            }
        }
    })
    .await
    .expect("no feedback");
    assert!(!feedback.feedback.is_empty());

    server
        .state
        .command(
            &DeviceTarget::Id(device_id.clone()),
            SystemCommand::SelectExercise {
                exercise_type: Some("lateral-raises".into()),
            },
        )
        .unwrap();
    tokio::time::timeout(TIMEOUT, status.wait_for(|s| s.exercise == "lateral-raises"))
        .await
        .expect("exercise not applied")
        .unwrap();

    relay.disconnect().await.unwrap();
    server.wait_for(|s| s.registry.is_empty()).await;
}

#[tokio::test]
async fn devices_endpoint_lists_registry() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr).await;
    client.register("dev-1", "squats").await;
    server.wait_for(|s| s.registry.len() == 1).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    let app = routes(HealthState::new(), Arc::clone(&server.state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let body = http_get(http_addr, "/devices").await;
    assert!(body.contains(r#""count":1"#), "{body}");
    assert!(body.contains(r#""deviceId":"dev-1""#), "{body}");
    assert!(body.contains(r#""workoutActive":false"#), "{body}");

    let body = http_get(http_addr, "/health").await;
    assert!(body.contains("healthy"), "{body}");
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("http timeout")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    response
}
