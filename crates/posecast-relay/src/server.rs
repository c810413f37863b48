use crate::coach;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::registry::{DeviceRegistry, DeviceTarget};
use posecast_common::types::{unix_millis, DEFAULT_EXERCISE};
use posecast_common::{RelayMessage, SystemCommand};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shared state for the relay server.
#[derive(Debug)]
pub struct RelayState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Registered devices.
    pub registry: DeviceRegistry,
    /// Open WebSocket connections, registered or not.
    pub active_connections: AtomicUsize,
    next_conn_id: AtomicU64,
}

impl RelayState {
    /// Fresh state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: DeviceRegistry::new(),
            active_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send an operator `system_command` to the devices matched by `target`
    /// and apply it to their registry entries. Returns how many devices the
    /// command was queued for.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownDevice`] when a named device is not registered,
    /// [`RelayError::UnsupportedCommand`] for
    /// [`SystemCommand::Unrecognized`].
    pub fn command(
        &self,
        target: &DeviceTarget,
        command: SystemCommand,
    ) -> Result<usize, RelayError> {
        let action = match &command {
            SystemCommand::SelectExercise { .. } => "select_exercise",
            SystemCommand::StartWorkout => "start_workout",
            SystemCommand::StopWorkout => "stop_workout",
            SystemCommand::Unrecognized => return Err(RelayError::UnsupportedCommand),
        };
        let devices = self
            .registry
            .resolve(target)
            .ok_or_else(|| RelayError::UnknownDevice(target.to_string()))?;

        let now = Instant::now();
        let mut delivered = 0;
        for device_id in devices {
            let msg = RelayMessage::SystemCommand {
                device_id: Some(device_id.clone()),
                payload: command.clone(),
            };
            let text = msg.encode()?;
            let Some(tx) = self.registry.update(&device_id, |device| {
                apply_command(&device_id, &mut device.exercise, &mut device.workout, &command, now);
                device.tx.clone()
            }) else {
                continue;
            };
            match tx.try_send(text) {
                Ok(()) => {
                    counters::commands_sent_total(action);
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counters::messages_dropped_total("backpressure");
                    warn!(device_id = %device_id, action, "device queue full, command dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    counters::messages_dropped_total("offline");
                    debug!(device_id = %device_id, action, "device gone, command dropped");
                }
            }
        }
        gauges::workouts_active(self.registry.active_workouts().len());
        info!(target = %target, action, delivered, "operator command sent");
        Ok(delivered)
    }

    /// Push one round of `performance_metrics` to every device with an
    /// active workout. Returns how many were queued.
    pub fn push_metrics(&self) -> usize {
        let now = Instant::now();
        let now_ms = unix_millis();
        let mut rng = rand::thread_rng();
        let mut pushed = 0;
        for (device_id, tx, workout) in self.registry.active_workouts() {
            let payload = coach::performance_metrics(
                &workout,
                now.saturating_duration_since(workout.started_at),
                now_ms,
                &mut rng,
            );
            let msg = RelayMessage::PerformanceMetrics {
                device_id: Some(device_id.clone()),
                payload,
            };
            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    continue;
                }
            };
            if tx.try_send(text).is_ok() {
                counters::metrics_pushed_total();
                pushed += 1;
            } else {
                counters::messages_dropped_total("backpressure");
                debug!(device_id = %device_id, "metrics push skipped");
            }
        }
        pushed
    }
}

fn apply_command(
    device_id: &str,
    exercise: &mut String,
    workout: &mut crate::registry::Workout,
    command: &SystemCommand,
    now: Instant,
) {
    match command {
        SystemCommand::SelectExercise { exercise_type } => {
            *exercise = exercise_type
                .clone()
                .unwrap_or_else(|| DEFAULT_EXERCISE.to_string());
        }
        SystemCommand::StartWorkout => {
            workout.active = true;
            workout.started_at = now;
            workout.rep_count = 0;
        }
        SystemCommand::StopWorkout => {
            if workout.active {
                info!(
                    device_id,
                    reps = workout.rep_count,
                    duration_s = now.saturating_duration_since(workout.started_at).as_secs(),
                    "workout stopped"
                );
            }
            workout.active = false;
        }
        SystemCommand::Unrecognized => {}
    }
}

async fn run_metrics_ticker(state: Arc<RelayState>, mut shutdown: watch::Receiver<bool>) {
    let every = state.config.metrics_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.push_metrics();
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<RelayState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop and the metrics ticker until `shutdown`
/// changes (or its sender is dropped).
///
/// On shutdown the listener stops accepting, open connections are asked to
/// close, and the loop waits up to the configured drain timeout for them
/// before aborting the rest.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);

    let mut connections = JoinSet::new();
    let ticker = tokio::spawn(run_metrics_ticker(Arc::clone(&state), shutdown.clone()));

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let active = state.active_connections.load(Ordering::Relaxed);
                        if active >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => {
                info!("shutdown signal received, draining {} connections", connections.len());
                break;
            }
        }
    }
    drop(listener);

    let deadline = Instant::now() + state.config.drain_timeout;
    let drained = tokio::time::timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            connections.len()
        );
        connections.shutdown().await;
    }
    ticker.abort();

    info!("relay shut down gracefully");
    Ok(())
}
