use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Per-device workout bookkeeping behind the periodic metrics.
#[derive(Clone, Debug)]
pub struct Workout {
    /// Metrics are only pushed while a workout is active.
    pub active: bool,
    /// Start of the current (or last) workout.
    pub started_at: Instant,
    /// Latest repetition count reported by the device.
    pub rep_count: u32,
    /// Latest heart rate reported by the device, when it has a sensor.
    pub reported_heart_rate: Option<u32>,
    /// Resting heart rate the simulated reading drifts from.
    pub base_heart_rate: u32,
}

impl Workout {
    fn idle(now: Instant) -> Self {
        Self {
            active: false,
            started_at: now,
            rep_count: 0,
            reported_heart_rate: None,
            base_heart_rate: rand::thread_rng().gen_range(65..=75),
        }
    }
}

/// Handle held in the registry, used to push frames to a device's connection.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    /// Operator-facing index, assigned 1..n in registration order.
    pub index: usize,
    /// Identifies the connection that registered the device.
    pub conn_id: u64,
    /// Channel sender for delivering text frames to the connection task.
    pub tx: mpsc::Sender<String>,
    /// Exercise label last registered or selected.
    pub exercise: String,
    /// Workout state.
    pub workout: Workout,
}

/// One row of [`DeviceRegistry::list`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    /// Operator-facing index.
    pub index: usize,
    /// Device id.
    pub device_id: String,
    /// Exercise label.
    pub exercise: String,
    /// Whether a workout is running.
    pub workout_active: bool,
}

/// Which devices an operator command addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceTarget {
    /// Every registered device.
    All,
    /// The device with this operator index.
    Index(usize),
    /// The device with this id.
    Id(String),
}

impl FromStr for DeviceTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        Ok(match s.parse::<usize>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Id(s.to_string()),
        })
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Id(id) => f.write_str(id),
        }
    }
}

/// Concurrent device id → connection table with stable operator indices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceHandle>,
    indices: DashMap<usize, String>,
    counter: AtomicUsize,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device_id` for the connection `conn_id`. A device that
    /// registers again keeps its index and workout; its sender is replaced.
    /// Returns the operator index.
    pub fn register(
        &self,
        device_id: &str,
        exercise: &str,
        conn_id: u64,
        tx: mpsc::Sender<String>,
    ) -> usize {
        let mut entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let index = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                DeviceHandle {
                    index,
                    conn_id,
                    tx: tx.clone(),
                    exercise: exercise.to_string(),
                    workout: Workout::idle(Instant::now()),
                }
            });
        entry.conn_id = conn_id;
        entry.tx = tx;
        if !exercise.is_empty() {
            entry.exercise = exercise.to_string();
        }
        let index = entry.index;
        drop(entry);
        self.indices.insert(index, device_id.to_string());
        index
    }

    /// Remove `device_id` only if it is still owned by `conn_id`.
    pub fn remove_if(&self, device_id: &str, conn_id: u64) -> bool {
        match self.devices.remove_if(device_id, |_, v| v.conn_id == conn_id) {
            Some((_, handle)) => {
                self.indices.remove(&handle.index);
                true
            }
            None => false,
        }
    }

    /// Device ids matched by `target`, in index order.
    ///
    /// Returns `None` when a specific device is named but not registered.
    #[must_use]
    pub fn resolve(&self, target: &DeviceTarget) -> Option<Vec<String>> {
        match target {
            DeviceTarget::All => Some(self.list().into_iter().map(|d| d.device_id).collect()),
            DeviceTarget::Index(i) => self.indices.get(i).map(|id| vec![id.value().clone()]),
            DeviceTarget::Id(id) => self.devices.contains_key(id).then(|| vec![id.clone()]),
        }
    }

    /// Look up a device handle.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<DeviceHandle> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    /// Run `f` against a registered device's handle.
    pub fn update<R>(&self, device_id: &str, f: impl FnOnce(&mut DeviceHandle) -> R) -> Option<R> {
        self.devices.get_mut(device_id).map(|mut entry| f(entry.value_mut()))
    }

    /// Registered devices, in index order.
    #[must_use]
    pub fn list(&self) -> Vec<DeviceSummary> {
        let mut rows: Vec<DeviceSummary> = self
            .devices
            .iter()
            .map(|entry| DeviceSummary {
                index: entry.index,
                device_id: entry.key().clone(),
                exercise: entry.exercise.clone(),
                workout_active: entry.workout.active,
            })
            .collect();
        rows.sort_by_key(|row| row.index);
        rows
    }

    /// Devices with a running workout, with their senders and state.
    #[must_use]
    pub fn active_workouts(&self) -> Vec<(String, mpsc::Sender<String>, Workout)> {
        self.devices
            .iter()
            .filter(|entry| entry.workout.active)
            .map(|entry| (entry.key().clone(), entry.tx.clone(), entry.workout.clone()))
            .collect()
    }

    /// Number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` if no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
