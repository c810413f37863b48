//! Telemetry wire protocol.
//!
//! Every message is a JSON text frame whose `type` field selects the variant.
//! Outbound (device → relay) variants carry the sender's `deviceId` and a
//! `data` object; inbound (relay → device) variants carry a `payload` object.
//!
//! Decoding is two-staged so callers can tell a malformed frame apart from a
//! well-formed frame of a type this build does not know: the first is a
//! protocol error, the second is ignored.

use crate::pose::{Keypoint, PoseSample};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Discriminant of a [`RelayMessage`], as written in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Device announces itself after the transport opens.
    DeviceRegister,
    /// Pose sample telemetry.
    PoseData,
    /// Heart rate / rep count telemetry.
    BiometricData,
    /// A repetition was counted.
    RepDetection,
    /// Server-computed workout metrics.
    PerformanceMetrics,
    /// Coaching text from the server.
    AiFeedback,
    /// Operator command.
    SystemCommand,
}

impl MessageKind {
    /// All kinds, outbound first.
    pub const ALL: [MessageKind; 7] = [
        Self::DeviceRegister,
        Self::PoseData,
        Self::BiometricData,
        Self::RepDetection,
        Self::PerformanceMetrics,
        Self::AiFeedback,
        Self::SystemCommand,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceRegister => "device_register",
            Self::PoseData => "pose_data",
            Self::BiometricData => "biometric_data",
            Self::RepDetection => "rep_detection",
            Self::PerformanceMetrics => "performance_metrics",
            Self::AiFeedback => "ai_feedback",
            Self::SystemCommand => "system_command",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// True for relay → device kinds.
    #[must_use]
    pub const fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::PerformanceMetrics | Self::AiFeedback | Self::SystemCommand
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `pose_data` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseData {
    /// Exercise label at send time.
    pub exercise_type: String,
    /// Keypoints of the sample.
    pub keypoints: Vec<Keypoint>,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl PoseData {
    /// Build the body for `sample` under the given exercise label.
    #[must_use]
    pub fn from_sample(sample: &PoseSample, exercise_type: &str) -> Self {
        Self {
            exercise_type: exercise_type.to_string(),
            keypoints: sample.keypoints.clone(),
            timestamp: sample.timestamp_ms,
        }
    }
}

/// `biometric_data` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricData {
    /// Beats per minute, 0 when no sensor is attached.
    #[serde(default)]
    pub heart_rate: u32,
    /// Repetitions so far.
    #[serde(default)]
    pub rep_count: u32,
    /// Exercise label.
    pub exercise_type: String,
}

/// `rep_detection` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepData {
    /// Repetitions so far.
    pub rep_count: u32,
    /// Exercise label.
    pub exercise_type: String,
}

/// `performance_metrics` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Beats per minute.
    #[serde(default)]
    pub heart_rate: u32,
    /// Pulse reading alongside the heart rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<u32>,
    /// Repetitions in the current workout.
    #[serde(default)]
    pub rep_count: u32,
    /// Seconds since the workout started.
    #[serde(default)]
    pub workout_duration: u64,
    /// Estimated kilocalories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories_burned: Option<u32>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// `ai_feedback` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiFeedback {
    /// Coaching line to show.
    pub feedback: String,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// `system_command` payload, keyed by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SystemCommand {
    /// Switch the exercise label attached to outbound telemetry.
    SelectExercise {
        /// New label; absent means the default exercise.
        #[serde(
            rename = "exerciseType",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        exercise_type: Option<String>,
    },
    /// Operator started a workout.
    StartWorkout,
    /// Operator stopped a workout.
    StopWorkout,
    /// Any action this build does not know.
    #[serde(other)]
    Unrecognized,
}

/// A single telemetry protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Sent once, first, on every freshly opened connection.
    DeviceRegister {
        /// Sender's device id.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Exercise label at registration.
        #[serde(rename = "exerciseType")]
        exercise_type: String,
    },
    /// One pose sample.
    PoseData {
        /// Sender's device id.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Body.
        data: PoseData,
    },
    /// Biometric reading.
    BiometricData {
        /// Sender's device id.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Body.
        data: BiometricData,
    },
    /// Repetition counted on the device.
    RepDetection {
        /// Sender's device id.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Body.
        data: RepData,
    },
    /// Periodic workout metrics from the relay.
    PerformanceMetrics {
        /// Addressed device, when the relay names one.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        /// Body.
        payload: PerformanceMetrics,
    },
    /// Coaching feedback from the relay.
    AiFeedback {
        /// Addressed device, when the relay names one.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        /// Body.
        payload: AiFeedback,
    },
    /// Operator command from the relay.
    SystemCommand {
        /// Addressed device, when the relay names one.
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        /// Body.
        payload: SystemCommand,
    },
}

/// Wire decode/encode failures.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The frame is not JSON at all.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The frame is a JSON value without a string `type` field.
    #[error("message has no type field")]
    MissingType,
    /// The `type` field names a message this build does not know.
    #[error("unrecognized message type: {0}")]
    UnrecognizedType(String),
    /// The type is known but its body does not match the schema.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Message kind that failed.
        kind: MessageKind,
        /// Deserializer error text.
        reason: String,
    },
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MessageError {
    /// Unknown types are ignored by receivers; everything else is a protocol
    /// error worth a warning.
    #[must_use]
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::UnrecognizedType(_))
    }
}

impl RelayMessage {
    /// Discriminant of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::DeviceRegister { .. } => MessageKind::DeviceRegister,
            Self::PoseData { .. } => MessageKind::PoseData,
            Self::BiometricData { .. } => MessageKind::BiometricData,
            Self::RepDetection { .. } => MessageKind::RepDetection,
            Self::PerformanceMetrics { .. } => MessageKind::PerformanceMetrics,
            Self::AiFeedback { .. } => MessageKind::AiFeedback,
            Self::SystemCommand { .. } => MessageKind::SystemCommand,
        }
    }

    /// Device id carried by the message, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceRegister { device_id, .. }
            | Self::PoseData { device_id, .. }
            | Self::BiometricData { device_id, .. }
            | Self::RepDetection { device_id, .. } => Some(device_id),
            Self::PerformanceMetrics { device_id, .. }
            | Self::AiFeedback { device_id, .. }
            | Self::SystemCommand { device_id, .. } => device_id.as_deref(),
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// See [`MessageError`] for the failure classes.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MessageError::Malformed(e.to_string()))?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(t) => MessageKind::from_wire(t)
                .ok_or_else(|| MessageError::UnrecognizedType(t.to_string()))?,
            None => return Err(MessageError::MissingType),
        };
        serde_json::from_value(value).map_err(|e| MessageError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// `device_register` for `device_id`.
    #[must_use]
    pub fn register(device_id: &str, exercise_type: &str) -> Self {
        Self::DeviceRegister {
            device_id: device_id.to_string(),
            exercise_type: exercise_type.to_string(),
        }
    }

    /// `system_command` addressed to no particular device.
    #[must_use]
    pub fn command(payload: SystemCommand) -> Self {
        Self::SystemCommand {
            device_id: None,
            payload,
        }
    }
}
