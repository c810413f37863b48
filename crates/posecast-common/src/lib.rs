//! Types shared by the posecast client and relay server.
//!
//! This crate provides:
//! - The pose sample model and keypoint vocabulary ([`pose`])
//! - The JSON telemetry wire protocol ([`message`])
//! - Landmark → sample conversion for pose models ([`landmarks`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod landmarks;
pub mod message;
pub mod pose;
pub mod types;

pub use message::{MessageError, MessageKind, RelayMessage, SystemCommand};
pub use pose::{Keypoint, KeypointName, PoseSample, Position, SampleError};
