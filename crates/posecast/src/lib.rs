//! posecast client daemon: resilient relay link, peer side-view acquisition
//! and pose source fallback, with a local JSON API.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Signaling broker seam and WebSocket broker client.
pub mod broker;
/// Local camera capture seam.
pub mod capture;
/// Source arbitration between peer, local capture and synthetic samples.
pub mod cascade;
/// CLI parsing, daemon settings, and relay connection settings.
pub mod config;
/// Relay address normalization and local auto-discovery.
pub mod endpoint;
/// Pose model seam and detection pacing.
pub mod estimator;
/// Throttled re-transmission of the authoritative sample stream.
pub mod forward;
/// Device and session identifiers.
pub mod ids;
/// Relay link state machine.
pub mod link;
/// Line-delimited JSON API over TCP.
pub mod local_api;
/// Listener registry with explicit unsubscribe handles.
pub mod observer;
/// Peer session negotiation with data and media paths.
pub mod peer;
/// WebSocket relay link actor.
pub mod relay;
/// Persisted relay connection settings.
pub mod store;
/// Deterministic synthetic pose generator.
pub mod synthetic;
