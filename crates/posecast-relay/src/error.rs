use posecast_common::MessageError;
use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum RelayError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be encoded.
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    /// No registered device matches the operator's target.
    #[error("device {0} not found")]
    UnknownDevice(String),
    /// The operator command has no wire form.
    #[error("unsupported command")]
    UnsupportedCommand,
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
}
