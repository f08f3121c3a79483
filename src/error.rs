//! Error types for Sensor Replay

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by a transport collaborator
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Timed out after {0:?} waiting for the broker to accept the connection")]
    ConnectTimeout(Duration),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Failed to disconnect cleanly: {0}")]
    Disconnect(String),

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Unsupported QoS level: {0}")]
    InvalidQos(u8),
}

/// Errors raised while reading a recorded source file
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid record at {}:{line}: {message}", path.display())]
    Line {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Unsupported document shape in {}", .0.display())]
    UnsupportedShape(PathBuf),
}

/// Errors that can occur while preparing or running a replay
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Transport connection failed: {0}")]
    Connection(#[from] TransportError),

    #[error("Ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Replay stream for source {source_name} user {user_id} panicked")]
    StreamPanicked { source_name: String, user_id: i64 },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
