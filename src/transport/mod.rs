//! Transport collaborators
//!
//! The replay core only needs to publish a payload on a topic and to release
//! the connection afterwards. Connecting is a separate step so a broker that
//! cannot be reached fails the whole replay before any stream starts.

mod memory;
mod mqtt;

pub use memory::{LogConnector, LogTransport, PublishedMessage, RecordingConnector, RecordingTransport};
pub use mqtt::{InboundMessage, MqttConnector, MqttTransport};

use std::future::Future;

use crate::error::TransportError;

/// Publish capability shared by every replay stream
///
/// `publish` must be safe to call concurrently and must not wait for broker
/// acknowledgement; it only reports whether the message was accepted.
pub trait Transport: Send + Sync {
    /// Hand one payload to the transport
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Release the connection
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Establishes a transport connection
pub trait Connector {
    type Transport: Transport + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}
