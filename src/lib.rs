//! Sensor Replay - timed MQTT replay of recorded wearable sensor data
//!
//! Replay turns recorded measurement files back into live sensor traffic
//! through a deterministic pipeline: ingestion → optional multi-user
//! synthesis → timestamp grouping → cadence derivation → per-user timed
//! publication.
//!
//! ## Modules
//!
//! - **Core**: `grouper`, `cadence`, `scheduler` and `fanout` rebuild the
//!   recorded timing and publish one message per observed field
//! - **Collaborators**: `ingest`, `generator` and `transport` supply parsed
//!   measurements and the broker connection

pub mod cadence;
pub mod config;
pub mod error;
pub mod fanout;
pub mod generator;
pub mod grouper;
pub mod ingest;
pub mod pipeline;
pub mod scheduler;
pub mod transport;
pub mod types;

pub use cadence::{derive_delays, Cadence};
pub use config::{BrokerConfig, ReplayConfig, SynthesisConfig};
pub use error::{IngestError, ReplayError, TransportError};
pub use fanout::{Coordinator, FanOutReport, ReplaySource};
pub use grouper::{GroupedRecords, Grouper, IgnoreSet, UserStream};
pub use pipeline::{PipelineReport, ReplayPipeline};
pub use scheduler::{ReplayScheduler, Routing, SchedulerState, StreamOutcome, TopicMode};
pub use types::{
    CompositeRecord, KindFields, KindLabel, Measurement, MeasurementKind, OutboundMessage,
    Timestamp, UserId,
};

/// Replay version, reported by the CLI
pub const REPLAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name, used as the MQTT client id prefix
pub const PRODUCER_NAME: &str = "sensor-replay";

/// Topic every measurement kind is published on by default
pub const DEFAULT_TOPIC: &str = "sensor/howdy/data";
