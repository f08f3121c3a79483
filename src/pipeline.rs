//! Pipeline orchestration
//!
//! This module provides the top-level API for a replay run. It ties the
//! stages together: load every configured source, optionally expand it to
//! simulated users, then fan the streams out over one transport connection.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReplayConfig;
use crate::error::{IngestError, ReplayError};
use crate::fanout::{Coordinator, FanOutReport, ReplaySource};
use crate::generator::generate_multi_user;
use crate::grouper::Grouper;
use crate::ingest::load_source;
use crate::transport::Connector;
use crate::types::{MeasurementKind, Timestamp, UserId};

/// A source that could not be loaded
#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub message: String,
}

/// Outcome of `ReplayPipeline::run`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub replay: FanOutReport,
    pub failed_sources: Vec<SourceFailure>,
}

/// What one (source, user) stream would replay
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub source: String,
    pub user_id: UserId,
    /// Raw measurements for this user, before ignoring kinds
    pub measurements: usize,
    pub groups: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    /// Recorded span in seconds
    pub duration_secs: i64,
    pub kinds: Vec<MeasurementKind>,
}

/// Outcome of `ReplayPipeline::inspect`
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub streams: Vec<StreamSummary>,
    pub failed_sources: Vec<SourceFailure>,
}

fn recorded_instant(timestamp: Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0).single()
}

/// Replay pipeline built from a validated configuration.
///
/// # Example
/// ```ignore
/// let pipeline = ReplayPipeline::new(ReplayConfig::default())?;
/// let connector = MqttConnector::new(pipeline.config().broker.clone());
/// let report = pipeline.run(&connector, &CancellationToken::new()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ReplayPipeline {
    config: ReplayConfig,
}

impl ReplayPipeline {
    /// Validate `config` and build a pipeline
    pub fn new(config: ReplayConfig) -> Result<Self, ReplayError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.config.ignore, self.config.routing.clone())
            .with_speed(self.config.speed)
    }

    /// Load every configured source.
    ///
    /// A source that fails to load is logged and returned separately; the
    /// others are unaffected.
    pub fn load_sources(&self) -> (Vec<ReplaySource>, Vec<(String, IngestError)>) {
        let mut loaded = Vec::new();
        let mut failed = Vec::new();

        for name in &self.config.sources {
            let path = self.config.source_path(name);
            match load_source(&path) {
                Ok(measurements) => {
                    info!(source = %name, measurements = measurements.len(), "source loaded");
                    loaded.push(ReplaySource::new(name.clone(), measurements));
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "skipping source");
                    failed.push((name.clone(), e));
                }
            }
        }

        (loaded, failed)
    }

    /// Expand each source to the configured number of simulated users
    pub fn synthesize(&self, sources: Vec<ReplaySource>) -> Result<Vec<ReplaySource>, ReplayError> {
        let synthesis = &self.config.synthesis;
        if !synthesis.is_enabled() {
            return Ok(sources);
        }

        let mut rng = match synthesis.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        sources
            .into_iter()
            .map(|source| -> Result<ReplaySource, ReplayError> {
                let measurements = generate_multi_user(source.measurements, synthesis, &mut rng)?;
                info!(
                    source = %source.name,
                    users = synthesis.users,
                    measurements = measurements.len(),
                    "synthesized users"
                );
                Ok(ReplaySource::new(source.name, measurements))
            })
            .collect()
    }

    /// Load, synthesize and prepare sources, failing only if none load
    fn prepare(&self) -> Result<(Vec<ReplaySource>, Vec<SourceFailure>), ReplayError> {
        let (loaded, failed) = self.load_sources();

        if loaded.is_empty() {
            return match failed.into_iter().next() {
                Some((_, error)) => Err(error.into()),
                None => Err(ReplayError::Config("no sources configured".to_string())),
            };
        }

        let failures = failed
            .into_iter()
            .map(|(source, error)| SourceFailure {
                source,
                message: error.to_string(),
            })
            .collect();

        Ok((self.synthesize(loaded)?, failures))
    }

    /// Replay every loadable source through a connection from `connector`.
    ///
    /// Fails before publishing anything if no source loads or the connection
    /// cannot be established. Cancelling `token` stops every stream.
    pub async fn run<C: Connector>(
        &self,
        connector: &C,
        token: &CancellationToken,
    ) -> Result<PipelineReport, ReplayError> {
        let (sources, failed_sources) = self.prepare()?;
        let replay = self.coordinator().run(connector, &sources, token).await?;

        Ok(PipelineReport {
            replay,
            failed_sources,
        })
    }

    /// Summarize what a run would replay, without connecting
    pub fn inspect(&self) -> Result<InspectReport, ReplayError> {
        let (sources, failed_sources) = self.prepare()?;
        let grouper = Grouper::new(self.config.ignore);

        let mut streams = Vec::new();
        for source in &sources {
            for stream in grouper.group(&source.measurements).into_user_streams() {
                let measurements = source
                    .measurements
                    .iter()
                    .filter(|m| m.user_id == stream.user_id)
                    .count();
                let kinds: BTreeSet<MeasurementKind> = stream
                    .records
                    .iter()
                    .flat_map(|record| record.fields.kinds())
                    .collect();
                let first = stream.records.first().map(|r| r.timestamp);
                let last = stream.records.last().map(|r| r.timestamp);

                streams.push(StreamSummary {
                    source: source.name.clone(),
                    user_id: stream.user_id,
                    measurements,
                    groups: stream.len(),
                    first: first.and_then(recorded_instant),
                    last: last.and_then(recorded_instant),
                    duration_secs: match (first, last) {
                        (Some(first), Some(last)) => last - first,
                        _ => 0,
                    },
                    kinds: kinds.into_iter().collect(),
                });
            }
        }

        Ok(InspectReport {
            streams,
            failed_sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SynthesisConfig;
    use crate::transport::{RecordingConnector, RecordingTransport};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::PathBuf;

    fn data_folder(files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("replay-pipeline-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for (name, contents) in files {
            fs::write(dir.join(name), contents).unwrap();
        }
        dir
    }

    const USER_ONE: &str = r#"[
        {"date": 100, "value": [72], "userId": 1, "measureType": "HeartRate"},
        {"date": 100, "value": [0.1], "userId": 1, "measureType": "AccelerationX"},
        {"date": 102, "value": [75], "userId": 1, "measureType": "HeartRate"},
        {"date": 102, "value": [0.8], "userId": 1, "measureType": "R2R"}
    ]"#;

    fn config(folder: PathBuf, sources: &[&str]) -> ReplayConfig {
        ReplayConfig {
            data_folder: folder,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = ReplayPipeline::new(ReplayConfig {
            speed: -1.0,
            ..Default::default()
        });
        assert!(matches!(result, Err(ReplayError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_source_does_not_stop_others() {
        let folder = data_folder(&[("good.json", USER_ONE), ("bad.json", "[{\"date\":")]);
        let pipeline = ReplayPipeline::new(config(folder.clone(), &["bad.json", "good.json"])).unwrap();
        let connector = RecordingConnector::new(RecordingTransport::new());

        let report = pipeline.run(&connector, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed_sources.len(), 1);
        assert_eq!(report.failed_sources[0].source, "bad.json");
        assert_eq!(report.replay.streams.len(), 1);
        assert_eq!(report.replay.messages_published(), 3);

        let _ = fs::remove_dir_all(folder);
    }

    #[tokio::test]
    async fn test_no_loadable_source_fails() {
        let folder = data_folder(&[]);
        let pipeline = ReplayPipeline::new(config(folder.clone(), &["missing.json"])).unwrap();
        let connector = RecordingConnector::new(RecordingTransport::new());

        let result = pipeline.run(&connector, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ReplayError::Ingest(IngestError::Io { .. }))));
        assert_eq!(connector.transport().calls(), 0);

        let _ = fs::remove_dir_all(folder);
    }

    #[test]
    fn test_inspect_summarizes_streams() {
        let folder = data_folder(&[("user1.json", USER_ONE)]);
        let pipeline = ReplayPipeline::new(config(folder.clone(), &["user1.json"])).unwrap();

        let report = pipeline.inspect().unwrap();
        assert_eq!(report.streams.len(), 1);

        let summary = &report.streams[0];
        assert_eq!(summary.measurements, 4);
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.duration_secs, 2);
        assert_eq!(summary.first.map(|t| t.timestamp()), Some(100));
        assert_eq!(
            summary.kinds,
            vec![MeasurementKind::HeartRate, MeasurementKind::AccelerationX]
        );

        let _ = fs::remove_dir_all(folder);
    }

    #[test]
    fn test_inspect_with_synthesized_users() {
        let folder = data_folder(&[("user1.json", USER_ONE)]);
        let mut cfg = config(folder.clone(), &["user1.json"]);
        cfg.synthesis = SynthesisConfig {
            users: 3,
            seed: Some(11),
            ..Default::default()
        };

        let report = ReplayPipeline::new(cfg).unwrap().inspect().unwrap();
        let users: Vec<_> = report.streams.iter().map(|s| s.user_id).collect();
        assert_eq!(users, vec![1, 1001, 2001]);
        assert!(report.streams.iter().all(|s| s.groups == 2));

        let _ = fs::remove_dir_all(folder);
    }
}
