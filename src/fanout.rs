//! User fan-out
//!
//! Groups every source dataset, splits it per user and runs one
//! `ReplayScheduler` per (source, user) pair on its own task. All streams
//! share one transport connection and one cancellation token.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ReplayError;
use crate::grouper::{Grouper, IgnoreSet, UserStream};
use crate::scheduler::{ReplayScheduler, Routing, SchedulerState, StreamOutcome};
use crate::transport::{Connector, Transport};
use crate::types::{Measurement, UserId};

/// One named, already parsed dataset
#[derive(Debug, Clone)]
pub struct ReplaySource {
    pub name: String,
    pub measurements: Vec<Measurement>,
}

impl ReplaySource {
    pub fn new(name: impl Into<String>, measurements: Vec<Measurement>) -> Self {
        Self {
            name: name.into(),
            measurements,
        }
    }
}

/// Result of a fan-out run
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOutReport {
    /// Outcomes ordered by source then user
    pub streams: Vec<StreamOutcome>,
    /// Streams that ended abnormally
    pub failures: Vec<String>,
}

impl FanOutReport {
    pub fn messages_published(&self) -> usize {
        self.streams.iter().map(|s| s.messages_published).sum()
    }

    pub fn publish_failures(&self) -> usize {
        self.streams.iter().map(|s| s.publish_failures).sum()
    }

    pub fn groups_emitted(&self) -> usize {
        self.streams.iter().map(|s| s.groups_emitted).sum()
    }

    /// True when any stream stopped early
    pub fn was_cancelled(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.state == SchedulerState::Cancelled)
    }

    pub fn stream(&self, source: &str, user_id: UserId) -> Option<&StreamOutcome> {
        self.streams
            .iter()
            .find(|s| s.source == source && s.user_id == user_id)
    }
}

/// Runs one replay stream per (source, user)
#[derive(Debug, Clone)]
pub struct Coordinator {
    grouper: Grouper,
    routing: Routing,
    speed: f64,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(IgnoreSet::default(), Routing::default())
    }
}

impl Coordinator {
    pub fn new(ignore: IgnoreSet, routing: Routing) -> Self {
        Self {
            grouper: Grouper::new(ignore),
            routing,
            speed: 1.0,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Group each source independently and split it per user
    pub fn plan(&self, sources: &[ReplaySource]) -> Vec<(String, UserStream)> {
        sources
            .iter()
            .flat_map(|source| {
                let streams = self.grouper.group(&source.measurements).into_user_streams();
                streams
                    .into_iter()
                    .map(move |stream| (source.name.clone(), stream))
            })
            .collect()
    }

    /// Connect, replay every stream, then disconnect.
    ///
    /// A connection failure is returned before any stream is spawned.
    /// Cancelling `token` while the connection is being set up abandons it;
    /// every planned stream is then reported as cancelled with nothing sent.
    pub async fn run<C: Connector>(
        &self,
        connector: &C,
        sources: &[ReplaySource],
        token: &CancellationToken,
    ) -> Result<FanOutReport, ReplayError> {
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = connector.connect() => Some(result),
        };

        let transport = match connected {
            Some(Ok(transport)) => Arc::new(transport),
            Some(Err(e)) => {
                error!(error = %e, "cannot start replay without a broker connection");
                return Err(e.into());
            }
            None => {
                warn!("cancelled while connecting, nothing replayed");
                return Ok(self.cancelled_report(sources));
            }
        };

        let report = self.run_with(Arc::clone(&transport), sources, token).await;

        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "transport did not disconnect cleanly");
        }
        Ok(report)
    }

    fn cancelled_report(&self, sources: &[ReplaySource]) -> FanOutReport {
        let streams = self
            .plan(sources)
            .into_iter()
            .map(|(source, stream)| StreamOutcome {
                source,
                user_id: stream.user_id,
                state: SchedulerState::Cancelled,
                groups_emitted: 0,
                total_groups: stream.len(),
                messages_published: 0,
                publish_failures: 0,
            })
            .collect();
        FanOutReport {
            streams,
            failures: Vec::new(),
        }
    }

    /// Replay every stream over an established transport
    pub async fn run_with<T: Transport + 'static>(
        &self,
        transport: Arc<T>,
        sources: &[ReplaySource],
        token: &CancellationToken,
    ) -> FanOutReport {
        let plan = self.plan(sources);
        info!(streams = plan.len(), sources = sources.len(), "starting fan-out");

        let handles: Vec<(String, UserId, JoinHandle<StreamOutcome>)> = plan
            .into_iter()
            .map(|(source, stream)| {
                let user_id = stream.user_id;
                let mut scheduler =
                    ReplayScheduler::new(source.clone(), stream, Arc::clone(&transport))
                        .with_routing(self.routing.clone())
                        .with_speed(self.speed);
                let token = token.clone();
                let handle = tokio::spawn(async move { scheduler.run(&token).await });
                (source, user_id, handle)
            })
            .collect();

        let mut report = FanOutReport::default();
        for (source, user_id, handle) in handles {
            match handle.await {
                Ok(outcome) => report.streams.push(outcome),
                Err(join_error) => {
                    let failure = ReplayError::StreamPanicked {
                        source_name: source,
                        user_id,
                    };
                    error!(error = %join_error, "{}", failure);
                    report.failures.push(failure.to_string());
                }
            }
        }
        report
            .streams
            .sort_by(|a, b| (a.source.as_str(), a.user_id).cmp(&(b.source.as_str(), b.user_id)));

        info!(
            streams = report.streams.len(),
            published = report.messages_published(),
            failed = report.publish_failures(),
            cancelled = report.was_cancelled(),
            "fan-out finished"
        );
        report
    }
}
