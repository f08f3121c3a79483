//! Timed replay of one user stream
//!
//! A `ReplayScheduler` walks a user's composite records in timestamp order,
//! publishes every observed field as its own message, then waits the recorded
//! gap before the next group. Cancellation is checked before each group and
//! interrupts an in-progress wait.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cadence::Cadence;
use crate::grouper::UserStream;
use crate::transport::Transport;
use crate::types::{CompositeRecord, MeasurementKind, OutboundMessage, UserId};
use crate::DEFAULT_TOPIC;

/// Lifecycle of a replay stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Cancelled,
    Completed,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulerState::Cancelled | SchedulerState::Completed)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Cancelled => "cancelled",
            SchedulerState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// How message topics are chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicMode {
    /// Every kind on one topic, tagged by `measureType` in the payload
    #[default]
    Unified,
    /// One sub-topic per kind: `<topic>/<Kind>`
    PerKind,
}

/// Outbound topic selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub topic: String,
    pub mode: TopicMode,
}

impl Routing {
    pub fn new(topic: impl Into<String>, mode: TopicMode) -> Self {
        Self {
            topic: topic.into(),
            mode,
        }
    }

    pub fn topic_for(&self, kind: MeasurementKind) -> String {
        match self.mode {
            TopicMode::Unified => self.topic.clone(),
            TopicMode::PerKind => format!("{}/{}", self.topic.trim_end_matches('/'), kind),
        }
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC, TopicMode::Unified)
    }
}

/// Final accounting for one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamOutcome {
    pub source: String,
    pub user_id: UserId,
    pub state: SchedulerState,
    pub groups_emitted: usize,
    pub total_groups: usize,
    pub messages_published: usize,
    pub publish_failures: usize,
}

/// Replays one user's ordered records through a shared transport
#[derive(Debug)]
pub struct ReplayScheduler<T> {
    source: String,
    user_id: UserId,
    records: Vec<CompositeRecord>,
    cadence: Cadence,
    transport: Arc<T>,
    routing: Routing,
    state: SchedulerState,
    groups_emitted: usize,
    messages_published: usize,
    publish_failures: usize,
}

impl<T: Transport> ReplayScheduler<T> {
    /// Build an idle scheduler; the cadence is derived from the stream
    pub fn new(source: impl Into<String>, stream: UserStream, transport: Arc<T>) -> Self {
        let cadence = Cadence::from_timestamps(&stream.timestamps());
        Self {
            source: source.into(),
            user_id: stream.user_id,
            records: stream.records,
            cadence,
            transport,
            routing: Routing::default(),
            state: SchedulerState::Idle,
            groups_emitted: 0,
            messages_published: 0,
            publish_failures: 0,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    /// Play back `speed` times faster than recorded
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.cadence = self.cadence.with_speed(speed);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn outcome(&self) -> StreamOutcome {
        StreamOutcome {
            source: self.source.clone(),
            user_id: self.user_id,
            state: self.state,
            groups_emitted: self.groups_emitted,
            total_groups: self.records.len(),
            messages_published: self.messages_published,
            publish_failures: self.publish_failures,
        }
    }

    /// Replay every group until done or cancelled.
    ///
    /// A scheduler runs once; calling this again on a finished scheduler
    /// returns its outcome without publishing anything.
    pub async fn run(&mut self, token: &CancellationToken) -> StreamOutcome {
        if self.state != SchedulerState::Idle {
            warn!(source = %self.source, user_id = self.user_id, state = %self.state, "scheduler already ran");
            return self.outcome();
        }
        self.state = SchedulerState::Running;
        info!(
            source = %self.source,
            user_id = self.user_id,
            groups = self.records.len(),
            duration = ?self.cadence.total(),
            "replay stream started"
        );

        let mut state = SchedulerState::Completed;
        let mut emitted = 0;
        let mut published = 0;
        let mut failures = 0;

        for (index, record) in self.records.iter().enumerate() {
            if token.is_cancelled() {
                state = SchedulerState::Cancelled;
                break;
            }

            let (ok, failed) = self.emit(record);
            published += ok;
            failures += failed;
            emitted += 1;
            debug!(
                source = %self.source,
                user_id = self.user_id,
                timestamp = record.timestamp,
                fields = ok + failed,
                "group emitted"
            );

            let delay = match self.cadence.delay_after(index) {
                Some(delay) if !delay.is_zero() => delay,
                _ => continue,
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    state = SchedulerState::Cancelled;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state = state;
        self.groups_emitted = emitted;
        self.messages_published = published;
        self.publish_failures = failures;

        match state {
            SchedulerState::Cancelled => warn!(
                source = %self.source,
                user_id = self.user_id,
                emitted,
                remaining = self.records.len() - emitted,
                "replay stream cancelled"
            ),
            _ => info!(
                source = %self.source,
                user_id = self.user_id,
                published,
                failures,
                "replay stream finished"
            ),
        }

        self.outcome()
    }

    /// Publish one message per field; returns (published, failed)
    fn emit(&self, record: &CompositeRecord) -> (usize, usize) {
        let mut published = 0;
        let mut failed = 0;

        for (kind, values) in record.fields.iter() {
            let topic = self.routing.topic_for(kind);
            let result = OutboundMessage::new(self.user_id, kind, values)
                .to_payload()
                .map_err(|e| e.to_string())
                .and_then(|payload| {
                    self.transport
                        .publish(&topic, payload)
                        .map_err(|e| e.to_string())
                });

            match result {
                Ok(()) => {
                    trace!(%topic, user_id = self.user_id, %kind, "published");
                    published += 1;
                }
                Err(error) => {
                    warn!(
                        source = %self.source,
                        user_id = self.user_id,
                        %kind,
                        %error,
                        "publish failed, continuing"
                    );
                    failed += 1;
                }
            }
        }

        (published, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::{Grouper, IgnoreSet};
    use crate::transport::RecordingTransport;
    use crate::types::Measurement;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::Instant;

    fn stream(measurements: &[Measurement]) -> UserStream {
        Grouper::new(IgnoreSet::none())
            .group(measurements)
            .into_user_streams()
            .remove(0)
    }

    fn hr(t: i64, value: f64) -> Measurement {
        Measurement::new(t, 1, MeasurementKind::HeartRate, vec![value])
    }

    #[test]
    fn test_routing_modes() {
        let unified = Routing::default();
        assert_eq!(unified.topic_for(MeasurementKind::HeartRate), "sensor/howdy/data");

        let per_kind = Routing::new("sensor/howdy/", TopicMode::PerKind);
        assert_eq!(
            per_kind.topic_for(MeasurementKind::PhoneLatitude),
            "sensor/howdy/PhoneLatitude"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_and_waits_recorded_gaps() {
        let transport = Arc::new(RecordingTransport::new());
        let mut scheduler = ReplayScheduler::new(
            "user1.json",
            stream(&[
                hr(100, 72.0),
                Measurement::new(100, 1, MeasurementKind::AccelerationX, vec![0.1]),
                hr(102, 75.0),
            ]),
            Arc::clone(&transport),
        );
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let start = Instant::now();
        let outcome = scheduler.run(&CancellationToken::new()).await;

        assert_eq!(outcome.state, SchedulerState::Completed);
        assert_eq!(outcome.groups_emitted, 2);
        assert_eq!(outcome.messages_published, 3);

        let messages = transport.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].at - start, Duration::ZERO);
        assert_eq!(messages[1].at - start, Duration::ZERO);
        assert_eq!(messages[2].at - start, Duration::from_secs(2));
        // no trailing wait after the last group
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_emits_immediately() {
        let transport = Arc::new(RecordingTransport::new());
        let mut records = stream(&[hr(5, 60.0), hr(6, 61.0)]);
        records.records[1].timestamp = 5;

        let start = Instant::now();
        let outcome = ReplayScheduler::new("s", records, Arc::clone(&transport))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.state, SchedulerState::Completed);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(transport.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_emits_nothing() {
        let transport = Arc::new(RecordingTransport::new());
        let token = CancellationToken::new();
        token.cancel();

        let mut scheduler =
            ReplayScheduler::new("s", stream(&[hr(1, 60.0), hr(2, 61.0)]), Arc::clone(&transport));
        let outcome = scheduler.run(&token).await;

        assert_eq!(outcome.state, SchedulerState::Cancelled);
        assert_eq!(outcome.groups_emitted, 0);
        assert!(transport.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let transport = Arc::new(RecordingTransport::new());
        let token = CancellationToken::new();
        let mut scheduler =
            ReplayScheduler::new("s", stream(&[hr(0, 60.0), hr(3600, 61.0)]), Arc::clone(&transport));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let outcome = scheduler.run(&token).await;

        assert_eq!(outcome.state, SchedulerState::Cancelled);
        assert_eq!(outcome.groups_emitted, 1);
        assert_eq!(transport.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_are_not_fatal() {
        let transport = Arc::new(RecordingTransport::new().failing_calls([0, 2]));
        let outcome = ReplayScheduler::new(
            "s",
            stream(&[hr(1, 60.0), hr(2, 61.0), hr(3, 62.0)]),
            Arc::clone(&transport),
        )
        .run(&CancellationToken::new())
        .await;

        assert_eq!(outcome.state, SchedulerState::Completed);
        assert_eq!(outcome.groups_emitted, 3);
        assert_eq!(outcome.messages_published, 1);
        assert_eq!(outcome.publish_failures, 2);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_shortens_waits() {
        let transport = Arc::new(RecordingTransport::new());
        let start = Instant::now();
        ReplayScheduler::new("s", stream(&[hr(0, 1.0), hr(10, 2.0)]), Arc::clone(&transport))
            .with_speed(4.0)
            .run(&CancellationToken::new())
            .await;

        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_publishes_nothing() {
        let transport = Arc::new(RecordingTransport::new());
        let mut scheduler =
            ReplayScheduler::new("s", stream(&[hr(1, 60.0)]), Arc::clone(&transport));

        scheduler.run(&CancellationToken::new()).await;
        let again = scheduler.run(&CancellationToken::new()).await;

        assert_eq!(again.state, SchedulerState::Completed);
        assert_eq!(transport.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_carries_kind_and_user() {
        let transport = Arc::new(RecordingTransport::new());
        ReplayScheduler::new("s", stream(&[hr(1, 60.0)]), Arc::clone(&transport))
            .with_routing(Routing::new("t", TopicMode::PerKind))
            .run(&CancellationToken::new())
            .await;

        let published = &transport.messages()[0];
        assert_eq!(published.topic, "t/HeartRate");
        let message = published.message().unwrap();
        assert_eq!(message.kind, MeasurementKind::HeartRate);
        assert_eq!(message.user_id, 1);
        assert_eq!(message.values, vec![60.0]);
    }
}
