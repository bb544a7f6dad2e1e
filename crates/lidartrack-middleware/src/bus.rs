//! Typed, topic-based publish/subscribe bus for pipeline events.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every event and no subscriber can stall the publisher: a slow reader
//! lags and loses the oldest events, the orchestrator never waits.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Tracks`] | Finished track records for analytics consumers |
//! | [`Topic::Frames`] | One summary per processed frame |
//! | [`Topic::Anomalies`] | Missing/stale pose, out-of-order frames, degenerate covariance |

use chrono::{DateTime, Utc};
use lidartrack_types::{FinishedTrack, UnixNanos};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Buffered events per topic before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Tracks,
    Frames,
    Anomalies,
}

/// Kind of counted, non-fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MissingPose,
    StalePose,
    OutOfOrderFrame,
    DegenerateCovariance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TrackFinished(FinishedTrack),
    FrameSummary {
        sequence: u64,
        frame_ns: UnixNanos,
        points: usize,
        foreground_points: usize,
        clusters: usize,
        tracks_live: usize,
        elapsed_us: u64,
    },
    Anomaly {
        kind: AnomalyKind,
        detail: String,
    },
}

impl EventPayload {
    /// Lane an event of this kind travels on.
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::TrackFinished(_) => Topic::Tracks,
            EventPayload::FrameSummary { .. } => Topic::Frames,
            EventPayload::Anomaly { .. } => Topic::Anomalies,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub payload: EventPayload,
}

impl PipelineEvent {
    pub fn new(sensor_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sensor_id: sensor_id.into(),
            payload,
        }
    }
}

/// Shared event bus.  Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    tracks: broadcast::Sender<PipelineEvent>,
    frames: broadcast::Sender<PipelineEvent>,
    anomalies: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// `capacity` applies to each topic independently.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tracks, _) = broadcast::channel(capacity);
        let (frames, _) = broadcast::channel(capacity);
        let (anomalies, _) = broadcast::channel(capacity);
        Self {
            tracks,
            frames,
            anomalies,
        }
    }

    /// Publish on the event's own topic.
    ///
    /// Returns the number of subscribers handed the event; `0` when nobody
    /// listens, which is normal for a headless deployment.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        self.sender(event.payload.topic()).send(event).unwrap_or(0)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<PipelineEvent> {
        match topic {
            Topic::Tracks => &self.tracks,
            Topic::Frames => &self.frames,
            Topic::Anomalies => &self.anomalies,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to one [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl TopicReceiver {
    /// Next event on this topic, skipping over lag.  `None` once the bus is
    /// gone.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn anomaly(detail: &str) -> PipelineEvent {
        PipelineEvent::new(
            "lidar-01",
            EventPayload::Anomaly {
                kind: AnomalyKind::MissingPose,
                detail: detail.to_string(),
            },
        )
    }

    fn summary(sequence: u64) -> PipelineEvent {
        PipelineEvent::new(
            "lidar-01",
            EventPayload::FrameSummary {
                sequence,
                frame_ns: 0,
                points: 10,
                foreground_points: 2,
                clusters: 0,
                tracks_live: 0,
                elapsed_us: 5,
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(anomaly("no pose")), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe_to(Topic::Anomalies);
        let mut b = bus.subscribe_to(Topic::Anomalies);
        let event = anomaly("no pose");
        assert_eq!(bus.publish(event.clone()), 2);
        assert_eq!(a.recv().await.unwrap().id, event.id);
        assert_eq!(b.recv().await.unwrap().id, event.id);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let mut tracks = bus.subscribe_to(Topic::Tracks);
        let _frames = bus.subscribe_to(Topic::Frames);
        bus.publish(summary(1));
        let result = tokio::time::timeout(Duration::from_millis(50), tracks.recv()).await;
        assert!(result.is_err(), "tracks subscriber must not see frame summaries");
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Topic::Frames);
        for seq in 0..20 {
            bus.publish(summary(seq));
        }
        let first = slow.recv().await.unwrap();
        match first.payload {
            EventPayload::FrameSummary { sequence, .. } => assert_eq!(sequence, 16),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn receiver_ends_when_bus_dropped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tracks);
        drop(bus);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn payload_serialises_with_type_tag() {
        let json = serde_json::to_value(&anomaly("x").payload).unwrap();
        assert_eq!(json["type"], "anomaly");
        assert_eq!(json["kind"], "missing_pose");
    }
}
