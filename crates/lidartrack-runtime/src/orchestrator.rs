//! [`FrameOrchestrator`] – one perception pass per assembled frame.
//!
//! Each frame, in assembly order:
//!
//! 1. **Order check** – a frame older than its predecessor is counted and
//!    skipped; it is never reprocessed.
//! 2. **Background** – housekeeping tick, then foreground/background label
//!    for every point.
//! 3. **Cluster** – foreground points grouped into sensor-frame clusters.
//! 4. **Transform** – clusters moved to the site frame under one pose
//!    snapshot.  A missing or stale pose is counted and the tracker sees an
//!    empty frame, so live tracks age out instead of freezing.
//! 5. **Track** – predict, associate, update, birth, delete.
//! 6. **Publish** – a new immutable [`PipelineSnapshot`] is swapped in and
//!    frame/track events go out on the [`EventBus`].
//!
//! The orchestrator is the single writer of the background grid and the
//! live track set; nothing else holds a reference to either.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use lidartrack_middleware::bus::{AnomalyKind, EventBus, EventPayload, PipelineEvent};
use lidartrack_middleware::FrameSource;
use lidartrack_perception::background::{BackgroundConfig, BackgroundGrid};
use lidartrack_perception::cluster::{ClusterConfig, Clusterer};
use lidartrack_perception::pose::PoseRegistry;
use lidartrack_perception::transform::{TransformError, WorldTransformer};
use lidartrack_tracking::tracker::{Tracker, TrackerConfig};
use lidartrack_types::{
    ConfigError, FinishedTrack, Frame, PipelineCounters, Point, TrackObservation, UnixNanos,
    WorldCluster, nanos_to_secs,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::snapshot::PipelineSnapshot;

/// Weight of the newest inter-frame interval in the frame-rate estimate.
const FPS_SMOOTHING: f64 = 0.1;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub sensor_id: String,
    pub background: BackgroundConfig,
    pub cluster: ClusterConfig,
    pub tracker: TrackerConfig,
    /// Frames of world clusters kept for the recent-clusters view.
    pub recent_cluster_frames: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sensor_id: "lidar-01".to_string(),
            background: BackgroundConfig::default(),
            cluster: ClusterConfig::default(),
            tracker: TrackerConfig::default(),
            recent_cluster_frames: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor_id.trim().is_empty() {
            return Err(ConfigError::invalid("sensor_id", "must not be empty"));
        }
        self.background.validate()?;
        self.cluster.validate()?;
        self.tracker.validate()
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Processed {
        foreground_points: usize,
        clusters: usize,
        tracks_live: usize,
    },
    /// Clusters could not be placed in the site frame.
    NoPose(TransformError),
    OutOfOrder { frame_ns: UnixNanos, last_ns: UnixNanos },
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameOrchestrator
// ─────────────────────────────────────────────────────────────────────────────

pub struct FrameOrchestrator {
    sensor_id: String,
    background: BackgroundGrid,
    clusterer: Clusterer,
    transformer: WorldTransformer,
    tracker: Tracker,
    bus: EventBus,
    publisher: watch::Sender<Arc<PipelineSnapshot>>,
    counters: PipelineCounters,
    last_frame_ns: Option<UnixNanos>,
    last_sequence: Option<u64>,
    frames_per_sec: f64,
    recent_cluster_frames: usize,
    recent_clusters: VecDeque<Vec<WorldCluster>>,
    finished: VecDeque<(FinishedTrack, Arc<Vec<TrackObservation>>)>,
}

impl FrameOrchestrator {
    /// Validate the configuration and allocate every stage.
    pub fn new(config: OrchestratorConfig, registry: Arc<PoseRegistry>, bus: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        let background = BackgroundGrid::new(config.background)?;
        let clusterer = Clusterer::new(config.cluster)?;
        let tracker = Tracker::new(config.tracker)?;
        let (publisher, _) = watch::channel(Arc::new(PipelineSnapshot {
            sensor_id: config.sensor_id.clone(),
            ..PipelineSnapshot::default()
        }));
        info!(sensor_id = %config.sensor_id, "frame orchestrator ready");
        Ok(Self {
            sensor_id: config.sensor_id,
            background,
            clusterer,
            transformer: WorldTransformer::new(registry),
            tracker,
            bus,
            publisher,
            counters: PipelineCounters::default(),
            last_frame_ns: None,
            last_sequence: None,
            frames_per_sec: 0.0,
            recent_cluster_frames: config.recent_cluster_frames.max(1),
            recent_clusters: VecDeque::new(),
            finished: VecDeque::new(),
        })
    }

    /// A receiver that always holds the latest published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PipelineSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker {
        &mut self.tracker
    }

    /// Consume frames until the source ends or shutdown is signalled.  A
    /// frame already in progress completes; no new frame starts afterwards.
    pub async fn run<S: FrameSource>(mut self, mut source: S, mut shutdown: watch::Receiver<bool>) -> PipelineCounters {
        info!(sensor_id = %self.sensor_id, "frame orchestrator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let frame = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                frame = source.next_frame() => frame,
            };
            let Some(frame) = frame else { break };
            if *shutdown.borrow() {
                debug!(sequence = frame.sequence, "shutdown in progress, frame not started");
                break;
            }
            self.process_frame(&frame);
        }
        info!(
            sensor_id = %self.sensor_id,
            frames = self.counters.frames_processed,
            tracks_born = self.counters.tracks_born,
            "frame orchestrator stopped"
        );
        self.counters
    }

    /// Run the full pipeline for one frame and publish the result.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameOutcome {
        let span = info_span!("frame", sensor_id = %self.sensor_id, sequence = frame.sequence);
        let _enter = span.enter();
        let started = Instant::now();
        let now = frame.timestamp_ns;

        if let Some(last) = self.last_frame_ns
            && now < last
        {
            self.counters.out_of_order_frames += 1;
            self.anomaly(
                AnomalyKind::OutOfOrderFrame,
                self.counters.out_of_order_frames,
                format!("frame {} at {now} ns precedes {last} ns", frame.sequence),
            );
            return FrameOutcome::OutOfOrder { frame_ns: now, last_ns: last };
        }

        // Background.
        self.background.tick(now);
        let labels = self.background.classify_frame(&frame.points, now);
        let foreground: Vec<Point> = frame
            .points
            .iter()
            .zip(&labels)
            .filter(|(_, l)| l.is_foreground)
            .map(|(p, _)| *p)
            .collect();

        // Cluster and transform.
        let sensor_clusters = self.clusterer.cluster(&foreground, now);
        let mut pose_error = None;
        let world = match self.transformer.frame_to_world(&sensor_clusters, &self.sensor_id, now) {
            Ok(world) => world,
            Err(e) => {
                let (kind, count) = match &e {
                    TransformError::MissingPose { .. } => {
                        self.counters.missing_pose += 1;
                        (AnomalyKind::MissingPose, self.counters.missing_pose)
                    }
                    TransformError::StalePose { .. } => {
                        self.counters.stale_pose += 1;
                        (AnomalyKind::StalePose, self.counters.stale_pose)
                    }
                };
                self.anomaly(kind, count, e.to_string());
                pose_error = Some(e);
                Vec::new()
            }
        };

        // Track.
        let step = match self.tracker.step(now, &world) {
            Ok(step) => step,
            Err(e) => {
                self.counters.out_of_order_frames += 1;
                self.anomaly(AnomalyKind::OutOfOrderFrame, self.counters.out_of_order_frames, e.to_string());
                return FrameOutcome::OutOfOrder {
                    frame_ns: now,
                    last_ns: self.tracker.last_step_ns().unwrap_or(now),
                };
            }
        };
        for id in &step.degenerate {
            self.counters.degenerate_covariance += 1;
            self.anomaly(
                AnomalyKind::DegenerateCovariance,
                self.counters.degenerate_covariance,
                format!("track {id} covariance reset"),
            );
        }
        self.counters.tracks_born += step.born.len() as u64;
        self.counters.tracks_finished += step.finished.len() as u64;
        let retention = self.tracker.config().finished_retention;
        for track in &step.finished {
            let record = track.finish();
            self.bus.publish(PipelineEvent::new(&self.sensor_id, EventPayload::TrackFinished(record.clone())));
            if retention > 0 {
                self.finished.push_back((record, Arc::clone(track.history())));
                while self.finished.len() > retention {
                    self.finished.pop_front();
                }
            }
        }

        // Book-keeping and publish.
        if let Some(last) = self.last_frame_ns
            && now > last
        {
            let instant = 1.0 / nanos_to_secs(now - last);
            self.frames_per_sec = if self.frames_per_sec == 0.0 {
                instant
            } else {
                (1.0 - FPS_SMOOTHING) * self.frames_per_sec + FPS_SMOOTHING * instant
            };
        }
        self.last_frame_ns = Some(now);
        self.last_sequence = Some(frame.sequence);
        self.counters.frames_processed += 1;

        let clusters = world.len();
        self.recent_clusters.push_back(world);
        while self.recent_clusters.len() > self.recent_cluster_frames {
            self.recent_clusters.pop_front();
        }

        let tracks_live = step.snapshots.len();
        self.publish(step.snapshots);

        self.bus.publish(PipelineEvent::new(
            &self.sensor_id,
            EventPayload::FrameSummary {
                sequence: frame.sequence,
                frame_ns: now,
                points: frame.points.len(),
                foreground_points: foreground.len(),
                clusters,
                tracks_live,
                elapsed_us: started.elapsed().as_micros() as u64,
            },
        ));
        debug!(
            points = frame.points.len(),
            foreground = foreground.len(),
            clusters,
            tracks_live,
            elapsed_us = started.elapsed().as_micros() as u64,
            "frame processed"
        );

        match pose_error {
            Some(e) => FrameOutcome::NoPose(e),
            None => FrameOutcome::Processed {
                foreground_points: foreground.len(),
                clusters,
                tracks_live,
            },
        }
    }

    fn publish(&self, tracks: Vec<lidartrack_types::TrackSnapshot>) {
        let mut histories: HashMap<Uuid, Arc<Vec<TrackObservation>>> = self
            .finished
            .iter()
            .map(|(record, history)| (record.track_id, Arc::clone(history)))
            .collect();
        for track in self.tracker.tracks() {
            histories.insert(track.id, Arc::clone(track.history()));
        }
        let snapshot = PipelineSnapshot {
            sensor_id: self.sensor_id.clone(),
            frame_ns: self.last_frame_ns.unwrap_or_default(),
            sequence: self.last_sequence,
            frames_per_sec: self.frames_per_sec,
            foreground: self.background.diagnostics(),
            counters: self.counters,
            tracks,
            recent_clusters: self.recent_clusters.iter().flatten().cloned().collect(),
            histories,
            finished: self.finished.iter().map(|(record, _)| record.clone()).collect(),
        };
        self.publisher.send_replace(Arc::new(snapshot));
    }

    /// Log (first and every 1000th occurrence) and broadcast an anomaly.
    fn anomaly(&self, kind: AnomalyKind, count: u64, detail: String) {
        if count == 1 || count % 1000 == 0 {
            warn!(sensor_id = %self.sensor_id, ?kind, count, %detail, "pipeline anomaly");
        }
        self.bus.publish(PipelineEvent::new(&self.sensor_id, EventPayload::Anomaly { kind, detail }));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
