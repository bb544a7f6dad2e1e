//! Published pipeline state.
//!
//! The orchestrator builds a fresh [`PipelineSnapshot`] after every frame and
//! swaps it into a `tokio::sync::watch` channel as an `Arc`.  Readers clone
//! the `Arc` and never hold a lock the orchestrator could wait on; an old
//! snapshot is freed when its last reader lets go.

use std::collections::HashMap;
use std::sync::Arc;

use lidartrack_middleware::IngestStats;
use lidartrack_types::{
    FinishedTrack, ForegroundDiagnostics, HealthReport, IngestCounters, PipelineCounters,
    TrackObservation, TrackSnapshot, UnixNanos, WorldCluster,
};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

/// Immutable view of one sensor pipeline after a frame.
#[derive(Debug, Clone, Default)]
pub struct PipelineSnapshot {
    pub sensor_id: String,
    /// Capture time of the frame this snapshot reflects (0 before the first).
    pub frame_ns: UnixNanos,
    pub sequence: Option<u64>,
    pub frames_per_sec: f64,
    pub foreground: ForegroundDiagnostics,
    pub counters: PipelineCounters,
    pub tracks: Vec<TrackSnapshot>,
    /// World clusters of the most recent frames, oldest first.
    pub recent_clusters: Vec<WorldCluster>,
    /// Observation histories of live and recently finished tracks.
    pub histories: HashMap<Uuid, Arc<Vec<TrackObservation>>>,
    /// Most recent finished records, oldest first.
    pub finished: Vec<FinishedTrack>,
}

/// Every counter the monitoring boundary exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CountersReport {
    pub pipeline: PipelineCounters,
    pub ingest: IngestCounters,
    pub foreground: ForegroundDiagnostics,
}

/// Read-only handle combining the latest snapshot with live ingest stats.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    snapshots: watch::Receiver<Arc<PipelineSnapshot>>,
    ingest: Arc<IngestStats>,
    udp_window_ns: i64,
}

impl SnapshotReader {
    /// `udp_window_ns`: how recent the last datagram must be for the socket
    /// to count as active.
    pub fn new(
        snapshots: watch::Receiver<Arc<PipelineSnapshot>>,
        ingest: Arc<IngestStats>,
        udp_window_ns: i64,
    ) -> Self {
        Self {
            snapshots,
            ingest,
            udp_window_ns,
        }
    }

    pub fn latest(&self) -> Arc<PipelineSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn health(&self, now: UnixNanos) -> HealthReport {
        let snap = self.latest();
        HealthReport {
            udp_active: self.ingest.udp_active(now, self.udp_window_ns),
            last_packet_ns: self.ingest.last_packet_ns(),
            frames_per_sec: snap.frames_per_sec,
            bg_bins_frozen: snap.foreground.bins_frozen,
            foreground_points: snap.foreground.foreground_points,
            tracks_live: snap.tracks.len() as u64,
        }
    }

    pub fn foreground(&self) -> ForegroundDiagnostics {
        self.latest().foreground
    }

    pub fn tracks(&self) -> Vec<TrackSnapshot> {
        self.latest().tracks.clone()
    }

    pub fn history(&self, id: &Uuid) -> Option<Arc<Vec<TrackObservation>>> {
        self.latest().histories.get(id).cloned()
    }

    pub fn clusters(&self) -> Vec<WorldCluster> {
        self.latest().recent_clusters.clone()
    }

    pub fn counters(&self) -> CountersReport {
        let snap = self.latest();
        CountersReport {
            pipeline: snap.counters,
            ingest: self.ingest.snapshot(),
            foreground: snap.foreground,
        }
    }
}
