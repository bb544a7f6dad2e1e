//! Multi-object tracker.
//!
//! # Per-frame policy
//! 1. **Predict** every live track to `now` (constant velocity).
//! 2. **Associate** predicted positions with world clusters by squared
//!    Mahalanobis distance, gated and greedy.  A track only ever matches
//!    clusters stamped with its own pose identifier.
//! 3. **Update** matched tracks, append an observation and roll up
//!    bounding-box averages and speed/height extremes.
//! 4. **Miss** every track that was not updated.
//! 5. **Delete** tracks unseen for longer than `max_miss_ms`; they leave as
//!    [`Track`] values the caller turns into finished records.
//! 6. **Birth** a track for every unclaimed cluster.
//!
//! A singular innovation covariance or a non-finite prediction/update never
//! reaches the published state: the track keeps its last finite estimate,
//! its covariance is reset to the prior, it counts as missed this frame, and
//! its identifier is reported in [`StepOutput::degenerate`].

use std::sync::Arc;

use lidartrack_types::{
    ConfigError, FinishedTrack, NANOS_PER_MILLI, TrackObservation, TrackSnapshot, UnixNanos,
    WorldCluster, nanos_to_secs,
};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::association::{Candidate, greedy_assign};
use crate::kalman::{self, Covariance, CvFilter, Innovation, NoiseConfig, State};

/// Below this speed the velocity direction is noise; report the bounding
/// box axis instead.
const HEADING_MIN_SPEED_MPS: f64 = 0.5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(flatten)]
    pub noise: NoiseConfig,
    /// Association gate on the squared Mahalanobis distance (χ², 2 dof, 99 %).
    pub gate_mahalanobis_sq: f64,
    /// A track unseen for longer than this is deleted.
    pub max_miss_ms: u64,
    /// Finished tracks whose histories stay queryable after deletion.
    pub finished_retention: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            noise: NoiseConfig::default(),
            gate_mahalanobis_sq: 9.21,
            max_miss_ms: 500,
            finished_retention: 256,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.noise.validate()?;
        if !(self.gate_mahalanobis_sq.is_finite() && self.gate_mahalanobis_sq > 0.0) {
            return Err(ConfigError::invalid(
                "tracker.gate_mahalanobis_sq",
                format!("{} must be positive", self.gate_mahalanobis_sq),
            ));
        }
        if self.max_miss_ms == 0 {
            return Err(ConfigError::invalid("tracker.max_miss_ms", "must be at least 1 ms"));
        }
        Ok(())
    }

    fn max_miss_ns(&self) -> i64 {
        (self.max_miss_ms as i64).saturating_mul(NANOS_PER_MILLI)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    #[error("frame at {now} ns is older than the previous frame at {last} ns")]
    OutOfOrder { now: UnixNanos, last: UnixNanos },
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

/// One live object hypothesis.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub sensor_id: String,
    pub world_frame: String,
    pub pose_id: String,
    pub first_seen_ns: UnixNanos,
    pub last_seen_ns: UnixNanos,
    /// Consecutive frames without a match.
    pub misses: u32,
    pub class_label: String,
    pub class_conf: f32,
    state: State,
    cov: Covariance,
    /// Time the state estimate refers to.
    state_ns: UnixNanos,
    observations: u32,
    bbox_avg: [f32; 3],
    speed_sum: f64,
    peak_speed: f64,
    max_height_p95: f32,
    latest: WorldCluster,
    history: Arc<Vec<TrackObservation>>,
}

impl Track {
    fn born(cluster: &WorldCluster, now: UnixNanos, filter: &CvFilter) -> Self {
        let (state, cov) = filter.initiate(cluster.x, cluster.y);
        let mut track = Self {
            id: Uuid::new_v4(),
            sensor_id: cluster.sensor_id.clone(),
            world_frame: cluster.world_frame.clone(),
            pose_id: cluster.pose_id.clone(),
            first_seen_ns: now,
            last_seen_ns: now,
            misses: 0,
            class_label: String::new(),
            class_conf: 0.0,
            state,
            cov,
            state_ns: now,
            observations: 0,
            bbox_avg: [0.0; 3],
            speed_sum: 0.0,
            peak_speed: 0.0,
            max_height_p95: f32::NEG_INFINITY,
            latest: cluster.clone(),
            history: Arc::new(Vec::new()),
        };
        track.observe(cluster, now);
        track
    }

    pub fn position(&self) -> (f64, f64) {
        (self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.state[2], self.state[3])
    }

    pub fn speed(&self) -> f64 {
        self.state[2].hypot(self.state[3])
    }

    pub fn covariance(&self) -> &Covariance {
        &self.cov
    }

    pub fn observation_count(&self) -> u32 {
        self.observations
    }

    /// Direction of travel, or the box axis while nearly stationary.
    pub fn heading(&self) -> f64 {
        if self.speed() >= HEADING_MIN_SPEED_MPS {
            self.state[3].atan2(self.state[2])
        } else {
            self.latest.heading_rad
        }
    }

    /// Every matched observation so far, oldest first.
    pub fn history(&self) -> &Arc<Vec<TrackObservation>> {
        &self.history
    }

    /// Record a matched cluster: rollups plus one history sample.
    fn observe(&mut self, cluster: &WorldCluster, now: UnixNanos) {
        self.observations += 1;
        let n = self.observations as f32;
        let sample = [cluster.bbox_l, cluster.bbox_w, cluster.bbox_h];
        for (avg, value) in self.bbox_avg.iter_mut().zip(sample) {
            *avg += (value - *avg) / n;
        }
        let speed = self.speed();
        self.speed_sum += speed;
        self.peak_speed = self.peak_speed.max(speed);
        self.max_height_p95 = self.max_height_p95.max(cluster.height_p95);
        self.latest = cluster.clone();

        let (vx, vy) = self.velocity();
        let observation = TrackObservation {
            track_id: self.id,
            pose_id: self.pose_id.clone(),
            unix_nanos: now,
            x: self.state[0],
            y: self.state[1],
            vx,
            vy,
            speed_mps: speed,
            heading_rad: self.heading(),
            bbox_l: cluster.bbox_l,
            bbox_w: cluster.bbox_w,
            bbox_h: cluster.bbox_h,
            points_count: cluster.points_count,
            height_p95: cluster.height_p95,
            intensity_mean: cluster.intensity_mean,
        };
        Arc::make_mut(&mut self.history).push(observation);
    }

    /// Latest state in the recent-tracks shape.
    pub fn snapshot(&self) -> TrackSnapshot {
        let (vx, vy) = self.velocity();
        TrackSnapshot {
            track_id: self.id,
            sensor_id: self.sensor_id.clone(),
            world_frame: self.world_frame.clone(),
            pose_id: self.pose_id.clone(),
            unix_nanos: self.state_ns,
            x: self.state[0],
            y: self.state[1],
            vx,
            vy,
            speed_mps: self.speed(),
            heading_rad: self.heading(),
            bbox_l: self.bbox_avg[0],
            bbox_w: self.bbox_avg[1],
            bbox_h: self.bbox_avg[2],
            points_count: self.latest.points_count,
            height_p95: self.latest.height_p95,
            intensity_mean: self.latest.intensity_mean,
            class_label: self.class_label.clone(),
            class_conf: self.class_conf,
        }
    }

    /// Immutable summary handed to analytics once the track is deleted.
    pub fn finish(&self) -> FinishedTrack {
        FinishedTrack {
            track_id: self.id,
            sensor_id: self.sensor_id.clone(),
            world_frame: self.world_frame.clone(),
            pose_id: self.pose_id.clone(),
            first_seen_ns: self.first_seen_ns,
            last_seen_ns: self.last_seen_ns,
            observation_count: self.observations,
            avg_speed_mps: self.speed_sum / self.observations.max(1) as f64,
            peak_speed_mps: self.peak_speed,
            max_height_p95: self.max_height_p95,
            bbox_l_avg: self.bbox_avg[0],
            bbox_w_avg: self.bbox_avg[1],
            bbox_h_avg: self.bbox_avg[2],
            class_label: self.class_label.clone(),
            class_conf: self.class_conf,
        }
    }

    /// Drop the covariance back to the prior, keeping the last finite state.
    fn recover(&mut self, filter: &CvFilter, reason: &str) {
        warn!(track_id = %self.id, reason, "degenerate track covariance, reset to prior");
        self.cov = filter.prior_covariance();
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Everything one [`Tracker::step`] produced besides the mutated live set.
#[derive(Debug, Default)]
pub struct StepOutput {
    /// Latest state of every live track, in birth order.
    pub snapshots: Vec<TrackSnapshot>,
    pub born: Vec<Uuid>,
    /// Tracks deleted this frame.
    pub finished: Vec<Track>,
    /// Tracks whose covariance had to be reset this frame.
    pub degenerate: Vec<Uuid>,
    /// Clusters ignored because their centroid was not finite.
    pub rejected_clusters: u32,
}

pub struct Tracker {
    config: TrackerConfig,
    filter: CvFilter,
    tracks: Vec<Track>,
    last_step_ns: Option<UnixNanos>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            filter: CvFilter::new(config.noise.clone()),
            config,
            tracks: Vec::new(),
            last_step_ns: None,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: Uuid) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn last_step_ns(&self) -> Option<UnixNanos> {
        self.last_step_ns
    }

    /// Attach an externally computed label to a live track.  Returns `false`
    /// when no live track has that identifier.
    pub fn set_classification(&mut self, id: Uuid, label: impl Into<String>, confidence: f32) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(track) => {
                track.class_label = label.into();
                track.class_conf = confidence.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    /// Advance the live set to `now` and fold in this frame's clusters.
    ///
    /// Fails without touching any state when `now` is older than the
    /// previous step.
    pub fn step(&mut self, now: UnixNanos, clusters: &[WorldCluster]) -> Result<StepOutput, TrackerError> {
        if let Some(last) = self.last_step_ns
            && now < last
        {
            return Err(TrackerError::OutOfOrder { now, last });
        }
        self.last_step_ns = Some(now);
        let mut out = StepOutput::default();

        // ── Predict ──────────────────────────────────────────────────────
        let mut innovations: Vec<Option<Innovation>> = Vec::with_capacity(self.tracks.len());
        for track in &mut self.tracks {
            let dt = nanos_to_secs(now - track.state_ns);
            let (state, cov) = self.filter.predict(&track.state, &track.cov, dt);
            track.state_ns = now;
            if kalman::is_finite(&state, &cov) {
                track.state = state;
                track.cov = cov;
            } else {
                track.recover(&self.filter, "non-finite prediction");
                out.degenerate.push(track.id);
                innovations.push(None);
                continue;
            }
            match self.filter.innovation(&track.state, &track.cov) {
                Ok(inn) => innovations.push(Some(inn)),
                Err(e) => {
                    track.recover(&self.filter, &e.to_string());
                    out.degenerate.push(track.id);
                    innovations.push(None);
                }
            }
        }

        // ── Associate ────────────────────────────────────────────────────
        let valid: Vec<bool> = clusters
            .iter()
            .map(|c| c.x.is_finite() && c.y.is_finite())
            .collect();
        out.rejected_clusters = valid.iter().filter(|v| !**v).count() as u32;
        if out.rejected_clusters > 0 {
            warn!(count = out.rejected_clusters, "ignoring clusters with non-finite centroid");
        }

        let mut candidates = Vec::new();
        for (i, (track, inn)) in self.tracks.iter().zip(&innovations).enumerate() {
            let Some(inn) = inn else { continue };
            for (j, cluster) in clusters.iter().enumerate() {
                if !valid[j] || cluster.pose_id != track.pose_id {
                    continue;
                }
                candidates.push(Candidate {
                    track_idx: i,
                    cluster_idx: j,
                    d2: inn.mahalanobis_sq(&Vector2::new(cluster.x, cluster.y)),
                });
            }
        }
        let assignment = greedy_assign(
            self.tracks.len(),
            clusters.len(),
            candidates,
            self.config.gate_mahalanobis_sq,
        );

        // ── Update ───────────────────────────────────────────────────────
        let mut updated = vec![false; self.tracks.len()];
        for &(i, j) in &assignment.matches {
            let track = &mut self.tracks[i];
            let cluster = &clusters[j];
            let z = Vector2::new(cluster.x, cluster.y);
            match self.filter.update(&track.state, &track.cov, &z) {
                Ok((state, cov)) => {
                    track.state = state;
                    track.cov = cov;
                    track.misses = 0;
                    track.last_seen_ns = now;
                    track.observe(cluster, now);
                    updated[i] = true;
                }
                Err(e) => {
                    track.recover(&self.filter, &e.to_string());
                    out.degenerate.push(track.id);
                }
            }
        }
        for (track, _) in self.tracks.iter_mut().zip(&updated).filter(|(_, u)| !**u) {
            track.misses += 1;
        }

        // ── Delete ───────────────────────────────────────────────────────
        let max_miss = self.config.max_miss_ns();
        let (gone, live): (Vec<Track>, Vec<Track>) = std::mem::take(&mut self.tracks)
            .into_iter()
            .partition(|t| now - t.last_seen_ns > max_miss);
        self.tracks = live;
        for track in &gone {
            info!(
                track_id = %track.id,
                observations = track.observations,
                lifetime_s = nanos_to_secs(track.last_seen_ns - track.first_seen_ns),
                "track finished"
            );
        }
        out.finished = gone;

        // ── Birth ────────────────────────────────────────────────────────
        for j in assignment.unmatched_clusters {
            if !valid[j] {
                continue;
            }
            let track = Track::born(&clusters[j], now, &self.filter);
            debug!(track_id = %track.id, x = track.state[0], y = track.state[1], pose_id = %track.pose_id, "track born");
            out.born.push(track.id);
            self.tracks.push(track);
        }

        out.snapshots = self.tracks.iter().map(Track::snapshot).collect();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
