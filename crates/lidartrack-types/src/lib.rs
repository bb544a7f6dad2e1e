//! `lidartrack-types` – shared data model.
//!
//! Everything that crosses a crate boundary lives here: sensor-frame
//! [`Point`]s and assembled [`Frame`]s coming in, world-frame
//! [`WorldCluster`]s flowing from perception into tracking, and the JSON
//! shapes ([`TrackSnapshot`], [`HealthReport`], [`ForegroundDiagnostics`], …)
//! that external tooling reads off the monitoring boundary.  Field names of
//! the serialised shapes are part of the external contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Nanoseconds since the Unix epoch.  All pipeline time is carried in this
/// unit so frame ordering can be compared without floating-point drift.
pub type UnixNanos = i64;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Convert a nanosecond interval to seconds.
pub fn nanos_to_secs(ns: i64) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor-frame input
// ────────────────────────────────────────────────────────────────────────────

/// One sensor-frame LiDAR return.
///
/// Produced by a packet parser, immutable afterwards.  The Cartesian
/// coordinates are derived once from the polar measurement so the clusterer
/// never repeats the trigonometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Measured range (metres).
    pub range_m: f32,
    /// Horizontal angle in `[0, 360)` degrees, counter-clockwise from +X.
    pub azimuth_deg: f32,
    /// Vertical angle of the laser channel (degrees, positive up).
    pub elevation_deg: f32,
    /// Hardware channel index.
    pub ring: u16,
    /// Reflectivity as reported by the device.
    pub intensity: u8,
    /// Per-point capture time.
    pub timestamp_ns: UnixNanos,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point {
    /// Build a point from its polar measurement.
    pub fn from_polar(
        range_m: f32,
        azimuth_deg: f32,
        elevation_deg: f32,
        ring: u16,
        intensity: u8,
        timestamp_ns: UnixNanos,
    ) -> Self {
        let azimuth_deg = azimuth_deg.rem_euclid(360.0);
        let az = azimuth_deg.to_radians();
        let el = elevation_deg.to_radians();
        let horizontal = range_m * el.cos();
        Self {
            range_m,
            azimuth_deg,
            elevation_deg,
            ring,
            intensity,
            timestamp_ns,
            x: horizontal * az.cos(),
            y: horizontal * az.sin(),
            z: range_m * el.sin(),
        }
    }
}

/// One assembled sensor revolution, processed as a single pipeline unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic assembly sequence number.
    pub sequence: u64,
    /// Capture time of the first point in the frame.
    pub timestamp_ns: UnixNanos,
    pub points: Vec<Point>,
}

// ────────────────────────────────────────────────────────────────────────────
// World-frame detections
// ────────────────────────────────────────────────────────────────────────────

/// One detected object in the site frame.
///
/// Always stamped with the pose identifier of the transform that produced
/// its coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldCluster {
    pub sensor_id: String,
    pub world_frame: String,
    pub pose_id: String,
    pub unix_nanos: UnixNanos,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Orientation of the bounding box's long axis in the world XY plane.
    pub heading_rad: f64,
    pub bbox_l: f32,
    pub bbox_w: f32,
    pub bbox_h: f32,
    pub points_count: u32,
    pub height_p95: f32,
    pub intensity_mean: f32,
    /// Sensor-frame ring of the member closest to the centroid (diagnostics).
    pub ring_hint: Option<u16>,
    /// Sensor-frame azimuth of the member closest to the centroid (diagnostics).
    pub azimuth_hint_deg: Option<f32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Track output shapes
// ────────────────────────────────────────────────────────────────────────────

/// One historical sample of a track, appended on every matched update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackObservation {
    pub track_id: Uuid,
    pub pose_id: String,
    pub unix_nanos: UnixNanos,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed_mps: f64,
    pub heading_rad: f64,
    pub bbox_l: f32,
    pub bbox_w: f32,
    pub bbox_h: f32,
    pub points_count: u32,
    pub height_p95: f32,
    pub intensity_mean: f32,
}

/// Latest state of one live track, as served by the recent-tracks route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub track_id: Uuid,
    pub sensor_id: String,
    pub world_frame: String,
    pub pose_id: String,
    pub unix_nanos: UnixNanos,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed_mps: f64,
    pub heading_rad: f64,
    pub bbox_l: f32,
    pub bbox_w: f32,
    pub bbox_h: f32,
    pub points_count: u32,
    pub height_p95: f32,
    pub intensity_mean: f32,
    /// Empty when no external classifier has labelled the track.
    pub class_label: String,
    /// `0.0` when unset.
    pub class_conf: f32,
}

/// Immutable record of a track removed from the live set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedTrack {
    pub track_id: Uuid,
    pub sensor_id: String,
    pub world_frame: String,
    pub pose_id: String,
    pub first_seen_ns: UnixNanos,
    pub last_seen_ns: UnixNanos,
    pub observation_count: u32,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    pub max_height_p95: f32,
    pub bbox_l_avg: f32,
    pub bbox_w_avg: f32,
    pub bbox_h_avg: f32,
    pub class_label: String,
    pub class_conf: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Monitoring shapes
// ────────────────────────────────────────────────────────────────────────────

/// Health summary for one sensor pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub udp_active: bool,
    pub last_packet_ns: i64,
    pub frames_per_sec: f64,
    pub bg_bins_frozen: u64,
    pub foreground_points: u64,
    pub tracks_live: u64,
}

/// Background-model counters, copied verbatim from the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundDiagnostics {
    pub foreground_points: u64,
    pub background_points: u64,
    pub bins_frozen: u64,
}

/// Counters for transient conditions inside the frame pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub frames_processed: u64,
    pub out_of_order_frames: u64,
    pub missing_pose: u64,
    pub stale_pose: u64,
    pub degenerate_covariance: u64,
    pub tracks_born: u64,
    pub tracks_finished: u64,
}

/// Counters for the ingest side (socket, parser, assembler).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounters {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_malformed: u64,
    pub frames_assembled: u64,
    pub frames_dropped: u64,
    pub last_packet_ns: i64,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Invalid tunable detected at startup.  Always fatal: the process does not
/// begin ingesting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("background grid of {cells} cells exceeds the limit of {max}")]
    GridTooLarge { cells: usize, max: usize },

    #[error("config file error: {0}")]
    File(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Global error type used at the service boundary.
#[derive(Error, Debug)]
pub enum LidarError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
