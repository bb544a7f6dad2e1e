//! Frame assembly: cut the continuous point stream into revolutions.
//!
//! Two policies are supported.  `TimeWindow` closes a frame once a point's
//! capture time reaches the window start plus `window_ms`.  `SpinWrap`
//! closes a frame when the azimuth jumps backwards by more than half a turn
//! between consecutive points, i.e. the head passed 360° → 0°.
//!
//! Frames are numbered from 0 and stamped with the capture time of their
//! first point.  An empty frame is never emitted.

use lidartrack_types::{ConfigError, Frame, NANOS_PER_MILLI, Point, UnixNanos};
use serde::{Deserialize, Serialize};
use tracing::warn;

const WRAP_THRESHOLD_DEG: f32 = 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyMode {
    TimeWindow,
    SpinWrap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub mode: AssemblyMode,
    /// Frame length in `time_window` mode.
    pub window_ms: u64,
    /// Hard cap per frame; a runaway stream is cut rather than buffered.
    pub max_points_per_frame: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            mode: AssemblyMode::TimeWindow,
            window_ms: 100,
            max_points_per_frame: 500_000,
        }
    }
}

impl AssemblerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == AssemblyMode::TimeWindow && self.window_ms == 0 {
            return Err(ConfigError::invalid("assembler.window_ms", "must be at least 1 ms"));
        }
        if self.max_points_per_frame == 0 {
            return Err(ConfigError::invalid("assembler.max_points_per_frame", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FrameAssembler {
    config: AssemblerConfig,
    next_sequence: u64,
    window_start: Option<UnixNanos>,
    last_azimuth: Option<f32>,
    points: Vec<Point>,
}

impl FrameAssembler {
    pub fn new(config: AssemblerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            next_sequence: 0,
            window_start: None,
            last_azimuth: None,
            points: Vec::new(),
        })
    }

    /// Add one point; returns the frame it completed, if any.  The point
    /// itself always lands in the frame that is open afterwards.
    pub fn push(&mut self, point: Point) -> Option<Frame> {
        let boundary = match self.config.mode {
            AssemblyMode::TimeWindow => {
                let window = (self.config.window_ms as i64).saturating_mul(NANOS_PER_MILLI);
                match self.window_start {
                    Some(start) => point.timestamp_ns >= start.saturating_add(window),
                    None => false,
                }
            }
            AssemblyMode::SpinWrap => self
                .last_azimuth
                .is_some_and(|prev| prev - point.azimuth_deg > WRAP_THRESHOLD_DEG),
        };
        let overflow = self.points.len() >= self.config.max_points_per_frame;
        if overflow {
            warn!(points = self.points.len(), "frame point cap reached, cutting frame early");
        }

        let completed = if boundary || overflow { self.flush() } else { None };

        if self.window_start.is_none() {
            self.window_start = Some(point.timestamp_ns);
        }
        self.last_azimuth = Some(point.azimuth_deg);
        self.points.push(point);
        completed
    }

    /// Add a batch of points (one datagram) and collect completed frames.
    pub fn push_all(&mut self, points: impl IntoIterator<Item = Point>) -> Vec<Frame> {
        points.into_iter().filter_map(|p| self.push(p)).collect()
    }

    /// Close the open frame, if it holds any points.
    pub fn flush(&mut self) -> Option<Frame> {
        self.window_start = None;
        if self.points.is_empty() {
            return None;
        }
        let points = std::mem::take(&mut self.points);
        let frame = Frame {
            sequence: self.next_sequence,
            timestamp_ns: points[0].timestamp_ns,
            points,
        };
        self.next_sequence += 1;
        Some(frame)
    }

    pub fn pending_points(&self) -> usize {
        self.points.len()
    }
}
