//! Adaptive Background Model.
//!
//! Classifies every incoming return as foreground or background in the
//! sensor's own angular coordinates.  The grid is a flat array of
//! [`BackgroundCell`]s indexed by `(ring, azimuth_bin)`; each cell carries a
//! decaying estimate of the static range seen along its ray.
//!
//! # Decision rule
//!
//! ```text
//! threshold      = μ − k·σ − margin
//! raw_foreground = range < threshold            (Learning cells: never)
//! foreground     = raw_foreground ∧ |{raw-foreground cells in 3×3}| ≥ N
//! ```
//!
//! The 3×3 neighbourhood wraps around 0°/360° in azimuth but not across the
//! first/last ring.
//!
//! # Cell states
//!
//! | State | Meaning |
//! |-------|---------|
//! | [`CellState::Learning`] | Fewer than `learning_samples` observations; always background, cumulative mean/variance. |
//! | [`CellState::Free`]     | Normal operation; confirmed background updates the EMA statistics. |
//! | [`CellState::Frozen`]   | Confirmed foreground within the last `freeze_ms`; statistics are not updated. |
//!
//! All transitions compare stored timestamps with the current time; there are
//! no timers.  [`BackgroundGrid::tick`] performs the housekeeping: expiring
//! freezes and resetting cells whose foreground streak outlived
//! `relearn_after_ms` so a permanently changed scene is eventually absorbed.

use lidartrack_types::{ConfigError, ForegroundDiagnostics, NANOS_PER_MILLI, Point, UnixNanos};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Upper bound on `rings × azimuth_bins`.  Larger grids are rejected at
/// startup.
pub const MAX_GRID_CELLS: usize = 4_194_304;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tunables for [`BackgroundGrid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Number of hardware channels.
    pub rings: u16,
    /// Azimuth bin width in degrees (0.2° → 1800 bins).
    pub azimuth_bin_deg: f32,
    /// EMA update fraction applied to Free cells.
    pub update_fraction: f32,
    /// Closeness sensitivity multiplier `k`.
    pub closeness_sensitivity: f32,
    /// Safety margin subtracted from the threshold (metres).
    pub safety_margin_m: f32,
    /// How long a confirmed-foreground cell stays frozen.
    pub freeze_ms: u64,
    /// Raw-foreground cells required in the 3×3 neighbourhood (self included).
    pub neighbor_confirmations: u8,
    /// Observations a cell needs before it leaves Learning.
    pub learning_samples: u32,
    /// A cell continuously foreground for longer than this re-learns.
    pub relearn_after_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            rings: 64,
            azimuth_bin_deg: 0.2,
            update_fraction: 0.02,
            closeness_sensitivity: 3.0,
            safety_margin_m: 0.5,
            freeze_ms: 5_000,
            neighbor_confirmations: 5,
            learning_samples: 10,
            relearn_after_ms: 60_000,
        }
    }
}

impl BackgroundConfig {
    /// Number of azimuth bins implied by the bin width.
    pub fn azimuth_bins(&self) -> usize {
        ((360.0_f64 / self.azimuth_bin_deg as f64).round() as usize).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rings == 0 {
            return Err(ConfigError::invalid("background.rings", "must be at least 1"));
        }
        if !(self.azimuth_bin_deg > 0.0 && self.azimuth_bin_deg <= 360.0) {
            return Err(ConfigError::invalid(
                "background.azimuth_bin_deg",
                format!("{} is outside (0, 360]", self.azimuth_bin_deg),
            ));
        }
        if !(self.update_fraction > 0.0 && self.update_fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "background.update_fraction",
                format!("{} is outside (0, 1]", self.update_fraction),
            ));
        }
        if !(self.closeness_sensitivity >= 0.0) {
            return Err(ConfigError::invalid(
                "background.closeness_sensitivity",
                "must be non-negative",
            ));
        }
        if !(self.safety_margin_m >= 0.0) {
            return Err(ConfigError::invalid("background.safety_margin_m", "must be non-negative"));
        }
        if self.freeze_ms == 0 {
            return Err(ConfigError::invalid("background.freeze_ms", "must be positive"));
        }
        if !(1..=9).contains(&self.neighbor_confirmations) {
            return Err(ConfigError::invalid(
                "background.neighbor_confirmations",
                "must be within 1..=9",
            ));
        }
        if self.learning_samples == 0 {
            return Err(ConfigError::invalid("background.learning_samples", "must be at least 1"));
        }
        let cells = self.rings as usize * self.azimuth_bins();
        if cells > MAX_GRID_CELLS {
            return Err(ConfigError::GridTooLarge {
                cells,
                max: MAX_GRID_CELLS,
            });
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Cell
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CellState {
    Learning,
    Free,
    Frozen,
}

/// Statistics for one `(ring, azimuth_bin)` ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackgroundCell {
    pub mean_range: f32,
    /// Running variance; the spread σ is its square root.
    pub variance: f32,
    pub observations: u32,
    pub last_update_ns: UnixNanos,
    pub frozen_until_ns: UnixNanos,
    pub state: CellState,
    /// Start of the current confirmed-foreground streak.
    pub foreground_since_ns: Option<UnixNanos>,
}

impl BackgroundCell {
    const EMPTY: Self = Self {
        mean_range: 0.0,
        variance: 0.0,
        observations: 0,
        last_update_ns: 0,
        frozen_until_ns: 0,
        state: CellState::Learning,
        foreground_since_ns: None,
    };

    pub fn spread(&self) -> f32 {
        self.variance.max(0.0).sqrt()
    }

    fn threshold(&self, k: f32, margin: f32) -> f32 {
        self.mean_range - k * self.spread() - margin
    }
}

/// Per-point output of [`BackgroundGrid::classify_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub is_foreground: bool,
    pub ring: u16,
    pub azimuth_bin: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Grid
// ────────────────────────────────────────────────────────────────────────────

/// Per-sensor background grid.  Sole owner of all cell state.
#[derive(Debug)]
pub struct BackgroundGrid {
    config: BackgroundConfig,
    bins: usize,
    cells: Vec<BackgroundCell>,
    /// Scratch marks: a cell is raw-foreground in the current frame when its
    /// mark equals `frame_stamp`.
    raw_marks: Vec<u32>,
    frame_stamp: u32,
    foreground_points: u64,
    background_points: u64,
    bins_frozen: u64,
}

impl BackgroundGrid {
    /// Create a grid with empty statistics.
    pub fn new(config: BackgroundConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let bins = config.azimuth_bins();
        let len = config.rings as usize * bins;
        info!(rings = config.rings, bins, cells = len, "background grid allocated");
        Ok(Self {
            config,
            bins,
            cells: vec![BackgroundCell::EMPTY; len],
            raw_marks: vec![0; len],
            frame_stamp: 0,
            foreground_points: 0,
            background_points: 0,
            bins_frozen: 0,
        })
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    pub fn rings(&self) -> u16 {
        self.config.rings
    }

    pub fn azimuth_bins(&self) -> usize {
        self.bins
    }

    /// Azimuth bin for an angle in degrees.
    pub fn azimuth_bin(&self, azimuth_deg: f32) -> u32 {
        let az = azimuth_deg.rem_euclid(360.0);
        let bin = (az / self.config.azimuth_bin_deg).floor() as usize;
        (bin.min(self.bins - 1)) as u32
    }

    pub fn cell(&self, ring: u16, azimuth_bin: u32) -> Option<&BackgroundCell> {
        if ring >= self.config.rings || azimuth_bin as usize >= self.bins {
            return None;
        }
        self.cells.get(self.index(ring, azimuth_bin))
    }

    /// Counters exposed verbatim at the monitoring boundary.
    pub fn diagnostics(&self) -> ForegroundDiagnostics {
        ForegroundDiagnostics {
            foreground_points: self.foreground_points,
            background_points: self.background_points,
            bins_frozen: self.bins_frozen,
        }
    }

    /// Classify every point of one frame.
    ///
    /// Output is index-aligned with `points`.  Returns with invalid ring
    /// indices or non-finite ranges are reported as background and never
    /// touch cell statistics.
    pub fn classify_frame(&mut self, points: &[Point], now: UnixNanos) -> Vec<Classification> {
        self.frame_stamp = self.frame_stamp.wrapping_add(1);
        if self.frame_stamp == 0 {
            // Wrapped: clear stale marks so none alias the new stamp.
            self.raw_marks.fill(0);
            self.frame_stamp = 1;
        }
        let k = self.config.closeness_sensitivity;
        let margin = self.config.safety_margin_m;

        // Pass 1: raw per-cell decisions.
        let mut raw: Vec<Option<(usize, bool)>> = Vec::with_capacity(points.len());
        for p in points {
            if p.ring >= self.config.rings || !p.range_m.is_finite() || p.range_m <= 0.0 {
                raw.push(None);
                continue;
            }
            let idx = self.index(p.ring, self.azimuth_bin(p.azimuth_deg));
            let cell = &self.cells[idx];
            let raw_fg = cell.state != CellState::Learning && p.range_m < cell.threshold(k, margin);
            if raw_fg {
                self.raw_marks[idx] = self.frame_stamp;
            }
            raw.push(Some((idx, raw_fg)));
        }

        // Pass 2: neighbourhood confirmation and state updates.
        let mut out = Vec::with_capacity(points.len());
        for (p, decision) in points.iter().zip(raw) {
            let Some((idx, raw_fg)) = decision else {
                self.background_points += 1;
                out.push(Classification {
                    is_foreground: false,
                    ring: p.ring,
                    azimuth_bin: self.azimuth_bin(p.azimuth_deg),
                });
                continue;
            };
            let confirmed = raw_fg && self.confirming_neighbors(idx) >= self.config.neighbor_confirmations;
            self.expire_freeze(idx, now);
            if confirmed {
                self.foreground_points += 1;
                self.freeze(idx, now);
            } else {
                self.background_points += 1;
                self.learn(idx, p.range_m, now);
            }
            out.push(Classification {
                is_foreground: confirmed,
                ring: (idx / self.bins) as u16,
                azimuth_bin: (idx % self.bins) as u32,
            });
        }
        out
    }

    /// Periodic housekeeping: expire freezes and re-learn cells whose
    /// foreground streak exceeded `relearn_after_ms`.
    pub fn tick(&mut self, now: UnixNanos) {
        let relearn_after = self.config.relearn_after_ms as i64 * NANOS_PER_MILLI;
        let mut relearned = 0usize;
        for idx in 0..self.cells.len() {
            self.expire_freeze(idx, now);
            let cell = &mut self.cells[idx];
            if let Some(since) = cell.foreground_since_ns
                && now - since > relearn_after
            {
                if cell.state == CellState::Frozen {
                    self.bins_frozen = self.bins_frozen.saturating_sub(1);
                }
                *cell = BackgroundCell::EMPTY;
                relearned += 1;
            }
        }
        if relearned > 0 {
            info!(cells = relearned, "background cells reset for re-learning");
        }
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn index(&self, ring: u16, azimuth_bin: u32) -> usize {
        ring as usize * self.bins + azimuth_bin as usize
    }

    fn confirming_neighbors(&self, idx: usize) -> u8 {
        let ring = (idx / self.bins) as i64;
        let bin = (idx % self.bins) as i64;
        let bins = self.bins as i64;
        let mut count = 0u8;
        for dr in -1..=1i64 {
            let r = ring + dr;
            if r < 0 || r >= self.config.rings as i64 {
                continue;
            }
            for db in -1..=1i64 {
                let b = (bin + db).rem_euclid(bins);
                if self.raw_marks[(r * bins + b) as usize] == self.frame_stamp {
                    count += 1;
                }
            }
        }
        count
    }

    /// An expired freeze also ends the foreground streak: a cell that stopped
    /// seeing the object (or stopped returning at all) must not re-learn later.
    fn expire_freeze(&mut self, idx: usize, now: UnixNanos) {
        let cell = &mut self.cells[idx];
        if cell.state == CellState::Frozen && now >= cell.frozen_until_ns {
            cell.state = CellState::Free;
            cell.foreground_since_ns = None;
            self.bins_frozen = self.bins_frozen.saturating_sub(1);
        }
    }

    fn freeze(&mut self, idx: usize, now: UnixNanos) {
        let freeze = self.config.freeze_ms as i64 * NANOS_PER_MILLI;
        let cell = &mut self.cells[idx];
        if cell.state != CellState::Frozen {
            cell.state = CellState::Frozen;
            self.bins_frozen += 1;
            debug!(cell = idx, "cell frozen");
        }
        cell.frozen_until_ns = now + freeze;
        cell.foreground_since_ns.get_or_insert(now);
    }

    fn learn(&mut self, idx: usize, range: f32, now: UnixNanos) {
        let alpha = self.config.update_fraction;
        let learning_samples = self.config.learning_samples;
        let cell = &mut self.cells[idx];
        cell.foreground_since_ns = None;
        match cell.state {
            CellState::Frozen => {}
            CellState::Learning => {
                // Welford running mean / population variance.
                cell.observations = cell.observations.saturating_add(1);
                let n = cell.observations as f32;
                let delta = range - cell.mean_range;
                cell.mean_range += delta / n;
                cell.variance += (delta * (range - cell.mean_range) - cell.variance) / n;
                cell.last_update_ns = now;
                if cell.observations >= learning_samples {
                    cell.state = CellState::Free;
                }
            }
            CellState::Free => {
                cell.observations = cell.observations.saturating_add(1);
                let delta = range - cell.mean_range;
                cell.mean_range += alpha * delta;
                cell.variance = (1.0 - alpha) * (cell.variance + alpha * delta * delta);
                cell.last_update_ns = now;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
