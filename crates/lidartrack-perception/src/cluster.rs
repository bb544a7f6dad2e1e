//! Density clustering of foreground returns.
//!
//! Groups the foreground points of one frame into object candidates.  Two
//! points belong to the same group when a chain of points, each within `eps`
//! of the next, connects them; groups with fewer than `min_pts` members are
//! discarded.  Neighbour search runs on a uniform hash grid with cell edge
//! `eps`, so each expansion inspects at most 27 cells.
//!
//! Every retained group is summarised as a [`SensorCluster`]: centroid,
//! oriented bounding extents from a principal-axis fit in the XY plane,
//! 95th-percentile height, and mean intensity.  All geometry is still in the
//! sensor frame; [`crate::transform::WorldTransformer`] moves it to the site.

use std::collections::HashMap;

use lidartrack_types::{ConfigError, Point, UnixNanos};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Chaining distance (metres).
    pub eps_m: f32,
    /// Minimum members for a retained group.
    pub min_pts: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps_m: 0.6,
            min_pts: 12,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.eps_m.is_finite() && self.eps_m > 0.0) {
            return Err(ConfigError::invalid(
                "cluster.eps_m",
                format!("{} must be a positive distance", self.eps_m),
            ));
        }
        if self.min_pts == 0 {
            return Err(ConfigError::invalid("cluster.min_pts", "must be at least 1"));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

/// Descriptive geometry of one retained group, in the sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCluster {
    pub centroid: [f64; 3],
    /// Direction of the long axis in the sensor XY plane.
    pub heading_rad: f64,
    pub length: f32,
    pub width: f32,
    pub height: f32,
    /// 95th percentile of member `z` (sensor frame).
    pub z_p95: f32,
    pub points_count: u32,
    pub intensity_mean: f32,
    pub timestamp_ns: UnixNanos,
    pub ring_hint: u16,
    pub azimuth_hint_deg: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Clusterer
// ────────────────────────────────────────────────────────────────────────────

type CellKey = (i32, i32, i32);

#[derive(Debug, Clone)]
pub struct Clusterer {
    config: ClusterConfig,
}

impl Clusterer {
    pub fn new(config: ClusterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Group `points` (the foreground of one frame) and describe every group
    /// that reaches `min_pts`.  An empty input yields an empty output.
    pub fn cluster(&self, points: &[Point], frame_time: UnixNanos) -> Vec<SensorCluster> {
        self.groups(points)
            .into_iter()
            .map(|members| describe(points, &members, frame_time))
            .collect()
    }

    /// Member indices of every retained group, in discovery order.  Each
    /// point index appears in at most one group.
    pub fn groups(&self, points: &[Point]) -> Vec<Vec<usize>> {
        if points.len() < self.config.min_pts {
            return Vec::new();
        }
        let eps = self.config.eps_m;
        let eps_sq = eps * eps;

        // Non-finite returns never join a group.
        let mut visited: Vec<bool> = points.iter().map(|p| !is_finite(p)).collect();
        let mut grid: HashMap<CellKey, Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            if !visited[i] {
                grid.entry(cell_key(p, eps)).or_default().push(i);
            }
        }

        let mut groups = Vec::new();
        let mut stack = Vec::new();

        for seed in 0..points.len() {
            if visited[seed] {
                continue;
            }
            visited[seed] = true;
            stack.push(seed);
            let mut members = Vec::new();

            while let Some(i) = stack.pop() {
                members.push(i);
                let p = &points[i];
                let (cx, cy, cz) = cell_key(p, eps);
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            let key = (cx.saturating_add(dx), cy.saturating_add(dy), cz.saturating_add(dz));
                            let Some(bucket) = grid.get(&key) else {
                                continue;
                            };
                            for &j in bucket {
                                if !visited[j] && dist_sq(p, &points[j]) <= eps_sq {
                                    visited[j] = true;
                                    stack.push(j);
                                }
                            }
                        }
                    }
                }
            }

            if members.len() >= self.config.min_pts {
                members.sort_unstable();
                groups.push(members);
            }
        }
        groups
    }
}

fn is_finite(p: &Point) -> bool {
    p.x.is_finite() && p.y.is_finite() && p.z.is_finite()
}

/// Cell of `p`; coordinates beyond the `i32` range clamp to the edge cells.
fn cell_key(p: &Point, eps: f32) -> CellKey {
    (
        (p.x / eps).floor() as i32,
        (p.y / eps).floor() as i32,
        (p.z / eps).floor() as i32,
    )
}

fn dist_sq(a: &Point, b: &Point) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    dx * dx + dy * dy + dz * dz
}

/// Summarise one group of member indices.
fn describe(points: &[Point], members: &[usize], frame_time: UnixNanos) -> SensorCluster {
    let n = members.len() as f64;

    let (mut sx, mut sy, mut sz, mut si) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for &i in members {
        let p = &points[i];
        sx += p.x as f64;
        sy += p.y as f64;
        sz += p.z as f64;
        si += p.intensity as f64;
    }
    let (mx, my, mz) = (sx / n, sy / n, sz / n);

    // Principal axis of the XY scatter.
    let (mut cxx, mut cyy, mut cxy) = (0.0f64, 0.0f64, 0.0f64);
    for &i in members {
        let dx = points[i].x as f64 - mx;
        let dy = points[i].y as f64 - my;
        cxx += dx * dx;
        cyy += dy * dy;
        cxy += dx * dy;
    }
    let mut heading = 0.5 * (2.0 * cxy).atan2(cxx - cyy);
    let (ux, uy) = (heading.cos(), heading.sin());

    let (mut u_min, mut u_max) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut v_min, mut v_max) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut z_min, mut z_max) = (f32::INFINITY, f32::NEG_INFINITY);
    let mut zs = Vec::with_capacity(members.len());
    let mut hint = members[0];
    let mut hint_d = f64::INFINITY;
    for &i in members {
        let p = &points[i];
        let dx = p.x as f64 - mx;
        let dy = p.y as f64 - my;
        let u = dx * ux + dy * uy;
        let v = -dx * uy + dy * ux;
        u_min = u_min.min(u);
        u_max = u_max.max(u);
        v_min = v_min.min(v);
        v_max = v_max.max(v);
        z_min = z_min.min(p.z);
        z_max = z_max.max(p.z);
        zs.push(p.z);
        let dz = p.z as f64 - mz;
        let d = dx * dx + dy * dy + dz * dz;
        if d < hint_d {
            hint_d = d;
            hint = i;
        }
    }

    let mut length = (u_max - u_min) as f32;
    let mut width = (v_max - v_min) as f32;
    if width > length {
        std::mem::swap(&mut length, &mut width);
        heading += std::f64::consts::FRAC_PI_2;
    }

    SensorCluster {
        centroid: [mx, my, mz],
        heading_rad: wrap_axis(heading),
        length,
        width,
        height: z_max - z_min,
        z_p95: percentile(&mut zs, 0.95),
        points_count: members.len() as u32,
        intensity_mean: (si / n) as f32,
        timestamp_ns: frame_time,
        ring_hint: points[hint].ring,
        azimuth_hint_deg: points[hint].azimuth_deg,
    }
}

/// Nearest-rank percentile; `values` is sorted in place.
fn percentile(values: &mut [f32], q: f64) -> f32 {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let rank = (q * values.len() as f64).ceil() as usize;
    values[rank.saturating_sub(1).min(values.len() - 1)]
}

/// An axis direction is only defined modulo π; keep it in (−π/2, π/2].
fn wrap_axis(angle: f64) -> f64 {
    use std::f64::consts::{FRAC_PI_2, PI};
    let mut a = angle.rem_euclid(PI);
    if a > FRAC_PI_2 {
        a -= PI;
    }
    a
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
