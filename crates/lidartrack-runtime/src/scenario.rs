//! Synthetic 10 s replay through the whole perception pipeline.
//!
//! A sensor 2 m above flat ground, inside a 40 m cylindrical wall.  At
//! t = 2 s a 4 × 2 × 1.5 m box appears 5 m to the sensor's side and drives
//! away along +x at 8 m/s until the wall hides it.
//!
//! The replay runs twice: on a coarse 32-ring scan with loosened tunables,
//! and on a 64-ring, 0.2° scan with every tunable at its default.

use std::sync::Arc;

use lidartrack_middleware::{EventBus, ReplaySource};
use lidartrack_perception::background::BackgroundConfig;
use lidartrack_perception::cluster::ClusterConfig;
use lidartrack_perception::pose::{Pose, PoseRegistry, PoseSpec};
use lidartrack_types::{Frame, NANOS_PER_MILLI, Point, UnixNanos, nanos_to_secs};
use tokio::sync::watch;

use crate::orchestrator::{FrameOrchestrator, OrchestratorConfig};

const SENSOR_HEIGHT_M: f64 = 2.0;
const WALL_RADIUS_M: f64 = 40.0;
const FRAME_MS: i64 = 100;
const FRAMES: u64 = 100;

const ENTER_MS: i64 = 2_000;
const OBJECT_SPEED_MPS: f64 = 8.0;
const OBJECT_START_X: f64 = 4.0;
const OBJECT_Y: f64 = 6.0;
const OBJECT_HALF: [f64; 3] = [2.0, 1.0, 0.75];

/// Deterministic xorshift noise in ±`amplitude`.
struct Noise(u64);

impl Noise {
    fn next(&mut self, amplitude: f64) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        ((self.0 >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0) * amplitude
    }
}

/// Box centre at `t`, or `None` before it enters.
fn object_center(t: UnixNanos) -> Option<[f64; 3]> {
    let since = t - ENTER_MS * NANOS_PER_MILLI;
    (since >= 0).then(|| {
        [
            OBJECT_START_X + OBJECT_SPEED_MPS * nanos_to_secs(since),
            OBJECT_Y,
            -SENSOR_HEIGHT_M + OBJECT_HALF[2],
        ]
    })
}

/// Distance along unit ray `d` to the static scene.
fn static_range(d: [f64; 3]) -> f64 {
    let horizontal = (d[0] * d[0] + d[1] * d[1]).sqrt();
    let wall = WALL_RADIUS_M / horizontal;
    if d[2] < 0.0 {
        wall.min(SENSOR_HEIGHT_M / -d[2])
    } else {
        wall
    }
}

/// Slab test against the axis-aligned box.
fn box_range(d: [f64; 3], center: [f64; 3]) -> Option<f64> {
    let mut near = 0.0_f64;
    let mut far = f64::INFINITY;
    for axis in 0..3 {
        let lo = center[axis] - OBJECT_HALF[axis];
        let hi = center[axis] + OBJECT_HALF[axis];
        if d[axis].abs() < 1e-12 {
            if !(lo..=hi).contains(&0.0) {
                return None;
            }
            continue;
        }
        let (a, b) = (lo / d[axis], hi / d[axis]);
        near = near.max(a.min(b));
        far = far.min(a.max(b));
        if near > far {
            return None;
        }
    }
    (near > 0.0).then_some(near)
}

/// Beam layout of the simulated sensor.
#[derive(Debug, Clone, Copy)]
struct Scanner {
    rings: u16,
    lowest_elevation_deg: f32,
    elevation_step_deg: f32,
    azimuth_step_deg: f32,
}

/// 32 rings 1° apart, one return per degree.
const COARSE: Scanner = Scanner {
    rings: 32,
    lowest_elevation_deg: -16.0,
    elevation_step_deg: 1.0,
    azimuth_step_deg: 1.0,
};

/// 64 rings 0.5° apart, matching the default 0.2° background bins.
const DENSE: Scanner = Scanner {
    rings: 64,
    lowest_elevation_deg: -16.0,
    elevation_step_deg: 0.5,
    azimuth_step_deg: 0.2,
};

impl Scanner {
    fn azimuth_steps(&self) -> u32 {
        (360.0 / self.azimuth_step_deg).round() as u32
    }

    /// One revolution at frame `seq`, plus how many returns hit the box.
    fn scan(&self, seq: u64, noise: &mut Noise) -> (Frame, usize) {
        let ts = seq as i64 * FRAME_MS * NANOS_PER_MILLI;
        let center = object_center(ts);
        let steps = self.azimuth_steps();
        let mut points = Vec::with_capacity(self.rings as usize * steps as usize);
        let mut object_hits = 0;
        for ring in 0..self.rings {
            let el = self.lowest_elevation_deg + ring as f32 * self.elevation_step_deg;
            for step in 0..steps {
                // Centre of the azimuth bin.
                let az = (step as f32 + 0.5) * self.azimuth_step_deg;
                let (el_r, az_r) = ((el as f64).to_radians(), (az as f64).to_radians());
                let d = [el_r.cos() * az_r.cos(), el_r.cos() * az_r.sin(), el_r.sin()];
                let mut range = static_range(d);
                if let Some(hit) = center.and_then(|c| box_range(d, c))
                    && hit < range
                {
                    range = hit;
                    object_hits += 1;
                }
                let range = (range + noise.next(0.02)) as f32;
                points.push(Point::from_polar(range, az, el, ring, 30, ts));
            }
        }
        (Frame { sequence: seq, timestamp_ns: ts, points }, object_hits)
    }
}

/// Coarse scan: wider bins, looser clustering to match the sparser returns.
fn coarse_config() -> OrchestratorConfig {
    OrchestratorConfig {
        background: BackgroundConfig {
            rings: COARSE.rings,
            azimuth_bin_deg: COARSE.azimuth_step_deg,
            ..BackgroundConfig::default()
        },
        cluster: ClusterConfig { eps_m: 1.0, min_pts: 5 },
        ..OrchestratorConfig::default()
    }
}

fn registry() -> Arc<PoseRegistry> {
    let registry = PoseRegistry::new();
    registry.upsert(
        Pose::from_spec(&PoseSpec {
            id: "survey".into(),
            sensor_id: "lidar-01".into(),
            ..PoseSpec::default()
        })
        .unwrap(),
    );
    Arc::new(registry)
}

/// Replay the whole scene and check track count, identity, speed and
/// deletion timing along the way.
fn replay_single_object(scanner: Scanner, config: OrchestratorConfig, seed: u64) {
    let mut orch = FrameOrchestrator::new(config, registry(), EventBus::default()).unwrap();
    let snapshots = orch.subscribe();
    let mut noise = Noise(seed);
    let mut last_visible_ns = None;
    let mut track_ids = std::collections::HashSet::new();
    let mut converged = Vec::new();

    for seq in 0..FRAMES {
        let (frame, hits) = scanner.scan(seq, &mut noise);
        let ts = frame.timestamp_ns;
        if hits > 0 {
            last_visible_ns = Some(ts);
        }
        orch.process_frame(&frame);
        let snap = snapshots.borrow().clone();
        let ms = ts / NANOS_PER_MILLI;

        if ms < ENTER_MS {
            assert!(snap.tracks.is_empty(), "no tracks in the empty scene at {ms} ms");
        }
        if (ENTER_MS + 500..=ENTER_MS + 1_000).contains(&ms) {
            assert_eq!(snap.tracks.len(), 1, "exactly one live track at {ms} ms");
            track_ids.insert(snap.tracks[0].track_id);
        }
        if (3_000..=3_500).contains(&ms) {
            converged.push((ms, snap.tracks[0].speed_mps));
        }
        if let Some(last) = last_visible_ns
            && hits == 0
            && ts >= last + 600 * NANOS_PER_MILLI
        {
            assert!(snap.tracks.is_empty(), "track outlived the object at {ms} ms");
        }
    }

    assert_eq!(track_ids.len(), 1, "identity held from 2.5 s to 3 s");
    for (ms, speed) in converged {
        assert!(
            (speed - OBJECT_SPEED_MPS).abs() < 1.0,
            "speed {speed:.2} m/s at {ms} ms is not within 1 m/s"
        );
    }
    let last = last_visible_ns.unwrap();
    assert!(last < (FRAMES as i64 - 7) * FRAME_MS * NANOS_PER_MILLI, "object must leave before the replay ends");
    let snap = snapshots.borrow().clone();
    assert!(snap.tracks.is_empty());
    assert!(snap.counters.tracks_finished >= 1);
    assert_eq!(snap.counters.frames_processed, FRAMES);
    assert_eq!(snap.counters.missing_pose, 0);
}

#[test]
fn scene_geometry_sanity() {
    for scanner in [COARSE, DENSE] {
        let mut noise = Noise(7);
        let (before, hits) = scanner.scan(10, &mut noise);
        assert_eq!(hits, 0);
        assert_eq!(before.points.len(), scanner.rings as usize * scanner.azimuth_steps() as usize);
        let (_, hits) = scanner.scan(20, &mut noise);
        assert!(hits > 50, "box should be dense near the sensor, got {hits}");
        // Wall hides the box once its rear face passes 40 m.
        let (_, hits) = scanner.scan(99, &mut noise);
        assert_eq!(hits, 0);
    }
    assert_eq!(DENSE.azimuth_steps() as usize, BackgroundConfig::default().azimuth_bins());
    assert_eq!(DENSE.rings, BackgroundConfig::default().rings);
}

#[test]
fn single_object_replay() {
    replay_single_object(COARSE, coarse_config(), 0x5eed_1234_abcd_0001);
}

#[test]
fn single_object_replay_with_default_tunables() {
    replay_single_object(DENSE, OrchestratorConfig::default(), 0x5eed_1234_abcd_0002);
}

#[tokio::test]
async fn replay_through_run_loop() {
    let orch = FrameOrchestrator::new(coarse_config(), registry(), EventBus::default()).unwrap();
    let rx = orch.subscribe();
    let mut noise = Noise(99);
    let frames: Vec<Frame> = (0..30).map(|s| COARSE.scan(s, &mut noise).0).collect();
    let (_tx, stop) = watch::channel(false);
    let counters = orch.run(ReplaySource::new(frames), stop).await;
    assert_eq!(counters.frames_processed, 30);
    assert_eq!(rx.borrow().tracks.len(), 1);
}
