//! World Transformer.
//!
//! Moves sensor-frame clusters into the site frame using the pose currently
//! registered for the sensor, and stamps every result with that pose's
//! identifier.  A frame whose pose is missing or expired fails as a whole;
//! nothing is substituted.

use std::sync::Arc;

use lidartrack_types::{UnixNanos, WorldCluster};
use thiserror::Error;

use crate::cluster::SensorCluster;
use crate::pose::{Pose, PoseRegistry, Validity};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("no pose for sensor `{sensor_id}` valid at {frame_time}")]
    MissingPose {
        sensor_id: String,
        frame_time: UnixNanos,
    },

    #[error("pose `{pose_id}` for sensor `{sensor_id}` expired at {valid_to} (frame at {frame_time})")]
    StalePose {
        sensor_id: String,
        pose_id: String,
        valid_to: UnixNanos,
        frame_time: UnixNanos,
    },
}

#[derive(Debug, Clone)]
pub struct WorldTransformer {
    registry: Arc<PoseRegistry>,
}

impl WorldTransformer {
    pub fn new(registry: Arc<PoseRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PoseRegistry> {
        &self.registry
    }

    /// Look up the pose for `sensor_id` that covers `frame_time`.
    ///
    /// The current pose is preferred.  When it does not cover the frame, a
    /// superseded pose of the same sensor that does is used instead, so a
    /// replay from before a recalibration keeps its original geometry.  A
    /// sensor without a current pose (never registered or removed) has no
    /// pose at all.  When nothing covers the frame the error describes the
    /// current pose: not yet valid is reported as missing, expired as stale.
    pub fn resolve(&self, sensor_id: &str, frame_time: UnixNanos) -> Result<Arc<Pose>, TransformError> {
        let missing = || TransformError::MissingPose {
            sensor_id: sensor_id.to_string(),
            frame_time,
        };
        let pose = self.registry.current(sensor_id).ok_or_else(missing)?;
        let validity = pose.validity_at(frame_time);
        if validity == Validity::Valid {
            return Ok(pose);
        }
        if let Some(earlier) = self.registry.valid_at(sensor_id, frame_time) {
            return Ok(earlier);
        }
        match validity {
            Validity::Expired => Err(TransformError::StalePose {
                sensor_id: sensor_id.to_string(),
                pose_id: pose.id.clone(),
                valid_to: pose.valid_to_ns.unwrap_or(frame_time),
                frame_time,
            }),
            Validity::NotYetValid | Validity::Valid => Err(missing()),
        }
    }

    /// Transform one cluster.
    pub fn to_world(
        &self,
        cluster: &SensorCluster,
        sensor_id: &str,
        frame_time: UnixNanos,
    ) -> Result<WorldCluster, TransformError> {
        let pose = self.resolve(sensor_id, frame_time)?;
        Ok(apply(&pose, cluster, sensor_id))
    }

    /// Transform every cluster of a frame under a single pose snapshot, so
    /// a concurrent hot reload cannot split one frame across two poses.
    pub fn frame_to_world(
        &self,
        clusters: &[SensorCluster],
        sensor_id: &str,
        frame_time: UnixNanos,
    ) -> Result<Vec<WorldCluster>, TransformError> {
        let pose = self.resolve(sensor_id, frame_time)?;
        Ok(clusters.iter().map(|c| apply(&pose, c, sensor_id)).collect())
    }
}

/// Apply `pose` to a sensor cluster.
pub fn apply(pose: &Pose, cluster: &SensorCluster, sensor_id: &str) -> WorldCluster {
    let [x, y, z] = pose.transform_point(cluster.centroid);
    let axis = pose.rotate_vector([cluster.heading_rad.cos(), cluster.heading_rad.sin(), 0.0]);
    // The p95 height is carried on the vertical through the centroid.
    let top = pose.transform_point([cluster.centroid[0], cluster.centroid[1], cluster.z_p95 as f64]);

    WorldCluster {
        sensor_id: sensor_id.to_string(),
        world_frame: pose.world_frame.clone(),
        pose_id: pose.id.clone(),
        unix_nanos: cluster.timestamp_ns,
        x,
        y,
        z,
        heading_rad: axis[1].atan2(axis[0]),
        bbox_l: cluster.length,
        bbox_w: cluster.width,
        bbox_h: cluster.height,
        points_count: cluster.points_count,
        height_p95: top[2] as f32,
        intensity_mean: cluster.intensity_mean,
        ring_hint: Some(cluster.ring_hint),
        azimuth_hint_deg: Some(cluster.azimuth_hint_deg),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::PoseSpec;
    use approx::assert_abs_diff_eq;

    fn registry_with(spec: PoseSpec) -> Arc<PoseRegistry> {
        let registry = PoseRegistry::new();
        registry.upsert(Pose::from_spec(&spec).unwrap());
        Arc::new(registry)
    }

    fn mounted_pose() -> PoseSpec {
        PoseSpec {
            id: "cal-1".to_string(),
            sensor_id: "lidar-01".to_string(),
            translation: [100.0, 50.0, 4.0],
            rotation_deg: [0.0, 0.0, 90.0],
            valid_from_ns: 1_000,
            valid_to_ns: Some(10_000),
            ..PoseSpec::default()
        }
    }

    fn sensor_cluster() -> SensorCluster {
        SensorCluster {
            centroid: [10.0, 0.0, -3.0],
            heading_rad: 0.0,
            length: 4.0,
            width: 2.0,
            height: 1.5,
            z_p95: -2.6,
            points_count: 40,
            intensity_mean: 31.0,
            timestamp_ns: 5_000,
            ring_hint: 4,
            azimuth_hint_deg: 0.5,
        }
    }

    #[test]
    fn cluster_moves_into_site_frame() {
        let tf = WorldTransformer::new(registry_with(mounted_pose()));
        let w = tf.to_world(&sensor_cluster(), "lidar-01", 5_000).unwrap();
        assert_abs_diff_eq!(w.x, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(w.y, 60.0, epsilon = 1e-9);
        assert_abs_diff_eq!(w.z, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(w.heading_rad, std::f64::consts::FRAC_PI_2, epsilon = 1e-9);
        assert_abs_diff_eq!(w.height_p95, 1.4, epsilon = 1e-5);
        assert_eq!(w.pose_id, "cal-1");
        assert_eq!(w.world_frame, "site");
        assert_eq!(w.sensor_id, "lidar-01");
        assert_eq!(w.unix_nanos, 5_000);
        assert_eq!(w.points_count, 40);
        assert_eq!(w.ring_hint, Some(4));
    }

    #[test]
    fn unknown_sensor_is_missing_pose() {
        let tf = WorldTransformer::new(registry_with(mounted_pose()));
        let err = tf.to_world(&sensor_cluster(), "lidar-02", 5_000).unwrap_err();
        assert!(matches!(err, TransformError::MissingPose { .. }));
    }

    #[test]
    fn pose_not_yet_valid_is_missing_pose() {
        let tf = WorldTransformer::new(registry_with(mounted_pose()));
        let err = tf.to_world(&sensor_cluster(), "lidar-01", 999).unwrap_err();
        assert!(matches!(err, TransformError::MissingPose { .. }));
    }

    #[test]
    fn expired_pose_is_stale() {
        let tf = WorldTransformer::new(registry_with(mounted_pose()));
        let err = tf.to_world(&sensor_cluster(), "lidar-01", 10_001).unwrap_err();
        assert_eq!(
            err,
            TransformError::StalePose {
                sensor_id: "lidar-01".to_string(),
                pose_id: "cal-1".to_string(),
                valid_to: 10_000,
                frame_time: 10_001,
            }
        );
    }

    #[test]
    fn frame_uses_one_pose_for_all_clusters() {
        let tf = WorldTransformer::new(registry_with(mounted_pose()));
        let clusters = vec![sensor_cluster(), sensor_cluster()];
        let out = tf.frame_to_world(&clusters, "lidar-01", 5_000).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.pose_id == "cal-1"));
    }

    #[test]
    fn hot_reload_restamps_later_frames() {
        let registry = registry_with(mounted_pose());
        let tf = WorldTransformer::new(Arc::clone(&registry));
        let before = tf.to_world(&sensor_cluster(), "lidar-01", 5_000).unwrap();

        let mut recal = mounted_pose();
        recal.id = "cal-2".to_string();
        recal.translation = [0.0; 3];
        registry.upsert(Pose::from_spec(&recal).unwrap());
        let after = tf.to_world(&sensor_cluster(), "lidar-01", 5_000).unwrap();

        assert_eq!(before.pose_id, "cal-1");
        assert_eq!(after.pose_id, "cal-2");
        assert_abs_diff_eq!(after.y, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn replayed_frame_uses_pose_valid_at_its_time() {
        let registry = registry_with(mounted_pose());
        let mut recal = mounted_pose();
        recal.id = "cal-2".to_string();
        recal.translation = [0.0; 3];
        recal.valid_from_ns = 10_000;
        recal.valid_to_ns = None;
        registry.upsert(Pose::from_spec(&recal).unwrap());
        let tf = WorldTransformer::new(Arc::clone(&registry));

        // Live frames use the new calibration, a replayed one the old.
        assert_eq!(tf.resolve("lidar-01", 20_000).unwrap().id, "cal-2");
        let replayed = tf.to_world(&sensor_cluster(), "lidar-01", 5_000).unwrap();
        assert_eq!(replayed.pose_id, "cal-1");
        assert_abs_diff_eq!(replayed.y, 60.0, epsilon = 1e-9);

        // Nothing covers this frame: reported against the current pose.
        let err = tf.resolve("lidar-01", 999).unwrap_err();
        assert!(matches!(err, TransformError::MissingPose { .. }));

        // Removing the sensor leaves nothing to fall back on.
        registry.remove("lidar-01");
        assert!(matches!(
            tf.resolve("lidar-01", 5_000),
            Err(TransformError::MissingPose { .. })
        ));
    }

    #[test]
    fn world_point_round_trips_through_inverse() {
        let registry = registry_with(mounted_pose());
        let pose = registry.current("lidar-01").unwrap();
        let w = apply(&pose, &sensor_cluster(), "lidar-01");
        let back = pose.inverse().transform_point([w.x, w.y, w.z]);
        for (b, orig) in back.iter().zip(sensor_cluster().centroid) {
            assert_abs_diff_eq!(*b, orig, epsilon = 1e-9);
        }
    }
}
