//! Pose Registry.
//!
//! A [`Pose`] is the rigid sensor→site transform for one sensor, together
//! with the metadata needed to interpret results produced under it later
//! (identifier, validity interval, calibration method, residual error).
//!
//! The [`PoseRegistry`] keeps one *current* pose per sensor and every pose
//! ever registered by identifier.  Entries are handed out as `Arc<Pose>`:
//! an [`upsert`][PoseRegistry::upsert] swaps the pointer, so a reader always
//! sees a whole record, never a half-applied update.
//!
//! # Example
//!
//! ```rust
//! use lidartrack_perception::pose::{Pose, PoseRegistry, PoseSpec};
//!
//! let spec = PoseSpec {
//!     id: "cal-1".into(),
//!     sensor_id: "lidar-01".into(),
//!     translation: [10.0, 0.0, 3.0],
//!     rotation_deg: [0.0, 0.0, 90.0],
//!     ..PoseSpec::default()
//! };
//! let registry = PoseRegistry::new();
//! registry.upsert(Pose::from_spec(&spec).unwrap());
//!
//! let pose = registry.current("lidar-01").unwrap();
//! let w = pose.transform_point([1.0, 0.0, 0.0]);
//! assert!((w[0] - 10.0).abs() < 1e-9);
//! assert!((w[1] - 1.0).abs() < 1e-9);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use lidartrack_types::{ConfigError, UnixNanos};
use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Rotation blocks further than this from orthonormal are rejected.
const RIGIDITY_TOLERANCE: f64 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Configuration shape
// ────────────────────────────────────────────────────────────────────────────

/// Serialisable description of a pose, as written in `[[poses]]`.
///
/// Either `matrix` (16 values, row-major) or `translation` + `rotation_deg`
/// (roll, pitch, yaw about X, Y, Z) describes the transform; the matrix wins
/// when both are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseSpec {
    pub id: String,
    pub sensor_id: String,
    pub sensor_frame: String,
    pub world_frame: String,
    pub translation: [f64; 3],
    pub rotation_deg: [f64; 3],
    pub matrix: Option<Vec<f64>>,
    pub valid_from_ns: UnixNanos,
    pub valid_to_ns: Option<UnixNanos>,
    pub method: String,
    pub residual_m: f64,
}

impl Default for PoseSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            sensor_id: String::new(),
            sensor_frame: "sensor".to_string(),
            world_frame: "site".to_string(),
            translation: [0.0; 3],
            rotation_deg: [0.0; 3],
            matrix: None,
            valid_from_ns: 0,
            valid_to_ns: None,
            method: "manual".to_string(),
            residual_m: 0.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// Rigid transform from `sensor_frame` to `world_frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub id: String,
    pub sensor_id: String,
    pub sensor_frame: String,
    pub world_frame: String,
    /// Homogeneous 4×4 matrix; the last row is always `[0 0 0 1]`.
    pub matrix: Matrix4<f64>,
    pub valid_from_ns: UnixNanos,
    /// `None` means open-ended.
    pub valid_to_ns: Option<UnixNanos>,
    pub method: String,
    pub residual_m: f64,
}

/// Where a timestamp falls relative to a pose's validity interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    NotYetValid,
    Valid,
    Expired,
}

impl Pose {
    /// Build and validate a pose from its configuration shape.
    pub fn from_spec(spec: &PoseSpec) -> Result<Self, ConfigError> {
        if spec.id.is_empty() {
            return Err(ConfigError::invalid("poses.id", "must not be empty"));
        }
        if spec.sensor_id.is_empty() {
            return Err(ConfigError::invalid("poses.sensor_id", "must not be empty"));
        }
        if let Some(to) = spec.valid_to_ns
            && to <= spec.valid_from_ns
        {
            return Err(ConfigError::invalid(
                "poses.valid_to_ns",
                format!("{to} is not after valid_from_ns {}", spec.valid_from_ns),
            ));
        }

        let matrix = match &spec.matrix {
            Some(values) => {
                if values.len() != 16 {
                    return Err(ConfigError::invalid(
                        "poses.matrix",
                        format!("expected 16 values, got {}", values.len()),
                    ));
                }
                Matrix4::from_row_slice(values)
            }
            None => {
                let [roll, pitch, yaw] = spec.rotation_deg.map(f64::to_radians);
                let [tx, ty, tz] = spec.translation;
                let rotation = Rotation3::from_euler_angles(roll, pitch, yaw);
                let mut m = rotation.to_homogeneous();
                m[(0, 3)] = tx;
                m[(1, 3)] = ty;
                m[(2, 3)] = tz;
                m
            }
        };
        check_rigid(&matrix)?;

        Ok(Self {
            id: spec.id.clone(),
            sensor_id: spec.sensor_id.clone(),
            sensor_frame: spec.sensor_frame.clone(),
            world_frame: spec.world_frame.clone(),
            matrix,
            valid_from_ns: spec.valid_from_ns,
            valid_to_ns: spec.valid_to_ns,
            method: spec.method.clone(),
            residual_m: spec.residual_m,
        })
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Apply the full rigid transform to a point.
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let h = self.matrix * Vector4::new(p[0], p[1], p[2], 1.0);
        [h.x, h.y, h.z]
    }

    /// Apply only the rotation (for directions and axes).
    pub fn rotate_vector(&self, v: [f64; 3]) -> [f64; 3] {
        let r = self.rotation() * Vector3::new(v[0], v[1], v[2]);
        [r.x, r.y, r.z]
    }

    /// Closed-form rigid inverse `[Rᵀ | −Rᵀt]`, mapping world back to sensor.
    pub fn inverse(&self) -> Pose {
        let rt = self.rotation().transpose();
        let t = -(rt * self.translation());
        let mut m = Matrix4::<f64>::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&rt);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
        Pose {
            sensor_frame: self.world_frame.clone(),
            world_frame: self.sensor_frame.clone(),
            matrix: m,
            ..self.clone()
        }
    }

    /// The validity interval is `[valid_from_ns, valid_to_ns]`.
    pub fn validity_at(&self, t: UnixNanos) -> Validity {
        if t < self.valid_from_ns {
            Validity::NotYetValid
        } else if self.valid_to_ns.is_some_and(|to| t > to) {
            Validity::Expired
        } else {
            Validity::Valid
        }
    }
}

fn check_rigid(m: &Matrix4<f64>) -> Result<(), ConfigError> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(ConfigError::invalid("poses.matrix", "contains non-finite values"));
    }
    let bottom = m.row(3);
    if bottom[0] != 0.0 || bottom[1] != 0.0 || bottom[2] != 0.0 || bottom[3] != 1.0 {
        return Err(ConfigError::invalid("poses.matrix", "last row must be [0 0 0 1]"));
    }
    let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
    let err = (r.transpose() * r - Matrix3::identity()).abs().max();
    if err > RIGIDITY_TOLERANCE || r.determinant() < 0.0 {
        return Err(ConfigError::invalid(
            "poses.matrix",
            format!("rotation block is not a proper rotation (error {err:.2e})"),
        ));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe pose store shared between the orchestrators of every sensor
/// and the hot-reload path.
#[derive(Debug, Default)]
pub struct PoseRegistry {
    current: RwLock<HashMap<String, Arc<Pose>>>,
    by_id: RwLock<HashMap<String, Arc<Pose>>>,
}

impl PoseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration entries, in order; a later entry
    /// for the same sensor supersedes an earlier one.
    pub fn from_specs(specs: &[PoseSpec]) -> Result<Self, ConfigError> {
        let registry = Self::new();
        for spec in specs {
            registry.upsert(Pose::from_spec(spec)?);
        }
        Ok(registry)
    }

    /// Make `pose` the current pose of its sensor.  The superseded entry
    /// stays reachable through [`get_by_id`][Self::get_by_id].
    pub fn upsert(&self, pose: Pose) -> Arc<Pose> {
        let pose = Arc::new(pose);
        self.by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pose.id.clone(), Arc::clone(&pose));
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pose.sensor_id.clone(), Arc::clone(&pose));
        info!(
            sensor_id = %pose.sensor_id,
            pose_id = %pose.id,
            replaced = previous.as_ref().map(|p| p.id.as_str()).unwrap_or("-"),
            method = %pose.method,
            "pose registered"
        );
        pose
    }

    /// Current pose for `sensor_id`, if any.
    pub fn current(&self, sensor_id: &str) -> Option<Arc<Pose>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor_id)
            .cloned()
    }

    pub fn get_by_id(&self, pose_id: &str) -> Option<Arc<Pose>> {
        self.by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pose_id)
            .cloned()
    }

    /// Any registered pose of `sensor_id` whose interval covers `t`, the one
    /// that took effect latest winning.  Used when replayed frames predate
    /// the current calibration.
    pub fn valid_at(&self, sensor_id: &str, t: UnixNanos) -> Option<Arc<Pose>> {
        self.by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.sensor_id == sensor_id && p.validity_at(t) == Validity::Valid)
            .max_by(|a, b| a.valid_from_ns.cmp(&b.valid_from_ns).then_with(|| a.id.cmp(&b.id)))
            .cloned()
    }

    /// Remove the current pose of a sensor (history is kept).
    pub fn remove(&self, sensor_id: &str) -> Option<Arc<Pose>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sensor_id)
    }

    pub fn sensors(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
