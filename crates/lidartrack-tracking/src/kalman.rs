//! Constant-velocity Kalman filter in the ground plane.
//!
//! ## State vector
//! x = [px, py, vx, vy]ᵀ
//!
//! ## Transition
//! F = I₄ + dt·[[0₂ I₂]; [0₂ 0₂]]
//!
//! ## Process noise
//! Q = diag(qp·dt, qp·dt, qv·dt, qv·dt): variance grows linearly with the
//! elapsed time, independently per axis.
//!
//! ## Measurement
//! z = [px, py]ᵀ, H = [I₂ 0₂], R = r·I₂.
//!
//! Every operation that inverts the innovation covariance reports failure
//! instead of producing NaN state; the caller decides how to recover.

use lidartrack_types::ConfigError;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type State = Vector4<f64>;
pub type Covariance = Matrix4<f64>;

/// Innovation covariances with a determinant below this are singular.
const MIN_INNOVATION_DET: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Noise model of the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Position variance added per second (m²/s).
    pub process_position_rate: f64,
    /// Velocity variance added per second (m²/s³).
    pub process_velocity_rate: f64,
    /// Centroid measurement variance per axis (m²).
    pub measurement_variance: f64,
    /// Prior position variance at birth (m²).
    pub initial_position_variance: f64,
    /// Prior velocity variance at birth ((m/s)²).
    pub initial_velocity_variance: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            process_position_rate: 0.5,
            process_velocity_rate: 1.0,
            measurement_variance: 0.3,
            initial_position_variance: 1.0,
            initial_velocity_variance: 100.0,
        }
    }
}

impl NoiseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("tracker.process_position_rate", self.process_position_rate),
            ("tracker.process_velocity_rate", self.process_velocity_rate),
            ("tracker.measurement_variance", self.measurement_variance),
            ("tracker.initial_position_variance", self.initial_position_variance),
            ("tracker.initial_velocity_variance", self.initial_velocity_variance),
        ];
        for (field, value) in fields {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::invalid(field, format!("{value} must be a non-negative variance")));
            }
        }
        // R is the only term keeping S invertible for a newborn track.
        if self.measurement_variance == 0.0 {
            return Err(ConfigError::invalid("tracker.measurement_variance", "must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum FilterError {
    #[error("innovation covariance is singular or non-finite")]
    SingularInnovation,
    #[error("update produced a non-finite state or covariance")]
    NonFinite,
}

/// Precomputed innovation terms for one track, reused across every
/// candidate measurement in a frame.
#[derive(Debug, Clone, Copy)]
pub struct Innovation {
    pub predicted: Vector2<f64>,
    pub s: Matrix2<f64>,
    pub s_inv: Matrix2<f64>,
}

impl Innovation {
    /// Squared Mahalanobis distance of `z` from the predicted position.
    pub fn mahalanobis_sq(&self, z: &Vector2<f64>) -> f64 {
        let nu = z - self.predicted;
        let d2 = (nu.transpose() * self.s_inv * nu)[(0, 0)];
        if d2.is_finite() { d2 } else { f64::INFINITY }
    }
}

#[derive(Debug, Clone)]
pub struct CvFilter {
    pub config: NoiseConfig,
}

impl CvFilter {
    pub fn new(config: NoiseConfig) -> Self {
        Self { config }
    }

    pub fn transition_matrix(dt: f64) -> Matrix4<f64> {
        let mut f = Matrix4::<f64>::identity();
        f[(0, 2)] = dt;
        f[(1, 3)] = dt;
        f
    }

    pub fn process_noise(&self, dt: f64) -> Matrix4<f64> {
        let qp = self.config.process_position_rate * dt;
        let qv = self.config.process_velocity_rate * dt;
        Matrix4::from_diagonal(&Vector4::new(qp, qp, qv, qv))
    }

    fn observation() -> Matrix2x4<f64> {
        Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0,
        )
    }

    fn measurement_noise(&self) -> Matrix2<f64> {
        Matrix2::identity() * self.config.measurement_variance
    }

    /// Covariance a newborn track starts with.
    pub fn prior_covariance(&self) -> Covariance {
        let p = self.config.initial_position_variance;
        let v = self.config.initial_velocity_variance;
        Matrix4::from_diagonal(&Vector4::new(p, p, v, v))
    }

    /// State and covariance for a track born at `(x, y)` at rest.
    pub fn initiate(&self, x: f64, y: f64) -> (State, Covariance) {
        (Vector4::new(x, y, 0.0, 0.0), self.prior_covariance())
    }

    pub fn predict(&self, state: &State, cov: &Covariance, dt: f64) -> (State, Covariance) {
        let f = Self::transition_matrix(dt);
        (f * state, f * cov * f.transpose() + self.process_noise(dt))
    }

    /// Innovation covariance `S = H·P·Hᵀ + R` and its inverse.
    pub fn innovation(&self, state: &State, cov: &Covariance) -> Result<Innovation, FilterError> {
        let h = Self::observation();
        let s = h * cov * h.transpose() + self.measurement_noise();
        if s.iter().any(|v| !v.is_finite()) || s.determinant().abs() < MIN_INNOVATION_DET {
            return Err(FilterError::SingularInnovation);
        }
        let s_inv = s.try_inverse().ok_or(FilterError::SingularInnovation)?;
        Ok(Innovation {
            predicted: h * state,
            s,
            s_inv,
        })
    }

    /// Fold a position measurement into the estimate (Joseph form).
    pub fn update(
        &self,
        state: &State,
        cov: &Covariance,
        z: &Vector2<f64>,
    ) -> Result<(State, Covariance), FilterError> {
        let inn = self.innovation(state, cov)?;
        let h = Self::observation();
        let r = self.measurement_noise();

        let k = cov * h.transpose() * inn.s_inv;
        let new_state = state + k * (z - inn.predicted);

        let i_kh = Matrix4::<f64>::identity() - k * h;
        let new_cov = i_kh * cov * i_kh.transpose() + k * r * k.transpose();

        if !is_finite(&new_state, &new_cov) {
            return Err(FilterError::NonFinite);
        }
        Ok((new_state, new_cov))
    }
}

pub fn is_finite(state: &State, cov: &Covariance) -> bool {
    state.iter().all(|v| v.is_finite()) && cov.iter().all(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn filter() -> CvFilter {
        CvFilter::new(NoiseConfig::default())
    }

    #[test]
    fn predict_constant_velocity() {
        let kf = filter();
        let state = Vector4::new(0.0, 0.0, 8.0, -2.0);
        let (pred, _) = kf.predict(&state, &kf.prior_covariance(), 0.5);
        assert_abs_diff_eq!(pred[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pred[1], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pred[2], 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pred[3], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn predict_grows_covariance_by_process_noise() {
        let kf = filter();
        let cov = Matrix4::<f64>::zeros();
        let (_, pred) = kf.predict(&Vector4::zeros(), &cov, 2.0);
        assert_abs_diff_eq!(pred[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pred[(2, 2)], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn update_reduces_uncertainty() {
        let kf = filter();
        let (state, cov) = kf.initiate(10.0, 5.0);
        let z = Vector2::new(10.5, 5.0);
        let (new_state, new_cov) = kf.update(&state, &cov, &z).unwrap();
        assert!(new_cov[(0, 0)] < cov[(0, 0)]);
        assert!(new_state[0] > 10.0 && new_state[0] < 10.5);
    }

    #[test]
    fn joseph_form_keeps_covariance_symmetric() {
        let kf = filter();
        let (mut state, mut cov) = kf.initiate(0.0, 0.0);
        for i in 1..50 {
            (state, cov) = kf.predict(&state, &cov, 0.1);
            let z = Vector2::new(i as f64 * 0.8, 0.3 * (i as f64).sin());
            (state, cov) = kf.update(&state, &cov, &z).unwrap();
        }
        assert_abs_diff_eq!(cov, cov.transpose(), epsilon = 1e-9);
        assert!(cov.diagonal().iter().all(|v| *v > 0.0));
    }

    #[test]
    fn velocity_converges_on_constant_motion() {
        let kf = filter();
        let (mut state, mut cov) = kf.initiate(0.0, 6.0);
        for i in 1..=10 {
            (state, cov) = kf.predict(&state, &cov, 0.1);
            let z = Vector2::new(i as f64 * 0.8, 6.0);
            (state, cov) = kf.update(&state, &cov, &z).unwrap();
        }
        assert_abs_diff_eq!(state[2], 8.0, epsilon = 1.0);
        assert_abs_diff_eq!(state[3], 0.0, epsilon = 0.5);
    }

    #[test]
    fn mahalanobis_zero_at_prediction() {
        let kf = filter();
        let (state, cov) = kf.initiate(3.0, 4.0);
        let inn = kf.innovation(&state, &cov).unwrap();
        assert_abs_diff_eq!(inn.mahalanobis_sq(&Vector2::new(3.0, 4.0)), 0.0, epsilon = 1e-12);
        // S = 1.0 + 0.3 per axis → one metre off is 1/1.3.
        assert_abs_diff_eq!(inn.mahalanobis_sq(&Vector2::new(4.0, 4.0)), 1.0 / 1.3, epsilon = 1e-9);
    }

    #[test]
    fn singular_innovation_is_reported() {
        let kf = CvFilter::new(NoiseConfig {
            measurement_variance: 0.0,
            initial_position_variance: 0.0,
            ..NoiseConfig::default()
        });
        let (state, cov) = kf.initiate(0.0, 0.0);
        assert_eq!(kf.innovation(&state, &cov).unwrap_err(), FilterError::SingularInnovation);
        assert!(kf.update(&state, &cov, &Vector2::new(1.0, 0.0)).is_err());
    }

    #[test]
    fn nan_covariance_is_reported() {
        let kf = filter();
        let state = Vector4::zeros();
        let cov = Matrix4::from_element(f64::NAN);
        assert!(kf.innovation(&state, &cov).is_err());
    }

    #[test]
    fn negative_noise_rejected() {
        let cfg = NoiseConfig {
            measurement_variance: -0.3,
            ..NoiseConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(NoiseConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_measurement_noise_rejected() {
        let exact = NoiseConfig {
            measurement_variance: 0.0,
            ..NoiseConfig::default()
        };
        assert!(matches!(
            exact.validate(),
            Err(ConfigError::Invalid { field: "tracker.measurement_variance", .. })
        ));
        // A certain birth position is fine while R keeps S invertible.
        let certain_birth = NoiseConfig {
            initial_position_variance: 0.0,
            ..NoiseConfig::default()
        };
        assert!(certain_birth.validate().is_ok());
        let kf = CvFilter::new(certain_birth);
        let (state, cov) = kf.initiate(0.0, 0.0);
        assert!(kf.update(&state, &cov, &Vector2::new(0.5, 0.0)).is_ok());
    }
}
