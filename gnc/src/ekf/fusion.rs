//! Sequential scalar Kalman updates shared by all measurement models.

use nalgebra::UnitQuaternion;
use thiserror::Error;

use super::{
    Ekf,
    status::ControlStatus,
    states::{ACCEL_BIAS, GYRO_BIAS, MAG_B, MAG_I, POS, StateMask, StateVector, THETA, VEL, WIND},
};
use crate::common::math::sq;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum FusionError {
    #[error("Innovation variance {innov_var} is below the observation variance {obs_var}")]
    BadInnovationVariance { innov_var: f32, obs_var: f32 },

    #[error("Kalman gain is not finite")]
    NonFiniteGain,
}

/// Latest innovations, innovation variances and test ratios of every
/// measurement model, kept for monitoring and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Innovations {
    /// North, East, Down velocity then North, East, Down position
    pub vel_pos: [f32; 6],
    pub vel_pos_var: [f32; 6],
    pub vel_pos_test_ratio: [f32; 6],

    pub mag: [f32; 3],
    pub mag_var: [f32; 3],
    pub mag_test_ratio: [f32; 3],

    pub heading: f32,
    pub heading_var: f32,
    pub yaw_test_ratio: f32,

    pub airspeed: f32,
    pub airspeed_var: f32,
    pub tas_test_ratio: f32,

    pub beta: f32,
    pub beta_var: f32,
    pub beta_test_ratio: f32,

    pub flow: [f32; 2],
    pub flow_var: [f32; 2],
    pub flow_test_ratio: [f32; 2],

    pub drag: [f32; 2],
    pub drag_var: [f32; 2],
    pub drag_test_ratio: [f32; 2],

    pub aux_vel: [f32; 2],
    pub aux_vel_var: [f32; 2],
    pub aux_vel_test_ratio: [f32; 2],

    pub hagl: f32,
    pub hagl_var: f32,
    pub hagl_test_ratio: f32,
}

/// Normalised innovation squared against a gate expressed in standard deviations.
#[inline]
pub fn test_ratio(innov: f32, innov_var: f32, gate: f32) -> f32 {
    sq(innov) / (sq(gate) * innov_var)
}

impl Ekf {
    /// `H P H' + R` for a scalar observation with Jacobian `h`.
    pub(crate) fn innovation_variance(&self, h: &StateVector, obs_var: f32) -> Result<f32, FusionError> {
        let innov_var = h.dot(&(self.p * h)) + obs_var;

        if innov_var.is_finite() && innov_var >= obs_var {
            Ok(innov_var)
        } else {
            Err(FusionError::BadInnovationVariance { innov_var, obs_var })
        }
    }

    /// States that may currently receive a correction. Magnetic field, wind and
    /// individual accelerometer bias axes are frozen while they are not being
    /// estimated.
    pub(crate) fn correctable_states(&self) -> StateMask {
        let mut mask = StateMask::all();

        if !self.control_status.contains(ControlStatus::MAG_3D) {
            mask.set_range(MAG_I, 6, false);
        }

        if !self.control_status.contains(ControlStatus::WIND) {
            mask.set_range(WIND, 2, false);
        }

        for (axis, inhibited) in self.accel_bias_inhibit.iter().enumerate() {
            if *inhibited {
                mask.set(ACCEL_BIAS + axis, false);
            }
        }

        mask
    }

    /// Fuses one scalar observation using the Joseph form, which stays
    /// symmetric and positive semi-definite for any gain, including the
    /// masked ones produced here.
    ///
    /// `innov` is measurement minus prediction and `innov_var` must come from
    /// [`Ekf::innovation_variance`] for the same `h`.
    pub(crate) fn fuse_scalar(
        &mut self,
        h: &StateVector,
        innov: f32,
        innov_var: f32,
        mask: &StateMask,
    ) -> Result<(), FusionError> {
        let ph = self.p * h;
        let mut k = ph / innov_var;
        mask.intersect(&self.correctable_states()).apply(&mut k);

        if k.iter().any(|x| !x.is_finite()) {
            return Err(FusionError::NonFiniteGain);
        }

        // (I - k h') P (I - k h')' + k R k'
        let kph = k * ph.transpose();
        self.p -= kph + kph.transpose();
        self.p += (k * k.transpose()) * innov_var;

        self.apply_correction(&(k * innov));
        self.fix_covariance_errors();

        Ok(())
    }

    /// Injects an error state correction into the nominal state.
    pub(crate) fn apply_correction(&mut self, dx: &StateVector) {
        let dtheta = dx.fixed_rows::<3>(THETA).into_owned();
        let q = UnitQuaternion::from_scaled_axis(dtheta) * self.state.quat_nominal;
        self.state.quat_nominal = UnitQuaternion::new_normalize(q.into_inner());

        self.state.vel += dx.fixed_rows::<3>(VEL);
        self.state.pos += dx.fixed_rows::<3>(POS);
        self.state.gyro_bias += dx.fixed_rows::<3>(GYRO_BIAS);
        self.state.accel_bias += dx.fixed_rows::<3>(ACCEL_BIAS);
        self.state.mag_i += dx.fixed_rows::<3>(MAG_I);
        self.state.mag_b += dx.fixed_rows::<3>(MAG_B);
        self.state.wind_vel += dx.fixed_rows::<2>(WIND);

        let lim = self.params.acc_bias_lim;
        self.state.accel_bias = self.state.accel_bias.map(|b| b.clamp(-lim, lim));

        self.r_to_earth = self.state.quat_nominal.to_rotation_matrix().into_inner();
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    use super::*;
    use crate::ekf::{Parameters, states::Covariance};

    fn aligned_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf
    }

    #[test]
    fn test_test_ratio() {
        assert_abs_diff_eq!(test_ratio(1.0, 1.0, 1.0), 1.0);
        assert_abs_diff_eq!(test_ratio(3.0, 1.0, 5.0), 9.0 / 25.0);
        assert_abs_diff_eq!(test_ratio(-2.0, 4.0, 1.0), 1.0);
    }

    #[test]
    fn test_direct_observation_halves_variance() {
        let mut ekf = aligned_ekf();
        let var = ekf.p[(POS, POS)];

        let mut h = StateVector::zeros();
        h[POS] = 1.0;

        let innov_var = ekf.innovation_variance(&h, var).unwrap();
        assert_abs_diff_eq!(innov_var, 2.0 * var);

        ekf.fuse_scalar(&h, 1.0, innov_var, &StateMask::all()).unwrap();

        assert_abs_diff_eq!(ekf.p[(POS, POS)], 0.5 * var, epsilon = 1e-6);
        assert_abs_diff_eq!(ekf.state.pos.x, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(ekf.state.pos.y, 0.0);
    }

    #[test]
    fn test_masked_states_are_not_corrected() {
        let mut ekf = aligned_ekf();
        ekf.p[(VEL, POS)] = 0.1;
        ekf.p[(POS, VEL)] = 0.1;
        let vel_var = ekf.p[(VEL, VEL)];

        let mut h = StateVector::zeros();
        h[POS] = 1.0;
        let innov_var = ekf.innovation_variance(&h, 0.1).unwrap();

        let mask = StateMask::all().with_range(VEL, 3, false);
        ekf.fuse_scalar(&h, 2.0, innov_var, &mask).unwrap();

        assert_eq!(ekf.state.vel, Vector3::zeros());
        assert_abs_diff_eq!(ekf.p[(VEL, VEL)], vel_var);
        assert!(ekf.state.pos.x > 0.0);
    }

    #[test]
    fn test_bad_innovation_variance() {
        let mut ekf = aligned_ekf();
        ekf.p = Covariance::zeros();
        ekf.p[(POS, POS)] = -1.0;

        let mut h = StateVector::zeros();
        h[POS] = 1.0;

        assert!(matches!(
            ekf.innovation_variance(&h, 0.5),
            Err(FusionError::BadInnovationVariance { .. })
        ));
    }

    #[test]
    fn test_attitude_correction_keeps_unit_norm() {
        let mut ekf = aligned_ekf();
        let mut dx = StateVector::zeros();
        dx[THETA + 2] = 0.3;
        dx[THETA] = -0.1;

        ekf.apply_correction(&dx);

        assert_abs_diff_eq!(ekf.state.quat_nominal.norm(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ekf.state.quat_nominal.angle(), Vector3::new(-0.1_f32, 0.0, 0.3).norm(), epsilon = 1e-5);
    }

    #[test]
    fn test_accel_bias_correction_is_clipped() {
        let mut ekf = aligned_ekf();
        let mut dx = StateVector::zeros();
        dx[ACCEL_BIAS + 2] = 10.0;

        ekf.apply_correction(&dx);

        assert_abs_diff_eq!(ekf.state.accel_bias.z, ekf.params.acc_bias_lim);
    }
}
