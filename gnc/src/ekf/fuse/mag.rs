//! Magnetometer measurement models: the yaw angle, the three body field
//! components and the declination of the earth field.

use defmt_or_log::warn;
use nalgebra::Vector3;
#[cfg(not(feature = "std"))]
use num_traits::Float;

use crate::{
    common::math::{prefer_321_yaw, sq, wrap_pi, yaw_312, yaw_321},
    ekf::{
        Ekf,
        fusion::test_ratio,
        params::DeclinationSource,
        states::{MAG_B, MAG_I, StateMask, StateVector, THETA},
        status::{ControlStatus, FaultStatus, InnovationFaultStatus},
    },
};

const MAG_AXIS_FAULTS: [FaultStatus; 3] = [FaultStatus::BAD_MAG_X, FaultStatus::BAD_MAG_Y, FaultStatus::BAD_MAG_Z];
const MAG_AXIS_REJECTS: [InnovationFaultStatus; 3] = [
    InnovationFaultStatus::REJECT_MAG_X,
    InnovationFaultStatus::REJECT_MAG_Y,
    InnovationFaultStatus::REJECT_MAG_Z,
];

/// Declination uncertainty while GPS constrains the heading (rad)
const DECL_SIGMA_GPS: f32 = 0.5;
/// Declination uncertainty without GPS (rad)
const DECL_SIGMA_NO_GPS: f32 = 0.02;
/// Largest declination innovation applied in one step (rad)
const DECL_INNOV_LIM: f32 = 0.5;
/// Below this horizontal earth field strength the declination is undefined (gauss^2)
const MIN_HORIZ_FIELD_SQ: f32 = 1e-4;

/// Yaw of `r` in the requested sequence and its derivative with respect to
/// an earth frame rotation error.
fn yaw_and_jacobian(r: &nalgebra::Matrix3<f32>, use_321: bool) -> (f32, Vector3<f32>) {
    if use_321 {
        let d = sq(r[(0, 0)]) + sq(r[(1, 0)]);
        let h = Vector3::new(-r[(0, 0)] * r[(2, 0)] / d, -r[(1, 0)] * r[(2, 0)] / d, 1.0);
        (yaw_321(r), h)
    } else {
        let d = sq(r[(0, 1)]) + sq(r[(1, 1)]);
        let h = Vector3::new(-r[(0, 1)] * r[(2, 1)] / d, -r[(1, 1)] * r[(2, 1)] / d, 1.0);
        (yaw_312(r), h)
    }
}

impl Ekf {
    fn mag_fusion_mask(&self) -> StateMask {
        if self.control_status.contains(ControlStatus::UPDATE_MAG_STATES_ONLY) {
            StateMask::none().with_range(MAG_I, 6, true)
        } else {
            StateMask::all()
        }
    }

    /// Predicted body field on `axis` and its Jacobian.
    fn mag_observation(&self, axis: usize) -> (f32, StateVector) {
        let rt = self.r_to_earth.transpose();
        let pred = rt * self.state.mag_i + self.state.mag_b;
        let d_theta = rt * self.state.mag_i.cross_matrix();

        let mut h = StateVector::zeros();
        for j in 0..3 {
            h[THETA + j] = d_theta[(axis, j)];
            h[MAG_I + j] = rt[(axis, j)];
        }
        h[MAG_B + axis] = 1.0;

        (pred[axis], h)
    }

    /// Fuses the three body field components. All axes must pass their
    /// innovation gate before any is fused.
    pub(crate) fn fuse_mag(&mut self) {
        let mag = self.mag_sample_delayed.mag;
        let obs_var = sq(self.params.mag_noise);
        let gate = self.params.mag_innov_gate.max(1.0);

        for axis in 0..3 {
            let (pred, h) = self.mag_observation(axis);

            let innov_var = match self.innovation_variance(&h, obs_var) {
                Ok(var) => var,
                Err(_) => {
                    warn!("EKF magnetometer fusion numerical error, resetting field covariance");
                    self.fault_status.insert(MAG_AXIS_FAULTS[axis]);
                    self.reset_mag_covariance();
                    return;
                }
            };
            self.fault_status.remove(MAG_AXIS_FAULTS[axis]);

            let innov = mag[axis] - pred;
            let ratio = test_ratio(innov, innov_var, gate);
            self.innov.mag[axis] = innov;
            self.innov.mag_var[axis] = innov_var;
            self.innov.mag_test_ratio[axis] = ratio;
            self.innov_check_fail_status
                .set(MAG_AXIS_REJECTS[axis], ratio > 1.0);
        }

        if self.innov.mag_test_ratio.iter().any(|r| *r > 1.0) {
            return;
        }

        let mask = self.mag_fusion_mask();
        for axis in 0..3 {
            let (pred, h) = self.mag_observation(axis);
            let result = self
                .innovation_variance(&h, obs_var)
                .and_then(|innov_var| self.fuse_scalar(&h, mag[axis] - pred, innov_var, &mask));

            if result.is_err() {
                self.fault_status.insert(MAG_AXIS_FAULTS[axis]);
                return;
            }
        }
    }

    /// Fuses the yaw angle observed by the vision attitude or the
    /// magnetometer. Rejected observations are still fused on ground with the
    /// innovation limited to the gate, so that a large initial yaw error
    /// can be removed before take-off.
    pub(crate) fn fuse_heading(&mut self) {
        let mag = self.mag_sample_delayed.mag;
        let Some((meas, obs_var)) = self.yaw_observation(&mag) else {
            return;
        };

        let use_321 = prefer_321_yaw(&self.r_to_earth);
        let (pred, h_theta) = yaw_and_jacobian(&self.r_to_earth, use_321);

        let mut h = StateVector::zeros();
        for j in 0..3 {
            h[THETA + j] = h_theta[j];
        }

        let innov_var = match self.innovation_variance(&h, obs_var) {
            Ok(var) => var,
            Err(_) => {
                warn!("EKF heading fusion numerical error");
                self.fault_status.insert(FaultStatus::BAD_MAG_HDG);
                return;
            }
        };

        let gate = self.params.heading_innov_gate.max(1.0);
        let mut innov = wrap_pi(meas - pred);
        let ratio = test_ratio(innov, innov_var, gate);
        self.innov.heading = innov;
        self.innov.heading_var = innov_var;
        self.innov.yaw_test_ratio = ratio;

        if ratio > 1.0 {
            self.innov_check_fail_status.insert(InnovationFaultStatus::REJECT_YAW);

            if self.control_status.contains(ControlStatus::IN_AIR) {
                return;
            }

            let limit = gate * innov_var.sqrt();
            innov = innov.clamp(-limit, limit);
        } else {
            self.innov_check_fail_status.remove(InnovationFaultStatus::REJECT_YAW);
        }

        let mask = self.mag_fusion_mask();
        let result = self.fuse_scalar(&h, innov, innov_var, &mask);
        self.fault_status.set(FaultStatus::BAD_MAG_HDG, result.is_err());
    }

    /// Declination used as the reference for the earth field direction.
    pub(crate) fn declination_reference(&self) -> f32 {
        if self
            .params
            .mag_declination_source
            .contains(DeclinationSource::USE_GEO_DECL)
            && self.ned_origin_initialised
        {
            self.mag_declination_gps
        } else {
            self.params.mag_declination_deg.to_radians()
        }
    }

    /// Fuses the declination of the earth field states to keep the field
    /// direction from drifting when nothing else observes it.
    pub(crate) fn fuse_declination(&mut self) {
        let mag_n = self.state.mag_i.x;
        let mag_e = self.state.mag_i.y;
        let h_field_sq = sq(mag_n) + sq(mag_e);

        if h_field_sq < MIN_HORIZ_FIELD_SQ {
            return;
        }

        let sigma = if self.control_status.contains(ControlStatus::GPS) {
            DECL_SIGMA_GPS
        } else {
            DECL_SIGMA_NO_GPS
        };

        let mut h = StateVector::zeros();
        h[MAG_I] = -mag_e / h_field_sq;
        h[MAG_I + 1] = mag_n / h_field_sq;

        let innov = wrap_pi(self.declination_reference() - mag_e.atan2(mag_n)).clamp(-DECL_INNOV_LIM, DECL_INNOV_LIM);

        let mask = self.mag_fusion_mask();
        let result = self
            .innovation_variance(&h, sq(sigma))
            .and_then(|innov_var| self.fuse_scalar(&h, innov, innov_var, &mask));

        if result.is_err() {
            warn!("EKF declination fusion numerical error");
        }
        self.fault_status.set(FaultStatus::BAD_MAG_DECL, result.is_err());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::Parameters;
    use approx::assert_abs_diff_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn mag_ekf(yaw: f32) -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.state.quat_nominal = UnitQuaternion::from_euler_angles(0.05, -0.1, yaw);
        ekf.r_to_earth = ekf.state.quat_nominal.to_rotation_matrix().into_inner();
        ekf.state.mag_i = Vector3::new(0.2, 0.02, 0.4);
        ekf.control_status
            .insert(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN | ControlStatus::MAG_3D);
        ekf
    }

    #[test]
    fn test_yaw_jacobian_matches_finite_difference() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.0);
        let r = q.to_rotation_matrix().into_inner();

        for use_321 in [true, false] {
            let (yaw, h) = yaw_and_jacobian(&r, use_321);
            for j in 0..3 {
                let mut dtheta = Vector3::zeros();
                dtheta[j] = 1e-3;
                let rp = (UnitQuaternion::from_scaled_axis(dtheta) * q).to_rotation_matrix().into_inner();
                let (yaw_p, _) = yaw_and_jacobian(&rp, use_321);
                assert_abs_diff_eq!((yaw_p - yaw) / 1e-3, h[j], epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn test_mag_jacobian_matches_finite_difference() {
        let mut ekf = mag_ekf(0.7);

        for axis in 0..3 {
            let (pred, h) = ekf.mag_observation(axis);
            let q = ekf.state.quat_nominal;
            for j in 0..3 {
                let mut dtheta = Vector3::zeros();
                dtheta[j] = 1e-3;
                ekf.r_to_earth = (UnitQuaternion::from_scaled_axis(dtheta) * q).to_rotation_matrix().into_inner();
                let (pred_p, _) = ekf.mag_observation(axis);
                assert_abs_diff_eq!((pred_p - pred) / 1e-3, h[THETA + j], epsilon = 1e-2);
            }
            ekf.r_to_earth = q.to_rotation_matrix().into_inner();
        }
    }

    #[test]
    fn test_consistent_mag_is_fused() {
        let mut ekf = mag_ekf(0.7);
        ekf.mag_sample_delayed.mag = ekf.r_to_earth.transpose() * ekf.state.mag_i;
        let var_before = ekf.p[(MAG_I, MAG_I)];

        ekf.fuse_mag();

        assert!(ekf.innov.mag_test_ratio.iter().all(|r| *r < 1e-6));
        assert!(ekf.p[(MAG_I, MAG_I)] < var_before);
        assert!(ekf.fault_status.is_empty());
    }

    #[test]
    fn test_one_bad_axis_rejects_all() {
        let mut ekf = mag_ekf(0.7);
        let mut mag = ekf.r_to_earth.transpose() * ekf.state.mag_i;
        mag.z += 5.0;
        ekf.mag_sample_delayed.mag = mag;
        let state_before = ekf.state;

        ekf.fuse_mag();

        assert!(ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_MAG_Z));
        assert!(!ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_MAG_X));
        assert_eq!(ekf.state.mag_i, state_before.mag_i);
    }

    #[test]
    fn test_heading_rejected_in_air_limited_on_ground() {
        let mut ekf = mag_ekf(0.0);
        ekf.control_status.remove(ControlStatus::MAG_3D);
        ekf.control_status.insert(ControlStatus::MAG_HDG);

        // Field measured with the vehicle yawed by 90 deg
        let truth = UnitQuaternion::from_euler_angles(0.05, -0.1, core::f32::consts::FRAC_PI_2);
        ekf.mag_sample_delayed.mag = truth.inverse() * Vector3::new(0.2, 0.0, 0.4);

        ekf.control_status.insert(ControlStatus::IN_AIR);
        ekf.fuse_heading();
        assert!(ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_YAW));
        assert_abs_diff_eq!(ekf.state.quat_nominal.euler_angles().2, 0.0);

        ekf.control_status.remove(ControlStatus::IN_AIR);
        ekf.fuse_heading();
        assert!(ekf.state.quat_nominal.euler_angles().2 > 0.0);
    }

    #[test]
    fn test_declination_pulls_field_direction() {
        let mut ekf = mag_ekf(0.0);
        ekf.params.mag_declination_deg = 10.0;
        ekf.state.mag_i = Vector3::new(0.2, 0.0, 0.4);

        ekf.fuse_declination();

        assert!(ekf.state.mag_i.y > 0.0);
        assert!(!ekf.fault_status.contains(FaultStatus::BAD_MAG_DECL));
    }
}
