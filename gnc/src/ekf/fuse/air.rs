//! Air relative measurement models: true airspeed, synthetic zero sideslip
//! and multirotor rotor drag. All of them observe the wind states.

use defmt_or_log::warn;
use nalgebra::{Matrix3, RowVector3, Vector3};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use crate::{
    common::math::sq,
    ekf::{
        Ekf,
        fusion::test_ratio,
        states::{StateMask, StateVector, THETA, VEL, WIND},
        status::{ControlStatus, FaultStatus, InnovationFaultStatus},
    },
};

/// Below this predicted airspeed the airspeed Jacobian is poorly defined (m/s)
const MIN_AIRSPEED_PRED: f32 = 1.0;
/// Sideslip is only observable at flying speeds (m/s)
const MIN_SIDESLIP_AIRSPEED: f32 = 7.0;
/// Drag specific force innovation gate (SD)
const DRAG_INNOV_GATE: f32 = 5.0;
/// Ballistic coefficients below this disable drag fusion on the axis (kg/m^2)
const MIN_BALLISTIC_COEF: f32 = 1.0;

impl Ekf {
    /// Velocity of the vehicle relative to the air, in the earth frame.
    fn rel_wind_earth(&self) -> Vector3<f32> {
        self.state.vel - Vector3::new(self.state.wind_vel.x, self.state.wind_vel.y, 0.0)
    }

    /// Writes the Jacobian of a function of the body frame relative wind,
    /// given its gradient `d_body`, into the attitude, velocity and wind
    /// columns of `h`.
    fn set_body_rel_wind_jacobian(&self, h: &mut StateVector, d_body: &RowVector3<f32>) {
        let rt: Matrix3<f32> = self.r_to_earth.transpose();
        let rel_wind = self.rel_wind_earth();

        let d_theta = d_body * rt * rel_wind.cross_matrix();
        let d_vel = d_body * rt;

        for j in 0..3 {
            h[THETA + j] = d_theta[j];
            h[VEL + j] = d_vel[j];
        }
        h[WIND] = -d_vel[0];
        h[WIND + 1] = -d_vel[1];
    }

    pub(crate) fn fuse_airspeed(&mut self) {
        let rel_wind = self.rel_wind_earth();
        let tas_pred = rel_wind.norm();

        if tas_pred <= MIN_AIRSPEED_PRED {
            return;
        }

        let mut h = StateVector::zeros();
        for j in 0..3 {
            h[VEL + j] = rel_wind[j] / tas_pred;
        }
        h[WIND] = -rel_wind.x / tas_pred;
        h[WIND + 1] = -rel_wind.y / tas_pred;

        let eas2tas = self.airspeed_sample_delayed.eas2tas.clamp(0.9, 10.0);
        let obs_var = sq(self.params.eas_noise * eas2tas);

        let innov_var = match self.innovation_variance(&h, obs_var) {
            Ok(var) => var,
            Err(_) => {
                warn!("EKF airspeed fusion numerical error, resetting wind covariance");
                self.fault_status.insert(FaultStatus::BAD_AIRSPEED);
                self.reset_wind_covariance();
                return;
            }
        };

        let innov = self.airspeed_sample_delayed.true_airspeed - tas_pred;
        let ratio = test_ratio(innov, innov_var, self.params.tas_innov_gate.max(1.0));
        self.innov.airspeed = innov;
        self.innov.airspeed_var = innov_var;
        self.innov.tas_test_ratio = ratio;

        if ratio > 1.0 {
            self.innov_check_fail_status.insert(InnovationFaultStatus::REJECT_AIRSPEED);
            return;
        }
        self.innov_check_fail_status.remove(InnovationFaultStatus::REJECT_AIRSPEED);

        let result = self.fuse_scalar(&h, innov, innov_var, &StateMask::all());
        self.fault_status.set(FaultStatus::BAD_AIRSPEED, result.is_err());
        if result.is_ok() {
            self.time_last_arsp_fuse = self.time_last_imu;
        }
    }

    /// Fuses the assumption that a fixed wing flies without sideslip, which
    /// makes the wind observable without an airspeed sensor.
    pub(crate) fn fuse_sideslip(&mut self) {
        let rel_wind_body = self.r_to_earth.transpose() * self.rel_wind_earth();

        if rel_wind_body.x < MIN_SIDESLIP_AIRSPEED {
            return;
        }

        let (u, v) = (rel_wind_body.x, rel_wind_body.y);
        let beta_pred = v / u;
        let d_body = RowVector3::new(-v / sq(u), 1.0 / u, 0.0);

        let mut h = StateVector::zeros();
        self.set_body_rel_wind_jacobian(&mut h, &d_body);

        let innov_var = match self.innovation_variance(&h, sq(self.params.beta_noise)) {
            Ok(var) => var,
            Err(_) => {
                warn!("EKF sideslip fusion numerical error, resetting wind covariance");
                self.fault_status.insert(FaultStatus::BAD_SIDESLIP);
                self.reset_wind_covariance();
                return;
            }
        };

        let innov = -beta_pred;
        let ratio = test_ratio(innov, innov_var, self.params.beta_innov_gate.max(1.0));
        self.innov.beta = innov;
        self.innov.beta_var = innov_var;
        self.innov.beta_test_ratio = ratio;

        if ratio > 1.0 {
            self.innov_check_fail_status.insert(InnovationFaultStatus::REJECT_SIDESLIP);
            return;
        }
        self.innov_check_fail_status.remove(InnovationFaultStatus::REJECT_SIDESLIP);

        let result = self.fuse_scalar(&h, innov, innov_var, &StateMask::all());
        self.fault_status.set(FaultStatus::BAD_SIDESLIP, result.is_err());
        if result.is_ok() {
            self.time_last_beta_fuse = self.time_last_imu;
        }
    }

    /// Fuses the body X and Y specific force produced by rotor momentum
    /// drag, which is proportional to the airspeed along each axis.
    pub(crate) fn fuse_drag(&mut self) {
        let rho = self.host.air_density.max(0.1);
        let rel_wind_body = self.r_to_earth.transpose() * self.rel_wind_earth();
        let airspeed = rel_wind_body.norm();

        if airspeed < 1e-3 {
            return;
        }

        let bcoef = [self.params.bcoef_x, self.params.bcoef_y];
        let obs_var = sq(self.params.drag_noise.max(0.1));

        for axis in 0..2 {
            if bcoef[axis] < MIN_BALLISTIC_COEF {
                continue;
            }

            let k = 0.5 * rho / bcoef[axis];
            let pred = -k * airspeed * rel_wind_body[axis];

            let mut d_body = RowVector3::from_iterator(rel_wind_body.iter().map(|c| -k * rel_wind_body[axis] * c / airspeed));
            d_body[axis] -= k * airspeed;

            let mut h = StateVector::zeros();
            self.set_body_rel_wind_jacobian(&mut h, &d_body);

            let Ok(innov_var) = self.innovation_variance(&h, obs_var) else {
                warn!("EKF drag fusion numerical error");
                self.reset_wind_covariance();
                return;
            };

            let meas = self.drag_sample_delayed.accel_xy[axis] - self.state.accel_bias[axis];
            let innov = meas - pred;
            self.innov.drag[axis] = innov;
            self.innov.drag_var[axis] = innov_var;
            self.innov.drag_test_ratio[axis] = test_ratio(innov, innov_var, DRAG_INNOV_GATE);

            if self.innov.drag_test_ratio[axis] > 1.0 {
                continue;
            }

            if self.fuse_scalar(&h, innov, innov_var, &StateMask::all()).is_err() {
                warn!("EKF drag fusion numerical error");
            }
        }
    }

    /// True while wind is being estimated from air data alone.
    pub(crate) fn air_data_aiding(&self) -> bool {
        self.control_status.contains(ControlStatus::WIND)
            && self.control_status.intersects(ControlStatus::FUSE_ASPD | ControlStatus::FUSE_BETA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::Parameters;
    use approx::assert_abs_diff_eq;
    use nalgebra::{UnitQuaternion, Vector2};

    fn flying_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.state.quat_nominal = UnitQuaternion::from_euler_angles(0.0, 0.05, 0.3);
        ekf.r_to_earth = ekf.state.quat_nominal.to_rotation_matrix().into_inner();
        ekf.state.vel = Vector3::new(15.0 * 0.3_f32.cos(), 15.0 * 0.3_f32.sin(), 0.0);
        ekf.control_status
            .insert(ControlStatus::TILT_ALIGN | ControlStatus::IN_AIR | ControlStatus::WIND);
        ekf
    }

    #[test]
    fn test_sideslip_jacobian_matches_finite_difference() {
        let mut ekf = flying_ekf();
        ekf.state.wind_vel = Vector2::new(2.0, -3.0);

        let beta = |e: &Ekf| {
            let b = e.r_to_earth.transpose() * e.rel_wind_earth();
            b.y / b.x
        };
        let b0 = beta(&ekf);
        let rel = ekf.r_to_earth.transpose() * ekf.rel_wind_earth();
        let d_body = RowVector3::new(-rel.y / sq(rel.x), 1.0 / rel.x, 0.0);
        let mut h = StateVector::zeros();
        ekf.set_body_rel_wind_jacobian(&mut h, &d_body);

        ekf.state.wind_vel.y += 1e-2;
        assert_abs_diff_eq!((beta(&ekf) - b0) / 1e-2, h[WIND + 1], epsilon = 1e-3);
        ekf.state.wind_vel.y -= 1e-2;

        let q = ekf.state.quat_nominal;
        ekf.r_to_earth = (UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 1e-3)) * q)
            .to_rotation_matrix()
            .into_inner();
        assert_abs_diff_eq!((beta(&ekf) - b0) / 1e-3, h[THETA + 2], epsilon = 1e-2);
    }

    #[test]
    fn test_airspeed_estimates_headwind() {
        let mut ekf = flying_ekf();
        ekf.airspeed_sample_delayed.true_airspeed = 17.0;
        ekf.airspeed_sample_delayed.eas2tas = 1.0;

        for _ in 0..20 {
            ekf.fuse_airspeed();
        }

        // Flying faster through the air than over ground means a headwind
        let along_track = ekf.state.wind_vel.dot(&ekf.state.vel.xy().normalize());
        assert!(along_track < -0.5);
        assert!(!ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_AIRSPEED));
        assert_eq!(ekf.time_last_arsp_fuse, ekf.time_last_imu);
    }

    #[test]
    fn test_no_sideslip_when_aligned_with_track() {
        let mut ekf = flying_ekf();
        ekf.fuse_sideslip();

        assert_abs_diff_eq!(ekf.innov.beta, 0.0, epsilon = 1e-6);
        assert!(!ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_SIDESLIP));
    }
}
