//! Optical flow measurement model. The sensor reports image motion about its
//! X and Y axes with the body rotation removed, which leaves the line of
//! sight rate produced by translation over the terrain.

use defmt_or_log::warn;
use nalgebra::{RowVector3, Vector2, Vector3};

use crate::{
    common::math::sq,
    ekf::{
        Ekf,
        fusion::test_ratio,
        states::{POS, StateMask, StateVector, THETA, VEL},
        status::{FaultStatus, InnovationFaultStatus},
    },
};

const FLOW_AXIS_FAULTS: [FaultStatus; 2] = [FaultStatus::BAD_OPTFLOW_X, FaultStatus::BAD_OPTFLOW_Y];
const FLOW_AXIS_REJECTS: [InnovationFaultStatus; 2] = [
    InnovationFaultStatus::REJECT_OPTFLOW_X,
    InnovationFaultStatus::REJECT_OPTFLOW_Y,
];

/// Lower bound of the flow rate noise (rad/s)
const MIN_FLOW_NOISE: f32 = 0.05;
/// Flow sensor gyro bias learning is limited to this rate error (rad/s)
const FLOW_GYRO_BIAS_STEP_LIM: f32 = 0.1;

impl Ekf {
    /// Line of sight rate variance, blended between the best and worst
    /// quality noise settings by the reported flow quality.
    pub(crate) fn optflow_meas_var(&self) -> f32 {
        let best = self.params.flow_noise.max(MIN_FLOW_NOISE);
        let worst = self.params.flow_noise_qual_min.max(MIN_FLOW_NOISE);

        let span = 255.0 - self.params.flow_qual_min as f32;
        let weighting = if span >= 1.0 {
            ((self.flow_sample_delayed.quality as f32 - self.params.flow_qual_min as f32) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };

        sq(best * weighting + worst * (1.0 - weighting))
    }

    /// Slant range from the flow sensor to the terrain (m).
    fn flow_range(&self) -> f32 {
        self.get_hagl().max(self.params.rng_gnd_clearance) / self.r_to_earth[(2, 2)]
    }

    /// Line of sight rates with the flow sensor gyro bias removed (rad/s).
    fn flow_los_rate(&self) -> Vector2<f32> {
        let flow = &self.flow_sample_delayed;
        flow.flow_rad_xy_comp / flow.dt + self.flow_gyro_bias.xy()
    }

    /// North and East velocity seen by the flow sensor and the slant range it
    /// was computed for. Zero when the range or the integration time is too
    /// small for a meaningful value.
    pub(crate) fn optical_flow_velocity(&self) -> (Vector2<f32>, f32) {
        let range = self.flow_range();

        if range - self.params.rng_gnd_clearance > 0.3 && self.flow_sample_delayed.dt > 0.05 {
            let los = self.flow_los_rate();
            let vel_body = Vector3::new(-range * los.y, range * los.x, 0.0);
            ((self.r_to_earth * vel_body).xy(), range)
        } else {
            (Vector2::zeros(), range)
        }
    }

    /// Learns the flow sensor gyro bias by comparing its rate with the IMU
    /// rate accumulated over the same interval.
    pub(crate) fn calc_opt_flow_bias(&mut self) {
        let flow = self.flow_sample_delayed;

        if self.delta_time_of <= 1.0
            && (self.delta_time_of - flow.dt).abs() < 0.05
            && self.delta_time_of > 0.01
            && flow.dt > 0.01
        {
            let reference_rate = self.imu_del_ang_of / self.delta_time_of;
            let flow_rate = flow.gyro_xyz / flow.dt;
            let error = (flow_rate - reference_rate).map(|e| e.clamp(-FLOW_GYRO_BIAS_STEP_LIM, FLOW_GYRO_BIAS_STEP_LIM));
            self.flow_gyro_bias = self.flow_gyro_bias * 0.99 + error * 0.01;
        }

        self.imu_del_ang_of = Vector3::zeros();
        self.delta_time_of = 0.0;
    }

    /// Predicted line of sight rate about sensor `axis` and its Jacobian.
    fn flow_observation(&self, axis: usize) -> (f32, StateVector) {
        let r = &self.r_to_earth;
        let rt = r.transpose();
        let hagl = self.get_hagl().max(self.params.rng_gnd_clearance);
        let r22 = r[(2, 2)];
        let gain = r22 / hagl;

        let rate = self.imu_sample_delayed.delta_ang / self.imu_sample_delayed.delta_ang_dt - self.state.gyro_bias;
        let lever_arm = self.params.flow_pos_body - self.params.imu_pos_body;
        let vel_body = rt * self.state.vel + rate.cross(&lever_arm);

        // A translation along body Y rotates the scene about X
        let (sign, comp) = if axis == 0 { (1.0, 1) } else { (-1.0, 0) };
        let pred = sign * gain * vel_body[comp];

        let mut d_body = RowVector3::zeros();
        d_body[comp] = sign * gain;
        let d_theta = d_body * rt * self.state.vel.cross_matrix();
        let d_vel = d_body * rt;
        let d_r22 = Vector3::new(r[(1, 2)], -r[(0, 2)], 0.0) * (sign * vel_body[comp] / hagl);

        let mut h = StateVector::zeros();
        for j in 0..3 {
            h[THETA + j] = d_theta[j] + d_r22[j];
            h[VEL + j] = d_vel[j];
        }
        h[POS + 2] = pred / hagl;

        (pred, h)
    }

    /// Fuses both line of sight rates. Either axis failing its gate rejects
    /// the sample.
    pub(crate) fn fuse_opt_flow(&mut self) {
        let obs_var = self.optflow_meas_var();
        let gate = self.params.flow_innov_gate.max(1.0);
        let meas = self.flow_los_rate();

        for axis in 0..2 {
            let (pred, h) = self.flow_observation(axis);

            let innov_var = match self.innovation_variance(&h, obs_var) {
                Ok(var) => var,
                Err(_) => {
                    warn!("EKF optical flow fusion numerical error");
                    self.fault_status.insert(FLOW_AXIS_FAULTS[axis]);
                    return;
                }
            };

            let innov = meas[axis] - pred;
            let ratio = test_ratio(innov, innov_var, gate);
            self.innov.flow[axis] = innov;
            self.innov.flow_var[axis] = innov_var;
            self.innov.flow_test_ratio[axis] = ratio;
            self.innov_check_fail_status
                .set(FLOW_AXIS_REJECTS[axis], ratio > 1.0);
        }

        if self.innov.flow_test_ratio.iter().any(|r| *r > 1.0) {
            return;
        }

        for axis in 0..2 {
            let (pred, h) = self.flow_observation(axis);
            let result = self
                .innovation_variance(&h, obs_var)
                .and_then(|innov_var| self.fuse_scalar(&h, meas[axis] - pred, innov_var, &StateMask::all()));

            self.fault_status.set(FLOW_AXIS_FAULTS[axis], result.is_err());
            if result.is_err() {
                return;
            }
        }

        self.time_last_of_fuse = self.time_last_imu;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::{Parameters, status::ControlStatus};
    use approx::assert_abs_diff_eq;

    fn hovering_ekf(hagl: f32) -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.state.pos.z = -hagl;
        ekf.terrain.set(0.0, 0.1);
        ekf.imu_sample_delayed.delta_ang_dt = 0.01;
        ekf.imu_sample_delayed.delta_vel_dt = 0.01;
        ekf.flow_sample_delayed.dt = 0.1;
        ekf.flow_sample_delayed.quality = 255;
        ekf.control_status.insert(ControlStatus::TILT_ALIGN | ControlStatus::IN_AIR);
        ekf
    }

    #[test]
    fn test_meas_var_follows_quality() {
        let mut ekf = hovering_ekf(5.0);
        assert_abs_diff_eq!(ekf.optflow_meas_var(), sq(0.15));

        ekf.flow_sample_delayed.quality = ekf.params.flow_qual_min;
        assert_abs_diff_eq!(ekf.optflow_meas_var(), sq(0.5));
    }

    #[test]
    fn test_flow_velocity_inverts_prediction() {
        let mut ekf = hovering_ekf(5.0);
        ekf.state.vel = Vector3::new(1.0, -0.5, 0.0);

        let los = Vector2::new(ekf.flow_observation(0).0, ekf.flow_observation(1).0);
        ekf.flow_sample_delayed.flow_rad_xy_comp = los * ekf.flow_sample_delayed.dt;

        let (vel_ne, range) = ekf.optical_flow_velocity();
        assert_abs_diff_eq!(range, 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(vel_ne.x, 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(vel_ne.y, -0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_flow_corrects_velocity() {
        let mut ekf = hovering_ekf(5.0);

        // Scene moving as if flying north at 1 m/s
        ekf.flow_sample_delayed.flow_rad_xy_comp = Vector2::new(0.0, -1.0 / 5.0) * ekf.flow_sample_delayed.dt;

        ekf.fuse_opt_flow();

        assert!(ekf.state.vel.x > 0.1);
        assert_abs_diff_eq!(ekf.state.vel.y, 0.0, epsilon = 1e-5);
        assert_eq!(ekf.time_last_of_fuse, ekf.time_last_imu);
    }

    #[test]
    fn test_flow_bias_learning() {
        let mut ekf = hovering_ekf(5.0);
        ekf.flow_sample_delayed.gyro_xyz = Vector3::new(0.01, 0.0, 0.0);
        ekf.imu_del_ang_of = Vector3::zeros();
        ekf.delta_time_of = 0.1;

        ekf.calc_opt_flow_bias();

        assert_abs_diff_eq!(ekf.flow_gyro_bias.x, 0.001, epsilon = 1e-6);
        assert_abs_diff_eq!(ekf.delta_time_of, 0.0);
    }
}
