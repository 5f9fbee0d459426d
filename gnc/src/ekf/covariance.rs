//! Error covariance initialisation, prediction and conditioning.

use defmt_or_log::{error, warn};
use nalgebra::Matrix3;

use super::{
    Ekf,
    params::{BADACC_BIAS_PNOISE, FusionMode, VdistSensor},
    states::{ACCEL_BIAS, Covariance, GYRO_BIAS, MAG_B, MAG_I, POS, THETA, VEL, WIND, decorrelate},
    status::{ControlStatus, FaultStatus},
};
use crate::{
    common::math::{GRAVITY_M_S2, sq},
    datatypes::sensors::ImuSample,
};

/// Smallest variance any state is allowed to reach
pub(super) const MIN_STATE_VAR: f32 = 1e-9;

/// Accel bias vertical component and height and velocity innovations must
/// disagree for this long before the bias covariances are decorrelated (us)
const BAD_ACC_BIAS_RESET_US: u64 = 7_000_000;

impl Ekf {
    pub(super) fn filter_period_s(&self) -> f32 {
        self.params.filter_update_period_us as f32 * 1e-6
    }

    pub(super) fn initialise_covariance(&mut self) {
        let params = &self.params;
        self.p = Covariance::zeros();

        for i in 0..3 {
            self.p[(THETA + i, THETA + i)] = sq(params.initial_tilt_err);
        }

        let vel_var = sq(params.gps_vel_noise.max(0.01));
        self.p[(VEL, VEL)] = vel_var;
        self.p[(VEL + 1, VEL + 1)] = vel_var;
        self.p[(VEL + 2, VEL + 2)] = sq(1.5) * vel_var;

        let pos_var = sq(params.gps_pos_noise.max(0.01));
        self.p[(POS, POS)] = pos_var;
        self.p[(POS + 1, POS + 1)] = pos_var;
        self.p[(POS + 2, POS + 2)] = match self.primary_hgt_source {
            VdistSensor::Range => sq(params.range_noise.max(0.01)),
            VdistSensor::Gps => sq((1.5 * params.gps_pos_noise).max(0.01)),
            VdistSensor::Baro | VdistSensor::ExtVision => sq(params.baro_noise.max(0.01)),
        };

        for i in 0..3 {
            self.p[(GYRO_BIAS + i, GYRO_BIAS + i)] = sq(params.switch_on_gyro_bias);
            self.p[(ACCEL_BIAS + i, ACCEL_BIAS + i)] = sq(params.switch_on_accel_bias);
            self.p[(MAG_I + i, MAG_I + i)] = sq(params.mag_noise);
            self.p[(MAG_B + i, MAG_B + i)] = sq(params.mag_noise);
        }

        for i in 0..2 {
            self.p[(WIND + i, WIND + i)] = sq(params.initial_wind_uncertainty);
        }
    }

    /// Decides per axis whether the accelerometer bias may be learned.
    fn update_accel_bias_inhibit(&mut self, imu: &ImuSample, dt: f32) {
        let alpha = (dt / self.params.acc_bias_learn_tc).clamp(0.0, 1.0);
        let beta = 1.0 - alpha;

        self.ang_rate_mag_filt = (imu.delta_ang.norm() / dt).max(beta * self.ang_rate_mag_filt);
        self.accel_mag_filt = (imu.delta_vel.norm() / dt).max(beta * self.accel_mag_filt);

        let manoeuvre_too_high = self.ang_rate_mag_filt > self.params.acc_bias_learn_gyr_lim
            || self.accel_mag_filt > self.params.acc_bias_learn_acc_lim;

        let inhibit_all = self.params.fusion_mode.contains(FusionMode::INHIBIT_ACC_BIAS)
            || manoeuvre_too_high
            || self.bad_vert_accel_detected;

        for axis in 0..3 {
            // Only an axis within 15 deg of vertical is observable
            let observable = self.r_to_earth[(2, axis)].abs() > 0.966;
            self.accel_bias_inhibit[axis] = inhibit_all || !observable;
        }
    }

    /// Propagates the covariance over the delayed IMU interval.
    pub(super) fn predict_covariance(&mut self) {
        let imu = self.imu_sample_delayed;
        let period = self.filter_period_s();
        let dt = imu.delta_ang_dt.clamp(0.5 * period, 2.0 * period);

        self.update_accel_bias_inhibit(&imu, dt);

        let r = self.r_to_earth;
        let delta_vel = imu.delta_vel - self.state.accel_bias * imu.delta_vel_dt;

        let mut f = Covariance::identity();
        f.fixed_view_mut::<3, 3>(THETA, GYRO_BIAS).copy_from(&(-r * dt));
        f.fixed_view_mut::<3, 3>(VEL, THETA)
            .copy_from(&(-(r * delta_vel).cross_matrix()));
        f.fixed_view_mut::<3, 3>(POS, VEL)
            .copy_from(&(Matrix3::identity() * dt));

        let mut f_vel_bias = -r * dt;
        for (axis, inhibited) in self.accel_bias_inhibit.iter().enumerate() {
            if *inhibited {
                f_vel_bias.column_mut(axis).fill(0.0);
            }
        }
        f.fixed_view_mut::<3, 3>(VEL, ACCEL_BIAS).copy_from(&f_vel_bias);

        let mut p = f * self.p * f.transpose();

        let params = &self.params;
        let gyro_var = sq(dt * params.gyro_noise);
        let accel_var = if self.bad_vert_accel_detected {
            sq(dt * BADACC_BIAS_PNOISE)
        } else {
            sq(dt * params.accel_noise)
        };
        let gyro_bias_var = sq(dt * params.gyro_bias_p_noise);
        let accel_bias_var = sq(dt * params.accel_bias_p_noise);

        for i in 0..3 {
            p[(THETA + i, THETA + i)] += gyro_var;
            p[(VEL + i, VEL + i)] += accel_var;
            p[(GYRO_BIAS + i, GYRO_BIAS + i)] += gyro_bias_var;

            if !self.accel_bias_inhibit[i] {
                p[(ACCEL_BIAS + i, ACCEL_BIAS + i)] += accel_bias_var;
            }
        }

        if self.control_status.contains(ControlStatus::MAG_3D) {
            let mag_var_sum: f32 = (MAG_I..MAG_B + 3).map(|i| p[(i, i)]).sum();

            // Stop growing once the field states are very uncertain
            if mag_var_sum < 0.1 {
                let mag_i_var = sq(dt * params.mage_p_noise);
                let mag_b_var = sq(dt * params.magb_p_noise);
                for i in 0..3 {
                    p[(MAG_I + i, MAG_I + i)] += mag_i_var;
                    p[(MAG_B + i, MAG_B + i)] += mag_b_var;
                }
            }
        }

        if self.control_status.contains(ControlStatus::WIND) {
            let wind_var_sum = p[(WIND, WIND)] + p[(WIND + 1, WIND + 1)];

            if wind_var_sum < sq(params.initial_wind_uncertainty) {
                let wind_var = sq(dt * params.wind_vel_p_noise);
                p[(WIND, WIND)] += wind_var;
                p[(WIND + 1, WIND + 1)] += wind_var;
            }
        }

        self.p = p;
        self.fix_covariance_errors();
    }

    fn clamp_variances(&mut self, start: usize, len: usize, max: f32) {
        for i in start..start + len {
            self.p[(i, i)] = self.p[(i, i)].clamp(MIN_STATE_VAR, max);
        }
    }

    /// Restores symmetry, bounds the variances and removes the correlations of
    /// states that are not being estimated. A non-finite or non-positive
    /// variance reinitialises the whole matrix.
    pub(super) fn fix_covariance_errors(&mut self) {
        self.p.fill_lower_triangle_with_upper_triangle();

        let corrupted = self.p.iter().any(|v| !v.is_finite()) || self.p.diagonal().iter().any(|v| *v <= 0.0);
        if corrupted {
            error!("EKF covariance is not finite or not positive, reinitialising");
            self.initialise_covariance();
            return;
        }

        self.clamp_variances(THETA, 3, 1.0);
        self.clamp_variances(VEL, 3, 1e6);
        self.clamp_variances(POS, 3, 1e6);
        self.clamp_variances(GYRO_BIAS, 3, 1.0);
        self.clamp_variances(MAG_I, 6, 1.0);
        self.clamp_variances(WIND, 2, 1e6);

        self.condition_accel_bias_covariance();

        if !self.control_status.contains(ControlStatus::MAG_3D) {
            decorrelate(&mut self.p, MAG_I, 6);
        }

        if !self.control_status.contains(ControlStatus::WIND) {
            decorrelate(&mut self.p, WIND, 2);
        }
    }

    fn condition_accel_bias_covariance(&mut self) {
        let dt = self.dt_ekf_avg.max(1e-4);
        let min_safe_var = 1e-9 / sq(dt);
        let min_target_var = 5e-8 / sq(dt);
        let max_var = sq(0.1 * GRAVITY_M_S2);

        let mut reset_required = false;
        let mut max_diag = 0.0_f32;

        for axis in 0..3 {
            let i = ACCEL_BIAS + axis;
            if self.accel_bias_inhibit[axis] {
                self.p[(i, i)] = self.p[(i, i)].clamp(MIN_STATE_VAR, max_var);
                decorrelate(&mut self.p, i, 1);
            } else {
                reset_required |= self.p[(i, i)] < min_safe_var;
                max_diag = max_diag.max(self.p[(i, i)]);
            }
        }

        let min_allowed_var = (0.01 * max_diag).max(min_target_var);
        for axis in 0..3 {
            let i = ACCEL_BIAS + axis;
            if !self.accel_bias_inhibit[axis] {
                self.p[(i, i)] = self.p[(i, i)].clamp(min_allowed_var, max_var.max(min_allowed_var));
            }
        }

        if reset_required {
            decorrelate(&mut self.p, ACCEL_BIAS, 3);
        }

        // A vertical bias at its limit that both the height and vertical
        // velocity innovations disagree with points at bad conditioning
        let bias_lim = 0.9 * self.params.acc_bias_lim;
        let down_bias = self.r_to_earth.row(2).transpose().dot(&self.state.accel_bias);
        let vel_aiding = self
            .control_status
            .intersects(ControlStatus::GPS | ControlStatus::EV_VEL);
        let hgt_aiding = self.control_status.intersects(ControlStatus::HEIGHT_SOURCES);

        let bad_acc_bias = down_bias.abs() > bias_lim
            && vel_aiding
            && hgt_aiding
            && down_bias * self.innov.vel_pos[2] > 0.0
            && down_bias * self.innov.vel_pos[5] > 0.0;

        if bad_acc_bias {
            self.fault_status.insert(FaultStatus::BAD_ACC_BIAS);
        } else {
            self.fault_status.remove(FaultStatus::BAD_ACC_BIAS);
            self.time_acc_bias_check = self.time_last_imu;
        }

        if self.time_last_imu.saturating_sub(self.time_acc_bias_check) > BAD_ACC_BIAS_RESET_US {
            decorrelate(&mut self.p, ACCEL_BIAS, 3);
            self.time_acc_bias_check = self.time_last_imu;
            self.fault_status.remove(FaultStatus::BAD_ACC_BIAS);
            warn!("Invalid accel bias, covariance decorrelated");
        }
    }
}
