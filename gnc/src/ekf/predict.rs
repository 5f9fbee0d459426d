//! Strapdown integration of the delayed IMU interval.

use nalgebra::{UnitQuaternion, Vector3};

use super::Ekf;
use crate::common::{geo::earth_rate_ned, math::GRAVITY_M_S2};

/// Gyro bias magnitude limit (rad/s)
const GYRO_BIAS_LIM: f32 = 0.349;

fn clamp_vec(v: &Vector3<f32>, lim: f32) -> Vector3<f32> {
    v.map(|x| x.clamp(-lim, lim))
}

impl Ekf {
    pub(super) fn predict_state(&mut self) {
        if !self.earth_rate_initialised && self.ned_origin_initialised {
            self.earth_rate_ned = earth_rate_ned(self.pos_ref.lat_rad());
            self.earth_rate_initialised = true;
        }

        let imu = self.imu_sample_delayed;

        let mut delta_ang = imu.delta_ang - self.state.gyro_bias * imu.delta_ang_dt;
        delta_ang -= self.r_to_earth.transpose() * self.earth_rate_ned * imu.delta_ang_dt;
        let delta_vel = imu.delta_vel - self.state.accel_bias * imu.delta_vel_dt;

        let dq = UnitQuaternion::from_scaled_axis(delta_ang);
        self.state.quat_nominal = UnitQuaternion::new_normalize((self.state.quat_nominal * dq).into_inner());
        self.r_to_earth = self.state.quat_nominal.to_rotation_matrix().into_inner();

        let delta_vel_ef = self.r_to_earth * delta_vel;

        // Horizontal acceleration with a 1 s time constant for manoeuvre
        // detection
        let alpha = 1.0 - imu.delta_vel_dt;
        self.accel_lpf_ne = self.accel_lpf_ne * alpha + delta_vel_ef.xy();

        let vel_last = self.state.vel;
        self.state.vel += delta_vel_ef;
        self.state.vel.z += GRAVITY_M_S2 * imu.delta_vel_dt;
        self.state.pos += (vel_last + self.state.vel) * (0.5 * imu.delta_vel_dt);

        self.constrain_states();

        let period = self.filter_period_s();
        let dt = (0.5 * (imu.delta_vel_dt + imu.delta_ang_dt)).clamp(0.5 * period, 2.0 * period);
        self.dt_ekf_avg = 0.99 * self.dt_ekf_avg + 0.01 * dt;
    }

    fn constrain_states(&mut self) {
        let s = &mut self.state;
        s.vel = clamp_vec(&s.vel, 1000.0);
        s.pos = clamp_vec(&s.pos, 1.0e6);
        s.gyro_bias = clamp_vec(&s.gyro_bias, GYRO_BIAS_LIM);
        s.accel_bias = clamp_vec(&s.accel_bias, self.params.acc_bias_lim);
        s.mag_i = clamp_vec(&s.mag_i, 1.0);
        s.mag_b = clamp_vec(&s.mag_b, 0.5);
        s.wind_vel = s.wind_vel.map(|x| x.clamp(-100.0, 100.0));
    }
}
