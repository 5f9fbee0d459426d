//! Output observer.
//!
//! Integrates every IMU sample forward from the current estimate and pulls the
//! predicted history towards the delayed filter state with a complementary
//! filter, so the published solution has no lag and no steps.

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};

use super::{Ekf, IMU_BUFFER_CAP};
use crate::{
    common::{SampleBuffer, math::GRAVITY_M_S2, math::sq},
    datatypes::gnc::{OutputSample, OutputVert},
};

#[derive(Debug, Clone)]
pub(super) struct OutputPredictor {
    buffer: SampleBuffer<OutputSample, IMU_BUFFER_CAP>,
    vert_buffer: SampleBuffer<OutputVert, IMU_BUFFER_CAP>,
    pub output_new: OutputSample,
    pub output_vert_new: OutputVert,
    pub r_to_earth_now: Matrix3<f32>,
    /// Velocity of the IMU relative to the body origin, in earth frame
    pub vel_imu_rel_body_ned: Vector3<f32>,
    pub tracking_error: Vector3<f32>,
    delta_angle_corr: Vector3<f32>,
    vel_err_integ: Vector3<f32>,
    pos_err_integ: Vector3<f32>,
}

impl Default for OutputPredictor {
    fn default() -> Self {
        Self {
            buffer: SampleBuffer::new(),
            vert_buffer: SampleBuffer::new(),
            output_new: OutputSample::default(),
            output_vert_new: OutputVert::default(),
            r_to_earth_now: Matrix3::identity(),
            vel_imu_rel_body_ned: Vector3::zeros(),
            tracking_error: Vector3::zeros(),
            delta_angle_corr: Vector3::zeros(),
            vel_err_integ: Vector3::zeros(),
            pos_err_integ: Vector3::zeros(),
        }
    }
}

impl OutputPredictor {
    pub fn allocate(&mut self, depth: usize) {
        self.buffer.allocate(depth);
        self.vert_buffer.allocate(depth);
    }

    pub fn is_finite(&self) -> bool {
        self.output_new.quat_nominal.coords.iter().all(|v| v.is_finite())
            && self.output_new.vel.iter().all(|v| v.is_finite())
            && self.output_new.pos.iter().all(|v| v.is_finite())
    }

    /// Shifts the whole horizontal velocity history after a state reset.
    pub fn apply_vel_ne_delta(&mut self, delta: &Vector2<f32>) {
        for s in self.buffer.iter_mut() {
            s.vel.x += delta.x;
            s.vel.y += delta.y;
        }
        self.output_new.vel.x += delta.x;
        self.output_new.vel.y += delta.y;
    }

    pub fn apply_vel_d_delta(&mut self, delta: f32) {
        for s in self.buffer.iter_mut() {
            s.vel.z += delta;
        }
        for s in self.vert_buffer.iter_mut() {
            s.vel_d += delta;
        }
        self.output_new.vel.z += delta;
        self.output_vert_new.vel_d += delta;
    }

    pub fn apply_pos_ne_delta(&mut self, delta: &Vector2<f32>) {
        for s in self.buffer.iter_mut() {
            s.pos.x += delta.x;
            s.pos.y += delta.y;
        }
        self.output_new.pos.x += delta.x;
        self.output_new.pos.y += delta.y;
    }

    pub fn apply_pos_d_delta(&mut self, delta: f32) {
        for s in self.buffer.iter_mut() {
            s.pos.z += delta;
        }
        for s in self.vert_buffer.iter_mut() {
            s.vel_d_integ += delta;
        }
        self.output_new.pos.z += delta;
        self.output_vert_new.vel_d_integ += delta;
    }

    /// Rotates every stored attitude by an earth frame attitude change.
    pub fn apply_quat_change(&mut self, change: &UnitQuaternion<f32>) {
        for s in self.buffer.iter_mut() {
            s.quat_nominal = UnitQuaternion::new_normalize((change * s.quat_nominal).into_inner());
        }
        self.output_new.quat_nominal =
            UnitQuaternion::new_normalize((change * self.output_new.quat_nominal).into_inner());
        self.r_to_earth_now = self.output_new.quat_nominal.to_rotation_matrix().into_inner();
    }

    /// Re-integrates the vertical position history after its velocities were
    /// corrected.
    fn correct_vertical(&mut self, vel_d_correction: f32) {
        let mut prev: Option<OutputVert> = None;

        for s in self.vert_buffer.iter_mut() {
            s.vel_d += vel_d_correction;
            if let Some(p) = prev {
                s.vel_d_integ = p.vel_d_integ + 0.5 * (p.vel_d + s.vel_d) * s.dt;
            }
            prev = Some(*s);
        }

        if let Some(newest) = self.vert_buffer.newest() {
            self.output_vert_new = *newest;
        }
    }

    fn correct_horizontal(&mut self, vel_correction: &Vector3<f32>, pos_correction: &Vector3<f32>) {
        for s in self.buffer.iter_mut() {
            s.vel += vel_correction;
            s.pos += pos_correction;
        }

        if let Some(newest) = self.buffer.newest() {
            self.output_new = *newest;
        }
    }
}

impl Ekf {
    /// Predicts the output states forward with the newest IMU sample and, when
    /// a filter update completed, corrects the history towards the delayed
    /// state.
    pub(super) fn calculate_output_states(&mut self) {
        let imu = self.newest_high_rate_imu;
        if imu.delta_ang_dt <= 0.0 || imu.delta_vel_dt <= 0.0 {
            return;
        }

        let o = &mut self.output;

        let delta_angle = imu.delta_ang - self.state.gyro_bias * imu.delta_ang_dt + o.delta_angle_corr;

        // Yaw rate about the earth vertical, used by the magnetometer logic
        let spin_del_ang_d = o.r_to_earth_now.row(2).transpose().dot(&delta_angle);
        self.yaw_delta_ef += spin_del_ang_d;
        self.yaw_rate_lpf_ef = 0.95 * self.yaw_rate_lpf_ef + 0.05 * spin_del_ang_d / imu.delta_ang_dt;

        let dq = UnitQuaternion::from_scaled_axis(delta_angle);
        o.output_new.quat_nominal = UnitQuaternion::new_normalize((o.output_new.quat_nominal * dq).into_inner());
        o.r_to_earth_now = o.output_new.quat_nominal.to_rotation_matrix().into_inner();

        let delta_vel_body = imu.delta_vel - self.state.accel_bias * imu.delta_vel_dt;
        let mut delta_vel_earth = o.r_to_earth_now * delta_vel_body;
        delta_vel_earth.z += GRAVITY_M_S2 * imu.delta_vel_dt;

        let vel_last = o.output_new.vel;
        o.output_new.vel += delta_vel_earth;
        let delta_pos = (o.output_new.vel + vel_last) * (0.5 * imu.delta_vel_dt);
        o.output_new.pos += delta_pos;
        o.output_new.time_us = imu.time_us;

        o.output_vert_new.vel_d += delta_vel_earth.z;
        o.output_vert_new.vel_d_integ += delta_pos.z;
        o.output_vert_new.dt += imu.delta_vel_dt;
        o.output_vert_new.time_us = imu.time_us;

        if self.params.imu_pos_body.norm() > 0.0 {
            let ang_rate = imu.delta_ang / imu.delta_ang_dt;
            o.vel_imu_rel_body_ned = o.r_to_earth_now * ang_rate.cross(&self.params.imu_pos_body);
        }

        if !self.imu_updated {
            return;
        }

        if o.buffer.push(o.output_new).is_err() || o.vert_buffer.push(o.output_vert_new).is_err() {
            return;
        }
        o.output_vert_new.dt = 0.0;

        // Until the history spans the delay its oldest entry is not at the
        // fusion time horizon
        if !o.buffer.is_full() {
            return;
        }

        let (Some(delayed), Some(vert_delayed)) = (o.buffer.oldest().copied(), o.vert_buffer.oldest().copied())
        else {
            return;
        };

        // Attitude correction as a rate offset spread over the delay
        let q_error = self.state.quat_nominal.inverse() * delayed.quat_nominal;
        let scalar = if q_error.w >= 0.0 { -2.0 } else { 2.0 };
        let delta_ang_error = q_error.imag() * scalar;

        let time_delay = (imu.time_us.saturating_sub(self.imu_sample_delayed.time_us) as f32 * 1e-6).max(self.dt_imu_avg);
        let att_gain = 0.5 * self.dt_imu_avg / time_delay;
        o.delta_angle_corr = delta_ang_error * att_gain;
        o.tracking_error.x = delta_ang_error.norm();

        let vel_gain = self.dt_ekf_avg / self.params.vel_tau.clamp(self.dt_ekf_avg, 10.0);
        let pos_gain = self.dt_ekf_avg / self.params.pos_tau.clamp(self.dt_ekf_avg, 10.0);

        let vert_vel_err = self.state.vel.z - vert_delayed.vel_d;
        let vert_pos_err = self.state.pos.z - vert_delayed.vel_d_integ;
        o.correct_vertical(vert_pos_err * pos_gain + vert_vel_err * vel_gain * 1.1);
        o.output_vert_new.dt = 0.0;

        let vel_err = self.state.vel - delayed.vel;
        let pos_err = self.state.pos - delayed.pos;
        o.tracking_error.y = vel_err.norm();
        o.tracking_error.z = pos_err.norm();

        o.vel_err_integ += vel_err;
        o.pos_err_integ += pos_err;
        let vel_correction = vel_err * vel_gain + o.vel_err_integ * sq(vel_gain) * 0.1;
        let pos_correction = pos_err * pos_gain + o.pos_err_integ * sq(pos_gain) * 0.1;

        o.correct_horizontal(&vel_correction, &pos_correction);
        o.r_to_earth_now = o.output_new.quat_nominal.to_rotation_matrix().into_inner();
    }

    /// Removes any difference between the output history and the delayed
    /// state, so the observer restarts from the current estimate.
    pub(super) fn align_output_filter(&mut self) {
        let o = &mut self.output;

        let Some(delayed) = o.buffer.oldest().copied() else {
            o.output_new.quat_nominal = self.state.quat_nominal;
            o.output_new.vel = self.state.vel;
            o.output_new.pos = self.state.pos;
            o.output_vert_new.vel_d = self.state.vel.z;
            o.output_vert_new.vel_d_integ = self.state.pos.z;
            o.r_to_earth_now = self.r_to_earth;
            return;
        };

        let q_delta = self.state.quat_nominal * delayed.quat_nominal.inverse();
        let vel_delta = self.state.vel - delayed.vel;
        let pos_delta = self.state.pos - delayed.pos;

        for s in o.buffer.iter_mut() {
            s.quat_nominal = UnitQuaternion::new_normalize((q_delta * s.quat_nominal).into_inner());
            s.vel += vel_delta;
            s.pos += pos_delta;
        }

        if let Some(vert_delayed) = o.vert_buffer.oldest().copied() {
            let vel_d_delta = self.state.vel.z - vert_delayed.vel_d;
            let pos_d_delta = self.state.pos.z - vert_delayed.vel_d_integ;
            for s in o.vert_buffer.iter_mut() {
                s.vel_d += vel_d_delta;
                s.vel_d_integ += pos_d_delta;
            }
            if let Some(newest) = o.vert_buffer.newest() {
                o.output_vert_new = *newest;
            }
        }

        if let Some(newest) = o.buffer.newest() {
            o.output_new = *newest;
        }
        o.r_to_earth_now = o.output_new.quat_nominal.to_rotation_matrix().into_inner();
        o.vel_err_integ = Vector3::zeros();
        o.pos_err_integ = Vector3::zeros();
    }
}
