//! Discrete state resets. Every reset records its change in the reset status
//! and applies it to the output observer history, so the published solution
//! moves by the same amount.

use defmt_or_log::{info, warn};
use nalgebra::{UnitQuaternion, Vector2, Vector3};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use super::{
    Ekf,
    covariance::MIN_STATE_VAR,
    params::{BARO_MAX_INTERVAL_US, FusionMode, GPS_MAX_INTERVAL_US, MagFuseType},
    states::{MAG_B, MAG_I, POS, THETA, VEL, WIND, decorrelate, reset_block},
    status::ControlStatus,
};
use crate::common::math::{prefer_321_yaw, sq, with_yaw, wrap_pi, yaw_312, yaw_321};

/// Airspeed samples older than this are not used to seed the wind (us)
const WIND_RESET_AIRSPEED_AGE_US: u64 = 500_000;

impl Ekf {
    fn is_recent(&self, time_us: u64, max_interval_us: u64) -> bool {
        self.time_last_imu.saturating_sub(time_us) < 2 * max_interval_us
    }

    /// Resets the velocity to the best available aiding source, or to zero.
    pub(super) fn reset_velocity(&mut self) {
        let vel_before = self.state.vel;

        if self.control_status.contains(ControlStatus::GPS) && !self.gps_checks.is_failing() {
            info!("EKF reset velocity to GPS");
            self.state.vel = self.gps_sample_delayed.vel;
            reset_block(&mut self.p, VEL, 3, sq(self.gps_sample_delayed.sacc));
        } else if self.control_status.contains(ControlStatus::OPT_FLOW) {
            info!("EKF reset velocity to flow");
            let (vel_ne, range) = self.optical_flow_velocity();
            self.state.vel.x = vel_ne.x;
            self.state.vel.y = vel_ne.y;
            let var = sq(range) * self.optflow_meas_var();
            reset_block(&mut self.p, VEL, 2, var);
        } else if self.control_status.contains(ControlStatus::EV_VEL) {
            info!("EKF reset velocity to vision");
            self.state.vel = self.ev_to_ekf_frame(&self.ev_sample_delayed.vel_ned);
            reset_block(&mut self.p, VEL, 3, sq(self.ev_sample_delayed.vel_err.max(0.01)));
        } else if self.control_status.contains(ControlStatus::EV_POS) {
            self.state.vel = Vector3::zeros();
            decorrelate(&mut self.p, VEL, 3);
        } else {
            info!("EKF reset velocity to zero");
            self.state.vel.x = 0.0;
            self.state.vel.y = 0.0;
            reset_block(&mut self.p, VEL, 2, 25.0);
        }

        let change = self.state.vel - vel_before;
        self.output.apply_vel_ne_delta(&change.xy());
        self.output.apply_vel_d_delta(change.z);

        let status = &mut self.state_reset_status;
        status.vel_ne_change = change.xy();
        status.vel_d_change = change.z;
        status.vel_ne_counter = status.vel_ne_counter.wrapping_add(1);
        status.vel_d_counter = status.vel_d_counter.wrapping_add(1);
    }

    /// Resets the horizontal position to the best available aiding source,
    /// or to the last known position.
    pub(super) fn reset_position(&mut self) {
        let pos_before = self.state.pos.xy();

        if self.control_status.contains(ControlStatus::GPS) {
            info!("EKF reset position to GPS");
            self.state.pos.x = self.gps_sample_delayed.pos.x;
            self.state.pos.y = self.gps_sample_delayed.pos.y;
            reset_block(&mut self.p, POS, 2, sq(self.gps_sample_delayed.hacc));
        } else if self.control_status.contains(ControlStatus::EV_POS) {
            info!("EKF reset position to vision");
            let pos = self.ev_to_ekf_frame(&self.ev_sample_delayed.pos_ned);
            self.state.pos.x = pos.x;
            self.state.pos.y = pos.y;
            reset_block(&mut self.p, POS, 2, sq(self.ev_sample_delayed.pos_err.max(0.01)));
        } else if self.control_status.contains(ControlStatus::OPT_FLOW) {
            // Flow navigation is relative to where it started
            let start = if self.control_status.contains(ControlStatus::IN_AIR) {
                self.last_known_pos_ne
            } else {
                Vector2::zeros()
            };
            self.state.pos.x = start.x;
            self.state.pos.y = start.y;
            reset_block(&mut self.p, POS, 2, MIN_STATE_VAR);
        } else {
            self.state.pos.x = self.last_known_pos_ne.x;
            self.state.pos.y = self.last_known_pos_ne.y;
            reset_block(&mut self.p, POS, 2, sq(self.params.pos_noaid_noise));
        }

        let change = self.state.pos.xy() - pos_before;
        self.output.apply_pos_ne_delta(&change);

        let status = &mut self.state_reset_status;
        status.pos_ne_change = change;
        status.pos_ne_counter = status.pos_ne_counter.wrapping_add(1);

        self.hpos_prev_available = false;
        self.time_last_pos_fuse = self.time_last_imu;
    }

    /// Moves the horizontal position without touching its variance.
    pub(super) fn reset_horizontal_position_to(&mut self, new_pos: &Vector2<f32>) {
        let change = new_pos - self.state.pos.xy();
        self.state.pos.x = new_pos.x;
        self.state.pos.y = new_pos.y;
        self.output.apply_pos_ne_delta(&change);

        let status = &mut self.state_reset_status;
        status.pos_ne_change = change;
        status.pos_ne_counter = status.pos_ne_counter.wrapping_add(1);

        self.last_known_pos_ne += change;
        self.hpos_prev_available = false;
    }

    /// Moves the vertical position without touching its variance.
    pub(super) fn reset_vertical_position_to(&mut self, new_pos_d: f32) {
        let change = new_pos_d - self.state.pos.z;
        self.state.pos.z = new_pos_d;
        self.output.apply_pos_d_delta(change);

        let status = &mut self.state_reset_status;
        status.pos_d_change = change;
        status.pos_d_counter = status.pos_d_counter.wrapping_add(1);

        self.last_on_ground_pos_d += change;
    }

    /// Keeps height measurements consistent with a vertical position that was
    /// shifted by `delta_d` without a change in physical height.
    pub(super) fn shift_height_references(&mut self, delta_d: f32) {
        self.baro_hgt_offset += delta_d;

        if self.control_status.contains(ControlStatus::RNG_HGT) {
            self.hgt_sensor_offset += delta_d;
        }

        self.terrain.shift(delta_d);
    }

    /// Resets height and vertical velocity to the active height source.
    pub(super) fn reset_height(&mut self) {
        let old_pos_d = self.state.pos.z;
        let old_vel_d = self.state.vel.z;
        let mut pos_reset = false;

        let baro_newest = self.buffers.baro.last_pushed().copied();
        let gps_newest = self.buffers.gps.last_pushed().copied();

        if self.control_status.contains(ControlStatus::RNG_HGT) {
            self.state.pos.z = self.hgt_sensor_offset - self.range_sample_delayed.rng * self.r_rng_to_earth_2_2;
            reset_block(&mut self.p, POS + 2, 1, sq(self.params.range_noise));
            pos_reset = true;

            if let Some(baro) = baro_newest {
                self.baro_hgt_offset = baro.hgt + self.state.pos.z;
            }
        } else if self.control_status.contains(ControlStatus::BARO_HGT) {
            match baro_newest {
                Some(baro) if self.is_recent(baro.time_us, BARO_MAX_INTERVAL_US) => {
                    self.state.pos.z = self.hgt_sensor_offset - baro.hgt + self.baro_hgt_offset;
                    reset_block(&mut self.p, POS + 2, 1, sq(self.params.baro_noise));
                    pos_reset = true;
                }
                _ => warn!("EKF height reset skipped, no recent baro"),
            }
        } else if self.control_status.contains(ControlStatus::GPS_HGT) {
            match gps_newest {
                Some(gps) if self.is_recent(gps.time_us, GPS_MAX_INTERVAL_US) => {
                    self.state.pos.z = self.hgt_sensor_offset - gps.hgt + self.gps_alt_ref;
                    reset_block(&mut self.p, POS + 2, 1, sq(gps.vacc.max(0.01)));
                    pos_reset = true;

                    if let Some(baro) = baro_newest {
                        self.baro_hgt_offset = baro.hgt + self.state.pos.z;
                    }
                }
                _ => warn!("EKF height reset skipped, no recent GPS"),
            }
        } else if self.control_status.contains(ControlStatus::EV_HGT) {
            // Use whichever vision sample is closer to the fusion time horizon
            let delayed_t = self.imu_sample_delayed.time_us as i64;
            let ev = match self.buffers.ext_vision.last_pushed() {
                Some(newest)
                    if (newest.time_us as i64 - delayed_t).abs()
                        < (self.ev_sample_delayed.time_us as i64 - delayed_t).abs() =>
                {
                    *newest
                }
                _ => self.ev_sample_delayed,
            };
            self.state.pos.z = ev.pos_ned.z;
            reset_block(&mut self.p, POS + 2, 1, sq(ev.pos_err.max(0.01)));
            pos_reset = true;
        }

        match gps_newest {
            Some(gps)
                if self.control_status.contains(ControlStatus::GPS)
                    && self.is_recent(gps.time_us, GPS_MAX_INTERVAL_US) =>
            {
                self.state.vel.z = gps.vel.z;
                reset_block(&mut self.p, VEL + 2, 1, sq(1.5 * gps.sacc));
            }
            _ => {
                // Large enough to converge quickly without destabilising
                self.state.vel.z = 0.0;
                reset_block(&mut self.p, VEL + 2, 1, 10.0);
            }
        }

        let status = &mut self.state_reset_status;
        if pos_reset {
            status.pos_d_change = self.state.pos.z - old_pos_d;
            status.pos_d_counter = status.pos_d_counter.wrapping_add(1);
            self.output.apply_pos_d_delta(status.pos_d_change);
        }
        status.vel_d_change = self.state.vel.z - old_vel_d;
        status.vel_d_counter = status.vel_d_counter.wrapping_add(1);
        self.output.apply_vel_d_delta(status.vel_d_change);
    }

    /// Records an attitude reset and, if requested, rotates the output
    /// observer history by the same change.
    fn record_quat_reset(&mut self, quat_before: &UnitQuaternion<f32>, update_buffer: bool) {
        self.r_to_earth = self.state.quat_nominal.to_rotation_matrix().into_inner();
        let change = self.state.quat_nominal * quat_before.inverse();

        if update_buffer {
            self.output.apply_quat_change(&change);
        }

        let status = &mut self.state_reset_status;
        status.quat_change = change;
        status.quat_counter = status.quat_counter.wrapping_add(1);
    }

    /// Replaces the yaw of the attitude, keeping the tilt. A positive
    /// `yaw_variance` replaces the yaw error variance.
    pub(super) fn reset_quat_state_yaw(&mut self, yaw: f32, yaw_variance: f32, update_buffer: bool) {
        let quat_before = self.state.quat_nominal;
        let use_321 = prefer_321_yaw(&self.r_to_earth);
        self.state.quat_nominal = with_yaw(&quat_before, yaw, use_321);

        if yaw_variance > f32::EPSILON {
            reset_block(&mut self.p, THETA + 2, 1, yaw_variance);
        } else {
            decorrelate(&mut self.p, THETA + 2, 1);
        }

        self.record_quat_reset(&quat_before, update_buffer);

        if self.params.fusion_mode.contains(FusionMode::ROTATE_EV | FusionMode::USE_EVPOS)
            && !self.control_status.contains(ControlStatus::EV_YAW)
        {
            self.reset_ext_vision_rotation();
        }
    }

    /// Yaw angle and its variance observed by the vision attitude or, with
    /// the current tilt, by the magnetometer reading `mag`.
    pub(super) fn yaw_observation(&self, mag: &Vector3<f32>) -> Option<(f32, f32)> {
        if self.control_status.contains(ControlStatus::EV_YAW) {
            let r = self.ev_sample_delayed.quat.to_rotation_matrix().into_inner();
            let yaw = if prefer_321_yaw(&self.r_to_earth) { yaw_321(&r) } else { yaw_312(&r) };
            Some((yaw, sq(self.ev_sample_delayed.ang_err).max(sq(1.0e-2))))
        } else if self.params.mag_fusion_type != MagFuseType::None {
            let use_321 = prefer_321_yaw(&self.r_to_earth);
            let zero_yaw = with_yaw(&self.state.quat_nominal, 0.0, use_321);
            let mag_earth = zero_yaw * mag;
            let yaw = -mag_earth.y.atan2(mag_earth.x) + self.mag_declination();
            Some((wrap_pi(yaw), sq(self.params.mag_heading_noise.max(1.0e-2))))
        } else {
            None
        }
    }

    /// Aligns yaw with the vision attitude or the magnetometer heading and
    /// resets the earth field states. Returns false when neither is usable.
    pub(super) fn reset_mag_heading(&mut self, mag_init: &Vector3<f32>) -> bool {
        // Only once per fusion time step
        if self.flt_mag_align_start_time == Some(self.imu_sample_delayed.time_us) {
            return true;
        }

        let Some((yaw, yaw_variance)) = self.yaw_observation(mag_init) else {
            return false;
        };

        self.reset_quat_state_yaw(yaw, yaw_variance, true);

        self.state.mag_i = self.r_to_earth * mag_init;
        self.reset_mag_covariance();

        self.flt_mag_align_start_time = Some(self.imu_sample_delayed.time_us);
        true
    }

    /// Checks the heading against the GPS course once moving fast enough and
    /// corrects it if the two disagree or yaw was never aligned.
    pub(super) fn realign_yaw_gps(&mut self) -> bool {
        let gps = self.gps_sample_delayed;
        let gps_speed = gps.vel.xy().norm();

        if gps_speed <= 5.0 || gps.sacc >= 0.15 * gps_speed {
            let mag = self.mag_sample_delayed.mag;
            return self.reset_mag_heading(&mag);
        }

        let bad_vel_innov = self.innov.vel_pos_test_ratio[0] > 1.0 && self.control_status.contains(ControlStatus::GPS);
        let gps_cog = gps.vel.y.atan2(gps.vel.x);
        let ekf_cog = self.state.vel.y.atan2(self.state.vel.x);
        let course_yaw_error = wrap_pi(gps_cog - ekf_cog);
        let bad_mag_yaw = course_yaw_error.abs() > 0.5 && bad_vel_innov;

        if bad_mag_yaw {
            self.num_bad_flight_yaw_events = self.num_bad_flight_yaw_events.saturating_add(1);
        }

        if bad_mag_yaw || !self.control_status.contains(ControlStatus::YAW_ALIGN) {
            warn!("EKF bad yaw corrected using GPS course");

            if self.flt_mag_align_complete
                && self.num_bad_flight_yaw_events >= 2
                && !self.control_status.contains(ControlStatus::MAG_FAULT)
            {
                warn!("EKF stopping magnetometer use");
                self.control_status.insert(ControlStatus::MAG_FAULT);
            }

            let quat_before = self.state.quat_nominal;
            let (roll, pitch, yaw) = quat_before.euler_angles();

            let new_yaw = if !self.flt_mag_align_complete {
                // First in-flight alignment, the course change since launch
                // is down to yaw error
                self.flt_mag_align_complete = true;
                yaw + course_yaw_error
            } else if self.control_status.contains(ControlStatus::WIND) {
                (gps.vel.y - self.state.wind_vel.y).atan2(gps.vel.x - self.state.wind_vel.x)
            } else {
                gps_cog
            };

            self.state.quat_nominal = UnitQuaternion::from_euler_angles(roll, pitch, new_yaw);
            self.r_to_earth = self.state.quat_nominal.to_rotation_matrix().into_inner();

            self.state.mag_b = Vector3::zeros();
            self.state.mag_i = self.r_to_earth * self.mag_sample_delayed.mag;

            let spd_error_var = sq(gps.sacc) + self.p[(VEL, VEL)] + self.p[(VEL + 1, VEL + 1)];
            let sine_yaw_error = (spd_error_var.sqrt() / gps_speed).clamp(0.0, 1.0);
            reset_block(&mut self.p, THETA + 2, 1, sq(sine_yaw_error.asin()));

            self.reset_mag_states_covariance_after_align();
            self.record_quat_reset(&quat_before, true);

            // The velocity and position were integrated with a bad heading
            self.reset_velocity();
            self.reset_position();
        } else {
            self.state.mag_i = self.r_to_earth * self.mag_sample_delayed.mag;
            self.reset_mag_states_covariance_after_align();
        }

        self.flt_mag_align_start_time = Some(self.imu_sample_delayed.time_us);
        true
    }

    fn reset_mag_states_covariance_after_align(&mut self) {
        if self.control_status.contains(ControlStatus::MAG_3D) {
            self.reset_mag_covariance();
        } else {
            decorrelate(&mut self.p, MAG_I, 6);
        }
    }

    /// Sets the field state variances to the measurement variance and stores
    /// them for reuse after a heading-only period.
    pub(super) fn reset_mag_covariance(&mut self) {
        reset_block(&mut self.p, MAG_I, 6, sq(self.params.mag_noise));
        self.save_mag_covariance();
    }

    pub(super) fn save_mag_covariance(&mut self) {
        for (i, var) in self.saved_mag_variance.iter_mut().enumerate() {
            *var = self.p[(MAG_I + i, MAG_I + i)];
        }
    }

    pub(super) fn restore_mag_covariance(&mut self) {
        let fallback = sq(self.params.mag_noise);
        for i in 0..6 {
            let saved = self.saved_mag_variance[i];
            let var = if saved > 0.0 { saved } else { fallback };
            reset_block(&mut self.p, MAG_I + i, 1, var);
        }
        decorrelate(&mut self.p, MAG_B, 3);
    }

    fn recent_airspeed(&self) -> Option<f32> {
        let age_us = self
            .imu_sample_delayed
            .time_us
            .saturating_sub(self.airspeed_sample_delayed.time_us);
        (self.tas_data_ready && age_us < WIND_RESET_AIRSPEED_AGE_US).then_some(self.airspeed_sample_delayed.true_airspeed)
    }

    /// Seeds the wind from airspeed with a zero sideslip assumption, or zero.
    pub(super) fn reset_wind_states(&mut self) {
        let yaw = yaw_321(&self.r_to_earth);

        self.state.wind_vel = match self.recent_airspeed() {
            Some(tas) => Vector2::new(self.state.vel.x - tas * yaw.cos(), self.state.vel.y - tas * yaw.sin()),
            None => Vector2::zeros(),
        };
    }

    pub(super) fn reset_wind_covariance(&mut self) {
        match self.recent_airspeed() {
            Some(tas) => {
                let eas2tas = self.airspeed_sample_delayed.eas2tas.clamp(0.9, 10.0);
                let tas_var = sq(self.params.eas_noise * eas2tas);
                let heading_var = sq(tas) * self.p[(THETA + 2, THETA + 2)];
                let var_n = self.p[(VEL, VEL)] + tas_var + heading_var;
                let var_e = self.p[(VEL + 1, VEL + 1)] + tas_var + heading_var;
                reset_block(&mut self.p, WIND, 1, var_n);
                reset_block(&mut self.p, WIND + 1, 1, var_e);
            }
            None => reset_block(&mut self.p, WIND, 2, sq(self.params.initial_wind_uncertainty)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::sensors::{AirspeedSample, BaroSample},
        ekf::Parameters,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(1_000_000);
        ekf.initialise_covariance();
        ekf.align_output_filter();
        ekf
    }

    #[test]
    fn test_reset_velocity_to_zero_without_aiding() {
        let mut ekf = ekf();
        ekf.state.vel = Vector3::new(3.0, -2.0, 0.5);

        ekf.reset_velocity();

        assert_eq!(ekf.state.vel, Vector3::new(0.0, 0.0, 0.5));
        assert_abs_diff_eq!(ekf.p[(VEL, VEL)], 25.0);
        assert_eq!(ekf.state_reset_status.vel_ne_change, Vector2::new(-3.0, 2.0));
        assert_eq!(ekf.state_reset_status.vel_ne_counter, 1);
        assert_abs_diff_eq!(ekf.output.output_new.vel.x, -3.0);
    }

    #[test]
    fn test_reset_velocity_to_flow() {
        let mut ekf = ekf();
        ekf.control_status.insert(ControlStatus::OPT_FLOW);
        ekf.flow_sample_delayed.quality = 255;
        ekf.state.vel = Vector3::new(1.0, 1.0, 0.2);

        let (vel_ne, range) = ekf.optical_flow_velocity();
        let var = sq(range) * ekf.optflow_meas_var();
        ekf.reset_velocity();

        assert_eq!(ekf.state.vel.xy(), vel_ne);
        assert_abs_diff_eq!(ekf.p[(VEL, VEL)], var);
        assert_abs_diff_eq!(ekf.p[(VEL + 1, VEL + 1)], var);
        assert_abs_diff_eq!(ekf.p[(VEL, VEL + 1)], 0.0);
    }

    #[test]
    fn test_wind_covariance_from_airspeed() {
        let mut ekf = ekf();
        ekf.tas_data_ready = true;
        ekf.airspeed_sample_delayed = AirspeedSample {
            true_airspeed: 12.0,
            eas2tas: 1.0,
            time_us: ekf.imu_sample_delayed.time_us,
        };

        let tas_var = sq(ekf.params.eas_noise);
        let heading_var = sq(12.0) * ekf.p[(THETA + 2, THETA + 2)];
        let var_n = ekf.p[(VEL, VEL)] + tas_var + heading_var;
        let var_e = ekf.p[(VEL + 1, VEL + 1)] + tas_var + heading_var;

        ekf.reset_wind_covariance();

        assert_abs_diff_eq!(ekf.p[(WIND, WIND)], var_n, epsilon = 1e-4);
        assert_abs_diff_eq!(ekf.p[(WIND + 1, WIND + 1)], var_e, epsilon = 1e-4);
        assert_abs_diff_eq!(ekf.p[(WIND, VEL)], 0.0);
    }

    #[test]
    fn test_reset_position_to_last_known() {
        let mut ekf = ekf();
        ekf.last_known_pos_ne = Vector2::new(10.0, 5.0);

        ekf.reset_position();

        assert_eq!(ekf.state.pos.xy(), Vector2::new(10.0, 5.0));
        assert_abs_diff_eq!(ekf.p[(POS, POS)], sq(ekf.params.pos_noaid_noise));
        assert_eq!(ekf.state_reset_status.pos_ne_change, Vector2::new(10.0, 5.0));
        assert_abs_diff_eq!(ekf.output.output_new.pos.y, 5.0);
    }

    #[test]
    fn test_reset_height_to_baro() {
        let mut ekf = ekf();
        ekf.control_status.insert(ControlStatus::BARO_HGT);
        ekf.baro_hgt_offset = 100.0;
        ekf.buffers
            .baro
            .push(BaroSample { hgt: 102.0, time_us: 900_000 })
            .unwrap();

        ekf.reset_height();

        assert_abs_diff_eq!(ekf.state.pos.z, -2.0);
        assert_abs_diff_eq!(ekf.p[(POS + 2, POS + 2)], sq(ekf.params.baro_noise));
        assert_abs_diff_eq!(ekf.state_reset_status.pos_d_change, -2.0);
        assert_abs_diff_eq!(ekf.output.output_vert_new.vel_d_integ, -2.0);
        assert_abs_diff_eq!(ekf.p[(VEL + 2, VEL + 2)], 10.0);
    }

    #[test]
    fn test_mag_heading_reset() {
        let mut ekf = ekf();
        // Field pointing north east with declination zero
        let heading = 0.6_f32;
        let mag_b = Vector3::new(0.2 * heading.cos(), -0.2 * heading.sin(), 0.4);

        assert!(ekf.reset_mag_heading(&mag_b));

        let (_, _, yaw) = ekf.state.quat_nominal.euler_angles();
        assert_abs_diff_eq!(yaw, heading, epsilon = 1e-5);
        assert_abs_diff_eq!(ekf.state.mag_i.y, 0.0, epsilon = 1e-5);
        assert_eq!(ekf.state_reset_status.quat_counter, 1);
        assert_abs_diff_eq!(ekf.output.output_new.quat_nominal.angle_to(&ekf.state.quat_nominal), 0.0, epsilon = 1e-5);

        // Second reset on the same step is a no-op
        ekf.reset_mag_heading(&Vector3::new(0.2, 0.0, 0.4));
        assert_eq!(ekf.state_reset_status.quat_counter, 1);
    }

    #[test]
    fn test_origin_shift_moves_height_references() {
        let mut ekf = ekf();
        ekf.baro_hgt_offset = 10.0;
        ekf.reset_vertical_position_to(-4.0);
        ekf.shift_height_references(-4.0);

        assert_abs_diff_eq!(ekf.baro_hgt_offset, 6.0);
        assert_abs_diff_eq!(ekf.state_reset_status.pos_d_change, -4.0);
        assert_abs_diff_eq!(ekf.output.output_new.pos.z, -4.0);
    }
}
