//! Aiding source state machine. Each cycle decides which sources may correct
//! the filter, starts and stops them, and hands their samples at the fusion
//! time horizon to the measurement models.

mod air;
mod gps;
mod height;
mod mag;
mod optflow;
mod vel_pos;
mod vision;

use defmt_or_log::{error, info};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use super::{Ekf, states::THETA, status::ControlStatus};

/// Tilt is aligned once the roll and pitch error variance is below (3 deg)^2
const TILT_ALIGN_VAR: f32 = 0.05235 * 0.05235;
/// Flow is only used while the sensor looks down within 45 deg of vertical
const FLOW_MIN_COS_TILT: f32 = 0.7071;
/// A range finder reporting within this band for too long is stuck (m)
const RNG_STUCK_MIN_VARIATION: f32 = 1.0;
/// In-flight range data is checked for a stuck sensor after this long (us)
const RNG_STUCK_CHECK_US: u64 = 10_000_000;

impl Ekf {
    /// Declination in use (rad).
    pub(super) fn mag_declination(&self) -> f32 {
        self.mag_declination
    }

    /// Once the field has been aligned in flight the earth field states hold
    /// the best declination, before that the configured reference is used.
    fn calc_mag_declination(&mut self) {
        self.mag_declination = if self.flt_mag_align_complete {
            self.state.mag_i.y.atan2(self.state.mag_i.x)
        } else {
            self.declination_reference()
        };
    }

    fn check_tilt_alignment(&mut self) {
        if self.control_status.contains(ControlStatus::TILT_ALIGN) {
            return;
        }

        let tilt_var = self.p[(THETA, THETA)] + self.p[(THETA + 1, THETA + 1)];
        if tilt_var >= TILT_ALIGN_VAR {
            return;
        }

        self.control_status.insert(ControlStatus::TILT_ALIGN);
        let mag = self.mag_sample_delayed.mag;
        let yaw_aligned = self.reset_mag_heading(&mag);
        self.control_status.set(ControlStatus::YAW_ALIGN, yaw_aligned);

        let cs = self.control_status;
        if cs.contains(ControlStatus::BARO_HGT) {
            info!("EKF aligned, baro height, IMU buf {} OBS buf {}", self.imu_buffer_length, self.obs_buffer_length);
        } else if cs.contains(ControlStatus::EV_HGT) {
            info!("EKF aligned, vision height, IMU buf {} OBS buf {}", self.imu_buffer_length, self.obs_buffer_length);
        } else if cs.contains(ControlStatus::GPS_HGT) {
            info!("EKF aligned, GPS height, IMU buf {} OBS buf {}", self.imu_buffer_length, self.obs_buffer_length);
        } else if cs.contains(ControlStatus::RNG_HGT) {
            info!("EKF aligned, range height, IMU buf {} OBS buf {}", self.imu_buffer_length, self.obs_buffer_length);
        } else {
            error!("EKF aligned, unknown height, IMU buf {} OBS buf {}", self.imu_buffer_length, self.obs_buffer_length);
        }
    }

    /// Retrieves the samples that have fallen behind the fusion time horizon.
    fn pop_delayed_samples(&mut self) {
        let t = self.imu_sample_delayed.time_us;

        self.gps_data_ready = match self.buffers.gps.pop_first_older_than(t) {
            Some(gps) => {
                self.gps_sample_delayed = gps;
                true
            }
            None => false,
        };

        self.mag_data_ready = match self.buffers.mag.pop_first_older_than(t) {
            Some(mag) => {
                self.mag_sample_delayed = mag;
                true
            }
            None => false,
        };

        let baro_prev_us = self.baro_sample_delayed.time_us;
        self.baro_data_ready = match self.buffers.baro.pop_first_older_than(t) {
            Some(baro) => {
                self.baro_sample_delayed = baro;
                self.delta_time_baro_us = baro.time_us.saturating_sub(baro_prev_us);
                true
            }
            None => false,
        };

        let r = &self.r_to_earth;
        self.r_rng_to_earth_2_2 = r[(2, 0)] * self.sin_tilt_rng + r[(2, 2)] * self.cos_tilt_rng;
        self.range_data_ready = match self.buffers.range.pop_first_older_than(t) {
            Some(rng) => {
                self.range_sample_delayed = rng;
                self.r_rng_to_earth_2_2 > self.params.range_cos_max_tilt
            }
            None => false,
        };
        self.check_for_stuck_range();

        self.flow_data_ready = match self.buffers.flow.pop_first_older_than(t) {
            Some(flow) => {
                self.flow_sample_delayed = flow;
                self.r_to_earth[(2, 2)] > FLOW_MIN_COS_TILT && self.flow_within_range_limits()
            }
            None => false,
        };

        self.ev_data_ready = match self.buffers.ext_vision.pop_first_older_than(t) {
            Some(ev) => {
                self.ev_sample_delayed = ev;
                true
            }
            None => false,
        };

        self.tas_data_ready = match self.buffers.airspeed.pop_first_older_than(t) {
            Some(tas) => {
                self.airspeed_sample_delayed = tas;
                true
            }
            None => false,
        };
    }

    /// The flow sensor only works within its focus range while flying.
    fn flow_within_range_limits(&self) -> bool {
        if !self.control_status.contains(ControlStatus::IN_AIR) {
            return true;
        }

        let hagl = self.get_hagl();
        hagl >= self.host.flow_min_distance && hagl <= self.host.flow_max_distance
    }

    /// A range finder that reports an almost constant distance in flight for
    /// a long time is assumed stuck until its readings vary again.
    fn check_for_stuck_range(&mut self) {
        if !self.range_data_ready {
            return;
        }

        let rng = self.range_sample_delayed;
        let in_air = self.control_status.contains(ControlStatus::IN_AIR);

        if !in_air || rng.time_us.saturating_sub(self.time_last_rng_ready) <= RNG_STUCK_CHECK_US {
            self.time_last_rng_ready = rng.time_us;
            return;
        }

        self.control_status.insert(ControlStatus::RNG_STUCK);

        if self.rng_check_max_val - self.rng_check_min_val > RNG_STUCK_MIN_VARIATION {
            self.time_last_rng_ready = rng.time_us;
            self.rng_check_min_val = 0.0;
            self.rng_check_max_val = 0.0;
            self.control_status.remove(ControlStatus::RNG_STUCK);
        } else {
            self.rng_check_max_val = self.rng_check_max_val.max(rng.rng);
            if self.rng_check_min_val < 0.1 || rng.rng < self.rng_check_min_val {
                self.rng_check_min_val = rng.rng;
            }
            self.range_data_ready = false;
        }
    }

    /// Runs the aiding state machine and the fusion of every source with data
    /// at the fusion time horizon.
    pub(super) fn control_fusion_modes(&mut self) {
        self.control_status_prev = self.control_status;

        self.calc_mag_declination();
        self.check_tilt_alignment();

        self.update_sensor_timeouts();
        self.pop_delayed_samples();

        self.control_height_sensor_timeouts();

        self.control_mag_fusion();
        self.control_optical_flow_fusion();
        self.control_gps_fusion();
        self.control_air_data_fusion();
        self.control_beta_fusion();
        self.control_drag_fusion();
        self.control_height_fusion();

        self.control_fake_pos_fusion();
        if self.obs.any() {
            self.fuse_vel_pos_height();
        }

        self.control_external_vision_fusion();
        self.control_aux_vel_fusion();

        self.update_deadreckoning_status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::sensors::{MagSample, RangeSample},
        ekf::Parameters,
    };
    use nalgebra::Vector3;

    fn ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf
    }

    #[test]
    fn test_tilt_alignment_resets_yaw() {
        let mut ekf = ekf();
        ekf.mag_sample_delayed = MagSample {
            mag: Vector3::new(0.2, 0.0, 0.4),
            time_us: 0,
        };

        ekf.check_tilt_alignment();
        assert!(!ekf.control_status.contains(ControlStatus::TILT_ALIGN));

        ekf.p[(THETA, THETA)] = 1e-4;
        ekf.p[(THETA + 1, THETA + 1)] = 1e-4;
        ekf.check_tilt_alignment();

        assert!(ekf.control_status.contains(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN));
    }

    #[test]
    fn test_stuck_range_detected() {
        let mut ekf = ekf();
        ekf.control_status.insert(ControlStatus::IN_AIR);
        ekf.time_last_rng_ready = 0;

        for i in 0..5 {
            ekf.range_sample_delayed = RangeSample {
                rng: 3.0,
                time_us: 11_000_000 + i * 100_000,
            };
            ekf.range_data_ready = true;
            ekf.check_for_stuck_range();
            assert!(!ekf.range_data_ready);
        }
        assert!(ekf.control_status.contains(ControlStatus::RNG_STUCK));

        ekf.range_sample_delayed.rng = 5.0;
        ekf.range_data_ready = true;
        ekf.check_for_stuck_range();
        ekf.range_data_ready = true;
        ekf.check_for_stuck_range();

        assert!(!ekf.control_status.contains(ControlStatus::RNG_STUCK));
        assert!(ekf.range_data_ready);
    }

    #[test]
    fn test_declination_follows_field_after_alignment() {
        let mut ekf = ekf();
        ekf.calc_mag_declination();
        assert_eq!(ekf.mag_declination(), ekf.declination_reference());

        ekf.flt_mag_align_complete = true;
        ekf.state.mag_i = Vector3::new(0.2, 0.2, 0.4);
        ekf.calc_mag_declination();
        assert!((ekf.mag_declination() - core::f32::consts::FRAC_PI_4).abs() < 1e-6);
    }
}
