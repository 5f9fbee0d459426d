//! Static alignment. Sensor data is averaged until enough samples of every
//! required sensor have passed through the buffers, then the states and
//! covariance are initialised from the averages.

use defmt_or_log::{debug, info};
use nalgebra::Vector3;

use super::{
    Ekf,
    params::{FusionMode, VdistSensor},
    states::{THETA, reset_block},
    status::ControlStatus,
};
use crate::{
    common::math::{prefer_321_yaw, tilt_from_specific_force, with_yaw},
    datatypes::gnc::StateSample,
};

/// Sums and low pass filtered readings collected before alignment.
#[derive(Debug, Clone, Copy)]
pub(super) struct InitAccumulators {
    del_vel_sum: Vector3<f32>,
    last_imu_time_us: u64,
    mag_counter: usize,
    mag_filt: Vector3<f32>,
    hgt_counter: usize,
    rng_filt: f32,
    ev_counter: usize,
}

impl Default for InitAccumulators {
    fn default() -> Self {
        Self {
            del_vel_sum: Vector3::zeros(),
            last_imu_time_us: 0,
            mag_counter: 0,
            mag_filt: Vector3::zeros(),
            hgt_counter: 0,
            rng_filt: 0.0,
            ev_counter: 0,
        }
    }
}

/// Counts a sample and low pass filters it once the samples that may have been
/// buffered before the sensor settled are flushed.
fn accumulate<T>(counter: &mut usize, filt: &mut T, value: T, flush_count: usize)
where
    T: Copy + core::ops::Mul<f32, Output = T> + core::ops::Add<Output = T>,
{
    *counter += 1;
    if *counter == flush_count {
        *filt = value;
    } else if *counter > flush_count {
        *filt = *filt * 0.9 + value * 0.1;
    }
}

impl Ekf {
    pub(super) fn set_height_source_flag(&mut self, flag: ControlStatus) {
        self.control_status.remove(ControlStatus::HEIGHT_SOURCES);
        self.control_status.insert(flag);
    }

    /// Collects alignment data. Returns true once the filter has been
    /// initialised.
    pub(super) fn initialise_filter(&mut self) -> bool {
        let delayed_t = self.imu_sample_delayed.time_us;
        let flush_count = self.obs_buffer_length + 1;
        let required = 2 * self.obs_buffer_length;

        if let Some(imu) = self.buffers.imu.newest().copied() {
            if imu.time_us != self.init_acc.last_imu_time_us {
                self.init_acc.del_vel_sum += imu.delta_vel;
                self.init_acc.last_imu_time_us = imu.time_us;
            }
        }

        if let Some(mag) = self.buffers.mag.pop_first_older_than(delayed_t) {
            self.mag_sample_delayed = mag;
            let acc = &mut self.init_acc;
            accumulate(&mut acc.mag_counter, &mut acc.mag_filt, mag.mag, flush_count);
        }

        if let Some(ev) = self.buffers.ext_vision.pop_first_older_than(delayed_t) {
            self.ev_sample_delayed = ev;
            self.init_acc.ev_counter += 1;

            if self.init_acc.ev_counter == 1 && self.primary_hgt_source == VdistSensor::ExtVision {
                self.set_height_source_flag(ControlStatus::EV_HGT);
            }
        }

        match self.primary_hgt_source {
            VdistSensor::Range => {
                if let Some(rng) = self.buffers.range.pop_first_older_than(delayed_t) {
                    self.range_sample_delayed = rng;
                    if self.init_acc.hgt_counter == 0 {
                        self.set_height_source_flag(ControlStatus::RNG_HGT);
                    }
                    let acc = &mut self.init_acc;
                    accumulate(&mut acc.hgt_counter, &mut acc.rng_filt, rng.rng, flush_count);
                }
            }
            // GPS height starts on baro and switches once GPS passes its checks
            VdistSensor::Baro | VdistSensor::Gps => {
                if let Some(baro) = self.buffers.baro.pop_first_older_than(delayed_t) {
                    self.baro_sample_delayed = baro;
                    if self.init_acc.hgt_counter == 0 {
                        self.set_height_source_flag(ControlStatus::BARO_HGT);
                    }
                    accumulate(
                        &mut self.init_acc.hgt_counter,
                        &mut self.baro_hgt_offset,
                        baro.hgt,
                        flush_count,
                    );
                }
            }
            VdistSensor::ExtVision => self.init_acc.hgt_counter = self.init_acc.ev_counter,
        }

        let ev_required = self
            .params
            .fusion_mode
            .intersects(FusionMode::USE_EVPOS | FusionMode::USE_EVYAW);

        if self.init_acc.hgt_counter <= required
            || self.init_acc.mag_counter <= required
            || (ev_required && self.init_acc.ev_counter <= required)
        {
            return false;
        }

        if self.init_acc.del_vel_sum.norm() <= 0.001 {
            return false;
        }

        self.initialise_states();
        true
    }

    fn initialise_states(&mut self) {
        self.state = StateSample {
            quat_nominal: tilt_from_specific_force(&self.init_acc.del_vel_sum),
            ..StateSample::default()
        };
        self.r_to_earth = self.state.quat_nominal.to_rotation_matrix().into_inner();
        self.gps_alt_ref = 0.0;

        // Initial heading from the averaged field, without touching the output
        // history or the reset status
        let mag_init = self.init_acc.mag_filt;
        let yaw_obs = self.yaw_observation(&mag_init);
        if let Some((yaw, _)) = yaw_obs {
            let use_321 = prefer_321_yaw(&self.r_to_earth);
            self.state.quat_nominal = with_yaw(&self.state.quat_nominal, yaw, use_321);
            self.r_to_earth = self.state.quat_nominal.to_rotation_matrix().into_inner();
            self.state.mag_i = self.r_to_earth * mag_init;
            self.flt_mag_align_start_time = Some(self.imu_sample_delayed.time_us);
        }
        self.control_status.set(ControlStatus::YAW_ALIGN, yaw_obs.is_some());

        self.initialise_covariance();
        self.save_mag_covariance();
        if let Some((_, yaw_var)) = yaw_obs {
            reset_block(&mut self.p, THETA + 2, 1, yaw_var);
        }

        if self.control_status.contains(ControlStatus::RNG_HGT) {
            // Baro is kept as a backup reference
            if let Some(baro) = self.buffers.baro.last_pushed() {
                self.baro_hgt_offset = baro.hgt;
            }
            self.state.pos.z = -(self.init_acc.rng_filt * self.r_rng_to_earth_2_2).max(self.params.rng_gnd_clearance);
            info!("EKF using range finder height, commencing alignment");
        } else if self.control_status.contains(ControlStatus::EV_HGT) {
            // The vision origin is not the height datum
            self.reset_height();
            info!("EKF using vision height, commencing alignment");
        } else {
            info!("EKF using pressure height, commencing alignment");
        }

        self.run_terrain_estimator();

        self.time_last_hgt_fuse = self.time_last_imu;
        self.time_last_pos_fuse = self.time_last_imu;
        self.time_last_vel_fuse = self.time_last_imu;
        self.time_last_of_fuse = self.time_last_imu;

        self.align_output_filter();
        debug!("EKF initial tilt from {} IMU samples", self.imu_buffer_length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::math::GRAVITY_M_S2,
        datatypes::sensors::ImuSample,
        ekf::Parameters,
    };
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_accumulate_flushes_then_filters() {
        let mut counter = 0;
        let mut filt = 0.0_f32;

        for _ in 0..3 {
            accumulate(&mut counter, &mut filt, 100.0, 4);
        }
        assert_abs_diff_eq!(filt, 0.0);

        accumulate(&mut counter, &mut filt, 10.0, 4);
        assert_abs_diff_eq!(filt, 10.0);

        accumulate(&mut counter, &mut filt, 20.0, 4);
        assert_abs_diff_eq!(filt, 11.0);
    }

    #[test]
    fn test_static_alignment() {
        let mut ekf = Ekf::new(Parameters::default());
        let roll = 0.1_f32;
        // At rest the accelerometer measures minus gravity in body axes
        let specific_force = Vector3::new(0.0, -GRAVITY_M_S2 * roll.sin(), -GRAVITY_M_S2 * roll.cos());
        let dt = 0.001;

        let mut initialised = false;
        for i in 1..=3000u64 {
            let t = i * 1000;
            ekf.set_imu_data(&ImuSample {
                delta_ang: Vector3::zeros(),
                delta_vel: specific_force * dt,
                delta_ang_dt: dt,
                delta_vel_dt: dt,
                time_us: t,
            });
            if i % 20 == 0 {
                ekf.set_mag_data(t, Vector3::new(0.2, 0.0, 0.4));
                ekf.set_baro_data(t, 350.0);
            }
            ekf.update();
            initialised |= ekf.filter_initialised();
        }

        assert!(initialised);
        assert!(ekf.control_status.contains(ControlStatus::BARO_HGT));
        assert!(ekf.control_status.contains(ControlStatus::YAW_ALIGN));
        assert_abs_diff_eq!(ekf.baro_hgt_offset, 350.0, epsilon = 1e-3);

        let (r, _, _) = ekf.state.quat_nominal.euler_angles();
        assert_abs_diff_eq!(r, roll, epsilon = 1e-3);
    }
}
