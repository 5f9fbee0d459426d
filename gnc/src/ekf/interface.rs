//! Sample ingestion and public accessors.
//!
//! Observation samples are shifted back in time by their configured delay
//! before they are buffered, so that they can be retrieved at the fusion time
//! horizon.

use core::ops::{AddAssign, Div};

use defmt_or_log::warn;
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use num_traits::Zero;

use super::{
    Ekf, IMU_BUFFER_CAP, OBS_BUFFER_CAP,
    fusion::Innovations,
    params::{FusionMode, VdistSensor},
    states::Covariance,
    status::{ControlStatus, FaultStatus, GpsCheckFailStatus, InnovationFaultStatus, SensorTimeouts, StateResetStatus},
};
use crate::{
    common::{PushError, SampleBuffer, SampleTime},
    datatypes::{
        gnc::{NavigationOutput, StateSample},
        sensors::{
            AirspeedSample, AuxVelSample, BaroSample, DragSample, ExtVisionSample, FlowMessage, FlowSample,
            GpsMessage, GpsSample, ImuSample, MagSample, RangeSample,
        },
    },
};

/// Minimum interval between accepted GPS messages (us)
const GPS_MIN_INTERVAL_US: u64 = 70_000;

#[derive(Debug, Clone, Default)]
pub(super) struct SensorBuffers {
    pub imu: SampleBuffer<ImuSample, IMU_BUFFER_CAP>,
    pub gps: SampleBuffer<GpsSample, OBS_BUFFER_CAP>,
    pub mag: SampleBuffer<MagSample, OBS_BUFFER_CAP>,
    pub baro: SampleBuffer<BaroSample, OBS_BUFFER_CAP>,
    pub range: SampleBuffer<RangeSample, OBS_BUFFER_CAP>,
    pub airspeed: SampleBuffer<AirspeedSample, OBS_BUFFER_CAP>,
    pub flow: SampleBuffer<FlowSample, OBS_BUFFER_CAP>,
    pub ext_vision: SampleBuffer<ExtVisionSample, OBS_BUFFER_CAP>,
    pub drag: SampleBuffer<DragSample, OBS_BUFFER_CAP>,
    pub aux_vel: SampleBuffer<AuxVelSample, OBS_BUFFER_CAP>,
}

/// Arrival time of the last accepted message of each sensor, before any delay
/// compensation (us).
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct SensorArrivals {
    pub gps: u64,
    pub mag: u64,
    pub baro: u64,
    pub range: u64,
    pub airspeed: u64,
    pub flow: u64,
    pub ext_vision: u64,
    pub aux_vel: u64,
}

/// Mean of the samples received between two buffer admissions.
#[derive(Debug, Clone, Copy)]
pub(super) struct SampleAverager<T> {
    sum: T,
    time_sum_us: u64,
    count: u32,
}

impl<T: Zero> Default for SampleAverager<T> {
    fn default() -> Self {
        Self {
            sum: T::zero(),
            time_sum_us: 0,
            count: 0,
        }
    }
}

impl<T> SampleAverager<T>
where
    T: Copy + Zero + AddAssign + Div<f32, Output = T>,
{
    pub fn add(&mut self, time_us: u64, value: T) {
        self.sum += value;
        self.time_sum_us += time_us;
        self.count += 1;
    }

    /// Mean time and value of the accumulated samples. Clears the accumulator.
    pub fn take(&mut self) -> Option<(u64, T)> {
        if self.count == 0 {
            return None;
        }

        let mean = (self.time_sum_us / self.count as u64, self.sum / self.count as f32);
        *self = Self::default();
        Some(mean)
    }
}

/// Accumulates horizontal specific force over several filter periods for
/// drag fusion.
#[derive(Debug, Clone, Copy)]
pub(super) struct DragAccumulator {
    delta_vel_sum: Vector2<f32>,
    time_sum_us: u64,
    dt_sum: f32,
    count: u32,
}

impl Default for DragAccumulator {
    fn default() -> Self {
        Self {
            delta_vel_sum: Vector2::zeros(),
            time_sum_us: 0,
            dt_sum: 0.0,
            count: 0,
        }
    }
}

fn admit<T: SampleTime + Clone, const CAP: usize>(buffer: &mut SampleBuffer<T, CAP>, sample: T, sensor: &str) -> bool {
    match buffer.push(sample) {
        Ok(()) => true,
        Err(PushError::OutOfOrder { time_us, newest_us }) => {
            warn!("{} sample at {} us rejected, newest is {} us", sensor, time_us, newest_us);
            false
        }
        Err(PushError::NotInitialised) => false,
    }
}

impl Ekf {
    /// Sizes every buffer from the largest configured delay.
    pub(super) fn allocate_buffers(&mut self) {
        let period_ms = (self.params.filter_update_period_us / 1000).max(1);
        let max_delay_ms = self.params.max_delay_ms().max(0.0) as u32;
        let interval_ms = self.params.sensor_interval_min_ms.max(1);

        let imu_length = (max_delay_ms / period_ms + 1) as usize;
        let obs_length = imu_length.min((max_delay_ms / interval_ms + 1) as usize);

        let b = &mut self.buffers;
        self.imu_buffer_length = b.imu.allocate(imu_length);
        self.obs_buffer_length = b.gps.allocate(obs_length);
        b.mag.allocate(obs_length);
        b.baro.allocate(obs_length);
        b.range.allocate(obs_length);
        b.airspeed.allocate(obs_length);
        b.flow.allocate(obs_length);
        b.ext_vision.allocate(obs_length);
        b.drag.allocate(obs_length);
        b.aux_vel.allocate(obs_length);

        self.output.allocate(self.imu_buffer_length);
        self.min_obs_interval_us = self.params.sensor_interval_min_ms as u64 * 1000;
    }

    /// Sample time of an observation with the given delay, referenced to the
    /// middle of the filter update period.
    fn observation_time(&self, time_us: u64, delay_ms: f32) -> u64 {
        time_us
            .saturating_sub((delay_ms.max(0.0) * 1000.0) as u64)
            .saturating_sub(self.params.filter_update_period_us as u64 / 2)
    }

    fn obs_interval_elapsed(&self, time_us: u64, last_us: u64) -> bool {
        time_us > last_us && time_us - last_us > self.min_obs_interval_us
    }

    /// Feeds one high rate IMU sample. The first sample initialises the
    /// estimator.
    pub fn set_imu_data(&mut self, imu: &ImuSample) {
        if self.initialised && imu.time_us <= self.time_last_imu {
            warn!("IMU sample at {} us rejected, last was {} us", imu.time_us, self.time_last_imu);
            return;
        }

        if !self.initialised {
            self.init(imu.time_us);
        }

        let dt = imu.delta_ang_dt.clamp(1e-4, 0.02);
        self.dt_imu_avg = 0.8 * self.dt_imu_avg + 0.2 * dt;

        self.newest_high_rate_imu = *imu;
        self.time_last_imu = imu.time_us;
        self.imu_updated = false;

        let Some(sample) = self.imu_down_sampler.update(imu) else {
            return;
        };

        if !admit(&mut self.buffers.imu, sample, "IMU") {
            return;
        }

        self.imu_sample_new = sample;
        if let Some(oldest) = self.buffers.imu.oldest() {
            self.imu_sample_delayed = *oldest;
        }

        // The delayed horizon is only meaningful once the buffer spans the
        // full delay
        self.imu_updated = self.buffers.imu.is_full();

        if self.obs_buffer_length > 1 {
            let span_us = sample.time_us.saturating_sub(self.imu_sample_delayed.time_us);
            let interval_us = span_us / (self.obs_buffer_length as u64 - 1);
            if interval_us > 0 {
                self.min_obs_interval_us = interval_us;
            }
        }

        self.set_drag_data(&sample);
    }

    fn set_drag_data(&mut self, imu: &ImuSample) {
        if !self.params.fusion_mode.contains(FusionMode::USE_DRAG)
            || !self.control_status.contains(ControlStatus::IN_AIR)
        {
            return;
        }

        let acc = &mut self.drag_accumulator;
        acc.count += 1;
        acc.delta_vel_sum += imu.delta_vel.xy();
        acc.time_sum_us += imu.time_us;
        acc.dt_sum += imu.delta_vel_dt;

        let min_sample_ratio = self
            .imu_buffer_length
            .div_ceil(self.obs_buffer_length.max(1))
            .max(5) as u32;

        if acc.count >= min_sample_ratio && acc.dt_sum > 0.0 {
            let sample = DragSample {
                accel_xy: acc.delta_vel_sum / acc.dt_sum,
                time_us: acc.time_sum_us / acc.count as u64,
            };
            *acc = DragAccumulator::default();
            admit(&mut self.buffers.drag, sample, "drag");
        }
    }

    /// Body frame magnetic field (Gauss).
    pub fn set_mag_data(&mut self, time_us: u64, mag: Vector3<f32>) {
        if !self.initialised || time_us <= self.arrivals.mag {
            return;
        }

        self.mag_averager.add(time_us, mag);

        if self.obs_interval_elapsed(time_us, self.arrivals.mag) {
            if let Some((mean_time_us, mean)) = self.mag_averager.take() {
                self.arrivals.mag = time_us;
                let sample = MagSample {
                    mag: mean,
                    time_us: self.observation_time(mean_time_us, self.params.mag_delay_ms),
                };
                admit(&mut self.buffers.mag, sample, "mag");
            }
        }
    }

    /// Barometric altitude above MSL (m).
    pub fn set_baro_data(&mut self, time_us: u64, hgt: f32) {
        if !self.initialised || time_us <= self.arrivals.baro {
            return;
        }

        self.baro_averager.add(time_us, hgt);

        if self.obs_interval_elapsed(time_us, self.arrivals.baro) {
            if let Some((mean_time_us, mean)) = self.baro_averager.take() {
                self.arrivals.baro = time_us;
                let sample = BaroSample {
                    hgt: mean,
                    time_us: self.observation_time(mean_time_us, self.params.baro_delay_ms),
                };
                admit(&mut self.buffers.baro, sample, "baro");
            }
        }
    }

    pub fn set_gps_data(&mut self, gps: &GpsMessage) {
        if !self.initialised {
            return;
        }

        let time_us = gps.time_usec;
        let need_gps = self.params.fusion_mode.contains(FusionMode::USE_GPS)
            || self.params.vdist_sensor_type == VdistSensor::Gps;

        if time_us <= self.arrivals.gps || time_us - self.arrivals.gps <= GPS_MIN_INTERVAL_US || !need_gps {
            return;
        }

        // Solutions without a 3D fix only feed the quality checks
        if gps.fix_type <= 2 {
            self.collect_gps(gps);
            return;
        }

        self.arrivals.gps = time_us;
        self.gps_speed_valid = gps.vel_ned_valid;

        let sample_time_us = self
            .observation_time(time_us, self.params.gps_delay_ms)
            .max(self.imu_sample_delayed.time_us);

        let pos = if self.collect_gps(gps) {
            let (north, east) = self
                .pos_ref
                .project(gps.lat as f64 * 1e-7, gps.lon as f64 * 1e-7);
            Vector2::new(north as f32, east as f32)
        } else {
            Vector2::zeros()
        };

        let sample = GpsSample {
            pos,
            hgt: gps.alt as f32 * 1e-3,
            vel: gps.vel_ned,
            hacc: gps.eph,
            vacc: gps.epv,
            sacc: gps.sacc,
            time_us: sample_time_us,
        };
        admit(&mut self.buffers.gps, sample, "GPS");
    }

    /// Distance measured along the range finder axis (m).
    pub fn set_range_data(&mut self, time_us: u64, rng: f32) {
        if !self.initialised || !self.obs_interval_elapsed(time_us, self.arrivals.range) {
            return;
        }

        self.arrivals.range = time_us;
        let sample = RangeSample {
            rng,
            time_us: self.observation_time(time_us, self.params.range_delay_ms),
        };
        admit(&mut self.buffers.range, sample, "range");
    }

    pub fn set_airspeed_data(&mut self, time_us: u64, true_airspeed: f32, eas2tas: f32) {
        if !self.initialised || !self.obs_interval_elapsed(time_us, self.arrivals.airspeed) {
            return;
        }

        self.arrivals.airspeed = time_us;
        let sample = AirspeedSample {
            true_airspeed,
            eas2tas,
            time_us: self.observation_time(time_us, self.params.airspeed_delay_ms),
        };
        admit(&mut self.buffers.airspeed, sample, "airspeed");
    }

    pub fn set_optical_flow_data(&mut self, flow: &FlowMessage) {
        let time_us = flow.time_us;
        if !self.initialised || !self.obs_interval_elapsed(time_us, self.arrivals.flow) {
            return;
        }

        // Too short an integration time means too much data is being lost
        let delta_time_min = 5e-7 * self.min_obs_interval_us as f32;
        let mut delta_time = 1e-6 * flow.dt_us as f32;
        let delta_time_good = delta_time >= delta_time_min;
        if !delta_time_good {
            delta_time = delta_time_min;
        }

        let flow_magnitude_good = !delta_time_good || flow.flowdata.norm() / delta_time <= self.host.flow_max_rate;
        let relying_on_flow = !self
            .control_status
            .intersects(ControlStatus::GPS | ControlStatus::EV_POS);
        let flow_quality_good = flow.quality >= self.params.flow_qual_min;
        let in_air = self.control_status.contains(ControlStatus::IN_AIR);

        // Always accepted on ground, where a poor quality reading is replaced
        // by zero image motion after body rotation is removed
        if !((delta_time_good && flow_quality_good && (flow_magnitude_good || relying_on_flow)) || !in_air) {
            return;
        }

        // Positive LOS rate is produced by a right handed rotation of the image
        // about the sensor axis, the opposite of the sensor convention
        let gyro_xyz = -flow.gyrodata;
        let flow_rad_xy = if flow_quality_good {
            -flow.flowdata
        } else {
            -flow.gyrodata.xy()
        };

        self.arrivals.flow = time_us;
        let sample = FlowSample {
            quality: flow.quality,
            flow_rad_xy,
            flow_rad_xy_comp: flow_rad_xy - gyro_xyz.xy(),
            gyro_xyz,
            dt: delta_time,
            time_us: time_us
                .saturating_sub((self.params.flow_delay_ms.max(0.0) * 1000.0) as u64)
                .saturating_sub(flow.dt_us as u64 / 2),
        };
        admit(&mut self.buffers.flow, sample, "flow");
    }

    pub fn set_ext_vision_data(&mut self, ev: &ExtVisionSample) {
        let time_us = ev.time_us;
        if !self.initialised || !self.obs_interval_elapsed(time_us, self.arrivals.ext_vision) {
            return;
        }

        self.arrivals.ext_vision = time_us;
        let sample = ExtVisionSample {
            time_us: self.observation_time(time_us, self.params.ev_delay_ms),
            ..*ev
        };
        admit(&mut self.buffers.ext_vision, sample, "vision");
    }

    pub fn set_aux_vel_data(&mut self, time_us: u64, vel_ne: Vector2<f32>, vel_var_ne: Vector2<f32>) {
        if !self.initialised || !self.obs_interval_elapsed(time_us, self.arrivals.aux_vel) {
            return;
        }

        self.arrivals.aux_vel = time_us;
        let sample = AuxVelSample {
            vel_ne,
            vel_var_ne,
            time_us: self.observation_time(time_us, self.params.auxvel_delay_ms),
        };
        admit(&mut self.buffers.aux_vel, sample, "aux vel");
    }

    pub fn set_in_air_status(&mut self, in_air: bool) {
        self.control_status.set(ControlStatus::IN_AIR, in_air);
    }

    pub fn set_fixed_wing(&mut self, is_fixed_wing: bool) {
        self.control_status.set(ControlStatus::FIXED_WING, is_fixed_wing);
    }

    /// Enables synthetic sideslip fusion, for vehicles that fly without
    /// sideslip.
    pub fn set_fuse_beta_flag(&mut self, fuse_beta: bool) {
        self.control_status.set(ControlStatus::FUSE_BETA, fuse_beta);
    }

    /// Requests ground effect protection of the baro height.
    pub fn set_gnd_effect_flag(&mut self, gnd_effect: bool) {
        self.control_status.set(ControlStatus::GND_EFFECT, gnd_effect);
        if gnd_effect {
            self.time_last_gnd_effect_on = self.time_last_imu;
        }
    }

    /// Continuous time GPS checks must pass before GPS is healthy (us).
    pub fn set_min_required_gps_health_time(&mut self, time_us: u64) {
        self.host.min_gps_health_time_us = time_us;
    }

    pub fn set_optical_flow_limits(&mut self, max_flow_rate: f32, min_distance: f32, max_distance: f32) {
        self.host.flow_max_rate = max_flow_rate;
        self.host.flow_min_distance = min_distance;
        self.host.flow_max_distance = max_distance;
    }

    pub fn set_air_density(&mut self, air_density: f32) {
        self.host.air_density = air_density;
    }

    /// Declination at the vehicle location from a world magnetic model (deg).
    /// Used once the global origin is set.
    pub fn set_geo_declination(&mut self, declination_deg: f32) {
        self.host.geo_declination_deg = Some(declination_deg);
    }

    pub fn filter_initialised(&self) -> bool {
        self.filter_initialised
    }

    pub fn attitude_valid(&self) -> bool {
        self.control_status.contains(ControlStatus::TILT_ALIGN)
    }

    /// Attitude at the current time.
    pub fn get_quaternion(&self) -> UnitQuaternion<f32> {
        self.output.output_new.quat_nominal
    }

    /// Velocity of the body origin at the current time (m/s).
    pub fn get_velocity(&self) -> Vector3<f32> {
        self.output.output_new.vel - self.output.vel_imu_rel_body_ned
    }

    /// Vertical velocity integrated with the height so that both stay
    /// kinematically consistent (m/s).
    pub fn get_pos_d_deriv(&self) -> f32 {
        self.output.output_vert_new.vel_d - self.output.vel_imu_rel_body_ned.z
    }

    /// Position of the body origin at the current time (m).
    pub fn get_position(&self) -> Vector3<f32> {
        self.output.output_new.pos - self.output.r_to_earth_now * self.params.imu_pos_body
    }

    /// Bias corrected angular rate of the newest IMU sample (rad/s).
    pub fn get_angular_velocity(&self) -> Vector3<f32> {
        let imu = &self.newest_high_rate_imu;
        if imu.delta_ang_dt > 0.0 {
            imu.delta_ang / imu.delta_ang_dt - self.state.gyro_bias
        } else {
            Vector3::zeros()
        }
    }

    /// Bias corrected specific force of the newest IMU sample (m/s^2).
    pub fn get_specific_force(&self) -> Vector3<f32> {
        let imu = &self.newest_high_rate_imu;
        if imu.delta_vel_dt > 0.0 {
            imu.delta_vel / imu.delta_vel_dt - self.state.accel_bias
        } else {
            Vector3::zeros()
        }
    }

    /// Angle, velocity and position magnitude of the output observer
    /// tracking error.
    pub fn get_output_tracking_error(&self) -> Vector3<f32> {
        self.output.tracking_error
    }

    pub fn navigation_output(&self) -> NavigationOutput {
        NavigationOutput {
            quat_nb: self.get_quaternion(),
            pos_n_m: self.get_position(),
            vel_n_m_s: self.get_velocity(),
            vel_d_integ_m_s: self.get_pos_d_deriv(),
            angvel_unbias_b_rad_s: self.get_angular_velocity(),
            acc_unbias_b_m_s2: self.get_specific_force(),
            control_status: self.control_status.bits(),
            solution_status: self.solution_status().bits(),
        }
    }

    /// State at the fusion time horizon.
    pub fn state(&self) -> &StateSample {
        &self.state
    }

    pub fn covariance(&self) -> &Covariance {
        &self.p
    }

    pub fn time_delayed_us(&self) -> u64 {
        self.imu_sample_delayed.time_us
    }

    pub fn control_status(&self) -> ControlStatus {
        self.control_status
    }

    pub fn fault_status(&self) -> FaultStatus {
        self.fault_status
    }

    pub fn innov_check_fail_status(&self) -> InnovationFaultStatus {
        self.innov_check_fail_status
    }

    pub fn gps_check_fail_status(&self) -> GpsCheckFailStatus {
        self.gps_checks.fail_status()
    }

    pub fn sensor_timeouts(&self) -> SensorTimeouts {
        self.sensor_timeouts
    }

    pub fn innovations(&self) -> &Innovations {
        &self.innov
    }

    pub fn state_reset_status(&self) -> &StateResetStatus {
        &self.state_reset_status
    }
}
