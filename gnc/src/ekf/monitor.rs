//! Solution health: sensor staleness, dead reckoning and the accuracy and
//! consistency figures reported to consumers of the estimate.

#[cfg(not(feature = "std"))]
use num_traits::Float;

use super::{
    Ekf,
    params::{BARO_MAX_INTERVAL_US, DeclinationSource, EV_MAX_INTERVAL_US, GPS_MAX_INTERVAL_US, RNG_MAX_INTERVAL_US},
    states::{POS, VEL},
    status::{ControlStatus, InnovationFaultStatus, SensorTimeouts, SolutionStatus},
};
use crate::common::math::sq;

/// Largest innovation test ratios of each observation group, as a multiple
/// of the gate size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InnovationTestStatus {
    pub status: InnovationFaultStatus,
    pub mag: f32,
    pub vel: f32,
    pub pos: f32,
    pub hgt: f32,
    pub tas: f32,
    pub hagl: f32,
    pub beta: f32,
}

/// Innovation test ratios of the velocity and position observations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VelPosInnovRatios {
    pub hvel: f32,
    pub vvel: f32,
    pub hpos: f32,
    pub vpos: f32,
}

impl Ekf {
    fn is_stale(&self, newest_us: Option<u64>, max_interval_us: u64) -> bool {
        newest_us.map_or(true, |t| self.time_last_imu.saturating_sub(t) >= 2 * max_interval_us)
    }

    /// Flags sensors whose newest sample is too old to be used.
    pub(super) fn update_sensor_timeouts(&mut self) {
        let gps = self.is_stale(self.buffers.gps.newest_time_us(), GPS_MAX_INTERVAL_US);
        let baro = self.is_stale(self.buffers.baro.newest_time_us(), BARO_MAX_INTERVAL_US);
        let range = self.is_stale(self.buffers.range.newest_time_us(), RNG_MAX_INTERVAL_US);
        let ev = self.is_stale(self.buffers.ext_vision.newest_time_us(), EV_MAX_INTERVAL_US);

        self.sensor_timeouts.set(SensorTimeouts::GPS, gps);
        self.sensor_timeouts.set(SensorTimeouts::BARO, baro);
        self.sensor_timeouts.set(SensorTimeouts::RANGE, range);
        self.sensor_timeouts.set(SensorTimeouts::EXT_VISION, ev);

        self.baro_hgt_faulty = baro;
        self.gps_hgt_faulty = gps;
        self.rng_hgt_faulty = range;
    }

    /// True if a source constraining horizontal position or velocity has been
    /// fused recently.
    pub(crate) fn is_horizontal_aiding_active(&self) -> bool {
        let timeout = self.params.no_aid_timeout_max;
        let recent = |t: u64| self.time_last_imu.saturating_sub(t) <= timeout;

        let vel_pos_aiding = self
            .control_status
            .intersects(ControlStatus::GPS | ControlStatus::EV_POS | ControlStatus::EV_VEL)
            && (recent(self.time_last_pos_fuse) || recent(self.time_last_vel_fuse) || recent(self.time_last_delpos_fuse));
        let flow_aiding = self.control_status.contains(ControlStatus::OPT_FLOW) && recent(self.time_last_of_fuse);

        vel_pos_aiding || flow_aiding
    }

    /// Tracks how long the estimate has been propagated by inertial data
    /// alone, or by inertial and air data only.
    pub(super) fn update_deadreckoning_status(&mut self) {
        let timeout = self.params.no_aid_timeout_max;
        let recent = |t: u64| self.time_last_imu.saturating_sub(t) <= timeout;

        let horizontal_aiding = self.is_horizontal_aiding_active();
        let air_data_aiding = self.control_status.contains(ControlStatus::WIND)
            && recent(self.time_last_arsp_fuse)
            && recent(self.time_last_beta_fuse);

        self.is_wind_dead_reckoning = !horizontal_aiding && air_data_aiding;
        self.is_dead_reckoning = !horizontal_aiding && !air_data_aiding;

        if !self.is_dead_reckoning {
            self.time_ins_deadreckon_start = self.time_last_imu.saturating_sub(timeout);
        }

        self.deadreckon_time_exceeded =
            self.time_last_imu.saturating_sub(self.time_ins_deadreckon_start) > self.params.valid_timeout_max;
    }

    pub fn is_dead_reckoning(&self) -> bool {
        self.is_dead_reckoning
    }

    pub fn is_wind_dead_reckoning(&self) -> bool {
        self.is_wind_dead_reckoning
    }

    /// The global position can be used for navigation.
    pub fn global_position_is_valid(&self) -> bool {
        self.ned_origin_initialised && self.local_position_is_valid()
    }

    /// The local position can be used for navigation.
    pub fn local_position_is_valid(&self) -> bool {
        !self.deadreckon_time_exceeded && !self.using_synthetic_position
    }

    fn horizontal_pos_error(&self) -> f32 {
        let mut err = (self.p[(POS, POS)] + self.p[(POS + 1, POS + 1)]).sqrt();

        // State variances are optimistic while every observation is rejected
        if self.is_dead_reckoning && self.control_status.intersects(ControlStatus::GPS | ControlStatus::EV_POS) {
            err = err.max((sq(self.innov.vel_pos[3]) + sq(self.innov.vel_pos[4])).sqrt());
        }
        err
    }

    /// Horizontal and vertical 1-sigma position accuracy in the local frame (m).
    pub fn get_ekf_lpos_accuracy(&self) -> (f32, f32) {
        (self.horizontal_pos_error(), self.p[(POS + 2, POS + 2)].sqrt())
    }

    /// Horizontal and vertical 1-sigma position accuracy including the
    /// uncertainty of the origin (m).
    pub fn get_ekf_gpos_accuracy(&self) -> (f32, f32) {
        let eph = (sq(self.horizontal_pos_error()) + sq(self.gps_origin_eph)).sqrt();
        let epv = (self.p[(POS + 2, POS + 2)] + sq(self.gps_origin_epv)).sqrt();
        (eph, epv)
    }

    /// Horizontal and vertical 1-sigma velocity accuracy (m/s).
    pub fn get_ekf_vel_accuracy(&self) -> (f32, f32) {
        let mut hvel_err = (self.p[(VEL, VEL)] + self.p[(VEL + 1, VEL + 1)]).sqrt();

        if self.is_dead_reckoning {
            let mut conservative: f32 = 0.0;

            if self.control_status.contains(ControlStatus::OPT_FLOW) {
                let hagl = self.get_hagl().max(self.params.rng_gnd_clearance);
                let flow_innov = (sq(self.innov.flow[0]) + sq(self.innov.flow[1])).sqrt();
                conservative = conservative.max(hagl * flow_innov);
            }

            if self.control_status.intersects(ControlStatus::GPS | ControlStatus::EV_POS) {
                let vel = (sq(self.innov.vel_pos[0]) + sq(self.innov.vel_pos[1])).sqrt();
                let pos = (sq(self.innov.vel_pos[3]) + sq(self.innov.vel_pos[4])).sqrt();
                conservative = conservative.max(vel).max(pos);
            }

            hvel_err = hvel_err.max(conservative);
        }

        (hvel_err, self.p[(VEL + 2, VEL + 2)].sqrt())
    }

    /// GPS velocity and position innovation test ratios.
    pub fn get_gps_vel_pos_innov_ratio(&self) -> VelPosInnovRatios {
        let r = &self.innov.vel_pos_test_ratio;
        VelPosInnovRatios {
            hvel: r[0].max(r[1]).sqrt(),
            vvel: r[2].sqrt(),
            hpos: r[3].max(r[4]).sqrt(),
            vpos: r[5].sqrt(),
        }
    }

    pub fn get_innovation_test_status(&self) -> InnovationTestStatus {
        let i = &self.innov;
        let mag = i.mag_test_ratio.iter().fold(i.yaw_test_ratio, |acc, r| acc.max(*r));

        InnovationTestStatus {
            status: self.innov_check_fail_status,
            mag: mag.sqrt(),
            vel: i.vel_pos_test_ratio[0].max(i.vel_pos_test_ratio[1]).max(i.vel_pos_test_ratio[2]).sqrt(),
            pos: i.vel_pos_test_ratio[3].max(i.vel_pos_test_ratio[4]).sqrt(),
            hgt: i.vel_pos_test_ratio[5].sqrt(),
            tas: i.tas_test_ratio.sqrt(),
            hagl: i.hagl_test_ratio.sqrt(),
            beta: i.beta_test_ratio.sqrt(),
        }
    }

    /// Declination learned from the world magnetic model at the origin, to be
    /// stored for the next start-up (deg).
    pub fn mag_declination_to_save(&self) -> Option<f32> {
        (self.ned_origin_initialised
            && self
                .params
                .mag_declination_source
                .contains(DeclinationSource::SAVE_GEO_DECL))
        .then(|| self.mag_declination_gps.to_degrees())
    }

    pub fn solution_status(&self) -> SolutionStatus {
        let cs = self.control_status;
        let healthy = self.fault_status.is_empty();
        let mut status = SolutionStatus::empty();

        status.set(
            SolutionStatus::ATTITUDE,
            cs.contains(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN) && healthy,
        );

        let air_data_vel = cs.contains(ControlStatus::FUSE_BETA | ControlStatus::FUSE_ASPD);
        let horiz_vel = (cs.intersects(ControlStatus::GPS | ControlStatus::EV_POS | ControlStatus::EV_VEL | ControlStatus::OPT_FLOW)
            || air_data_vel)
            && healthy;
        status.set(SolutionStatus::VELOCITY_HORIZ, horiz_vel);

        let vert = cs.intersects(ControlStatus::HEIGHT_SOURCES) && healthy;
        status.set(SolutionStatus::VELOCITY_VERT, vert);

        let rel_pos = cs.intersects(ControlStatus::GPS | ControlStatus::EV_POS | ControlStatus::OPT_FLOW) && healthy;
        let abs_pos = cs.intersects(ControlStatus::GPS | ControlStatus::EV_POS) && healthy;
        status.set(SolutionStatus::POS_HORIZ_REL, rel_pos);
        status.set(SolutionStatus::POS_HORIZ_ABS, abs_pos);
        status.set(SolutionStatus::POS_VERT_ABS, vert);
        status.set(SolutionStatus::POS_VERT_AGL, self.get_terrain_valid());
        status.set(SolutionStatus::CONST_POS_MODE, !horiz_vel);
        status.set(SolutionStatus::PRED_POS_HORIZ_REL, rel_pos);
        status.set(SolutionStatus::PRED_POS_HORIZ_ABS, abs_pos);

        let r = &self.innov.vel_pos_test_ratio;
        let gps_vel_innov_bad = r[0] > 1.0 || r[1] > 1.0;
        let gps_pos_innov_bad = r[3] > 1.0 || r[4] > 1.0;
        let mag_innov_good = self.innov.mag_test_ratio.iter().all(|r| *r < 1.0) && self.innov.yaw_test_ratio < 1.0;
        status.set(
            SolutionStatus::GPS_GLITCH,
            (gps_vel_innov_bad || gps_pos_innov_bad) && mag_innov_good,
        );
        status.set(SolutionStatus::ACCEL_ERROR, self.bad_vert_accel_detected);

        status
    }
}
