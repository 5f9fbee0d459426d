use defmt_or_log::{info, warn};
use nalgebra::Vector2;

use crate::{
    common::math::sq,
    ekf::{
        Ekf,
        fuse::{HorizontalObservation, VerticalObservation},
        params::FusionMode,
        status::ControlStatus,
    },
};

/// GPS must not have failed its checks for this long before use starts (us)
const GPS_START_HEALTHY_US: u64 = 5_000_000;
/// GPS aiding stops after this long without data (us)
const GPS_DATA_STOPPED_US: u64 = 10_000_000;

impl Ekf {
    fn start_gps_fusion(&mut self) {
        let now = self.time_last_imu;
        let can_start = self.control_status.contains(ControlStatus::TILT_ALIGN)
            && self.ned_origin_initialised
            && now.saturating_sub(self.gps_checks.last_fail_us()) > GPS_START_HEALTHY_US;

        if !can_start {
            return;
        }

        if !self.control_status.contains(ControlStatus::YAW_ALIGN) {
            let mag = self.mag_sample_delayed.mag;
            let yaw_aligned = self.reset_mag_heading(&mag);
            self.control_status.set(ControlStatus::YAW_ALIGN, yaw_aligned);
        }

        if !self.control_status.contains(ControlStatus::YAW_ALIGN) {
            return;
        }

        self.control_status.insert(ControlStatus::GPS);

        // Flow already constrains the velocity
        self.reset_position();
        if !self.control_status.contains(ControlStatus::OPT_FLOW) {
            self.reset_velocity();
        }

        info!("EKF commencing GPS fusion");
    }

    /// With GPS active but nothing fused for too long the states are reset to
    /// the GPS measurement.
    fn check_gps_timeout(&mut self) {
        let now = self.time_last_imu;
        let timeout = self.params.no_gps_timeout_max;
        let stale = |t: u64| now.saturating_sub(t) > timeout;

        let all_stale = stale(self.time_last_pos_fuse)
            && stale(self.time_last_delpos_fuse)
            && stale(self.time_last_vel_fuse)
            && stale(self.time_last_of_fuse);
        let no_pos_fix = now.saturating_sub(self.time_last_pos_fuse) > 2 * timeout;

        if !(all_stale || no_pos_fix) {
            return;
        }

        if self.control_status.contains(ControlStatus::FIXED_WING) {
            // Also resets velocity and position when the yaw was bad
            let yaw_aligned = self.realign_yaw_gps();
            self.control_status.set(ControlStatus::YAW_ALIGN, yaw_aligned);
        }
        self.reset_velocity();
        self.reset_position();
        warn!("EKF GPS fusion timeout, reset to GPS");

        self.time_last_pos_fuse = now;
        self.time_last_vel_fuse = now;
    }

    /// Moves the GPS measurement from the antenna to the IMU.
    fn correct_gps_lever_arm(&mut self) {
        let imu = &self.imu_sample_delayed;
        if imu.delta_ang_dt <= 0.0 {
            return;
        }

        let ang_rate = imu.delta_ang / imu.delta_ang_dt;
        let offset_body = self.params.gps_pos_body - self.params.imu_pos_body;
        let offset_earth = self.r_to_earth * offset_body;

        let gps = &mut self.gps_sample_delayed;
        gps.vel -= self.r_to_earth * ang_rate.cross(&offset_body);
        gps.pos -= offset_earth.xy();
        gps.hgt += offset_earth.z;
    }

    fn request_gps_observations(&mut self) {
        let p = &self.params;
        let gps = &self.gps_sample_delayed;

        let vel_noise = p.gps_vel_noise.max(0.01).max(gps.sacc);
        self.obs.hor_vel = Some(HorizontalObservation {
            meas: gps.vel.xy(),
            obs_var: Vector2::repeat(sq(vel_noise)),
            gate: p.vel_innov_gate.max(1.0),
        });

        // Vertical velocity is typically 1.5 times worse than horizontal
        self.obs.vert_vel = Some(VerticalObservation {
            meas: gps.vel.z,
            obs_var: sq(1.5 * vel_noise),
            gate: p.vel_innov_gate.max(1.0),
        });

        let lower = p.gps_pos_noise.max(0.01);
        let upper = p.pos_noaid_noise.max(lower);
        self.obs.hor_pos = Some(HorizontalObservation {
            meas: gps.pos,
            obs_var: Vector2::repeat(sq(gps.hacc.clamp(lower, upper))),
            gate: p.pos_ne_innov_gate.max(1.0),
        });

        self.fuse_hpos_as_odom = false;
    }

    pub(super) fn control_gps_fusion(&mut self) {
        if !self.gps_data_ready {
            let stopped = self.time_last_imu.saturating_sub(self.arrivals.gps) > GPS_DATA_STOPPED_US;
            if self.control_status.contains(ControlStatus::GPS) && stopped {
                self.control_status.remove(ControlStatus::GPS);
                warn!("EKF GPS data stopped");
            }
            return;
        }

        if !self.params.fusion_mode.contains(FusionMode::USE_GPS) {
            self.control_status.remove(ControlStatus::GPS);
            return;
        }

        if !self.control_status.contains(ControlStatus::GPS) {
            self.start_gps_fusion();
        }

        if self.control_status.contains(ControlStatus::GPS) {
            self.check_gps_timeout();
            self.correct_gps_lever_arm();
            self.request_gps_observations();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::sensors::{GpsMessage, GpsSample},
        ekf::Parameters,
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn aligned_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.control_status
            .insert(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN | ControlStatus::BARO_HGT);
        ekf.ned_origin_initialised = true;
        ekf.time_last_imu = 20_000_000;
        ekf.imu_sample_delayed.delta_ang_dt = 0.01;
        ekf.gps_sample_delayed = GpsSample {
            pos: Vector2::new(3.0, -2.0),
            hgt: 100.0,
            vel: Vector3::new(1.0, 0.5, 0.0),
            hacc: 1.0,
            vacc: 1.5,
            sacc: 0.3,
            time_us: 19_800_000,
        };
        ekf.gps_data_ready = true;

        // One passing solution long enough ago for GPS use to start
        let msg = GpsMessage {
            time_usec: 1_000_000,
            lat: 473_977_000,
            lon: 85_456_000,
            alt: 488_000,
            fix_type: 3,
            eph: 0.5,
            epv: 0.8,
            sacc: 0.2,
            vel_m_s: 0.0,
            vel_ned: Vector3::zeros(),
            vel_ned_valid: true,
            nsats: 16,
            gdop: 0.9,
        };
        ekf.gps_checks.check(&msg, &ekf.params, 1_000_000, false, 0.0, 0);
        assert!(!ekf.gps_checks.is_failing());
        ekf
    }

    #[test]
    fn test_gps_start_resets_position_and_velocity() {
        let mut ekf = aligned_ekf();

        ekf.control_gps_fusion();

        assert!(ekf.control_status.contains(ControlStatus::GPS));
        assert_abs_diff_eq!(ekf.state.pos.x, 3.0);
        assert_abs_diff_eq!(ekf.state.vel.y, 0.5);
        assert!(ekf.obs.hor_pos.is_some());
        assert!(ekf.obs.vert_vel.is_some());
    }

    #[test]
    fn test_gps_needs_origin() {
        let mut ekf = aligned_ekf();
        ekf.ned_origin_initialised = false;

        ekf.control_gps_fusion();

        assert!(!ekf.control_status.contains(ControlStatus::GPS));
        assert!(!ekf.obs.any());
    }

    #[test]
    fn test_gps_observation_noise() {
        let mut ekf = aligned_ekf();
        ekf.control_gps_fusion();

        let pos = ekf.obs.hor_pos.unwrap();
        assert_abs_diff_eq!(pos.obs_var.x, 1.0);

        let vel = ekf.obs.hor_vel.unwrap();
        assert_abs_diff_eq!(vel.obs_var.x, sq(0.5));
        assert_abs_diff_eq!(ekf.obs.vert_vel.unwrap().obs_var, sq(0.75));
    }

    #[test]
    fn test_gps_stops_without_data() {
        let mut ekf = aligned_ekf();
        ekf.control_status.insert(ControlStatus::GPS);
        ekf.gps_data_ready = false;
        ekf.arrivals.gps = 5_000_000;

        ekf.control_gps_fusion();

        assert!(!ekf.control_status.contains(ControlStatus::GPS));
    }
}
