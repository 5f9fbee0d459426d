use defmt_or_log::{info, warn};
use nalgebra::Vector2;

use crate::{
    common::math::sq,
    ekf::{
        Ekf,
        params::FusionMode,
        states::{POS, VEL, reset_block},
        status::ControlStatus,
    },
};

/// Flow aiding stops after this long without usable data (us)
const FLOW_DATA_STOPPED_US: u64 = 5_000_000;

impl Ekf {
    /// Without GPS the flow velocity and the last known position become the
    /// starting point of relative navigation.
    fn reset_to_flow(&mut self) {
        let (vel_ne, range) = self.optical_flow_velocity();
        let vel_var = sq(range) * self.optflow_meas_var();

        let vel_before = self.state.vel.xy();
        self.state.vel.x = vel_ne.x;
        self.state.vel.y = vel_ne.y;
        reset_block(&mut self.p, VEL, 2, vel_var);

        let pos = if self.control_status.contains(ControlStatus::IN_AIR) {
            self.last_known_pos_ne
        } else {
            Vector2::zeros()
        };
        let pos_before = self.state.pos.xy();
        self.state.pos.x = pos.x;
        self.state.pos.y = pos.y;
        reset_block(&mut self.p, POS, 2, sq(self.params.gps_pos_noise.max(0.01)));

        let status = &mut self.state_reset_status;
        status.vel_ne_change = self.state.vel.xy() - vel_before;
        status.vel_ne_counter = status.vel_ne_counter.wrapping_add(1);
        status.pos_ne_change = self.state.pos.xy() - pos_before;
        status.pos_ne_counter = status.pos_ne_counter.wrapping_add(1);

        self.align_output_filter();
    }

    fn start_flow_fusion(&mut self) {
        let can_start = self.control_status.contains(ControlStatus::TILT_ALIGN) && self.get_terrain_valid();
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

        self.control_status.insert(ControlStatus::OPT_FLOW);
        self.time_last_of_fuse = self.time_last_imu;

        if !self.control_status.contains(ControlStatus::GPS) {
            self.reset_to_flow();
        }
        info!("EKF commencing optical flow fusion");
    }

    pub(super) fn control_optical_flow_fusion(&mut self) {
        // Gyro rate accumulated over the flow integration interval
        let imu = self.imu_sample_delayed;
        self.imu_del_ang_of += imu.delta_ang - self.state.gyro_bias * imu.delta_ang_dt;
        self.delta_time_of += imu.delta_ang_dt;

        if !self.params.fusion_mode.contains(FusionMode::USE_OF) {
            self.control_status.remove(ControlStatus::OPT_FLOW);
            return;
        }

        if !self.flow_data_ready {
            let stopped = self.time_last_imu.saturating_sub(self.arrivals.flow) > FLOW_DATA_STOPPED_US;
            if stopped && self.control_status.contains(ControlStatus::OPT_FLOW) {
                self.control_status.remove(ControlStatus::OPT_FLOW);
                warn!("EKF optical flow data stopped");
            }
            return;
        }

        if !self.control_status.contains(ControlStatus::OPT_FLOW) {
            self.start_flow_fusion();
        }

        if self.control_status.contains(ControlStatus::OPT_FLOW) && self.get_terrain_valid() {
            self.calc_opt_flow_bias();
            self.fuse_opt_flow();
            self.last_known_pos_ne = self.state.pos.xy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::sensors::FlowSample, ekf::Parameters};
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn flow_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters {
            fusion_mode: FusionMode::USE_OF,
            ..Default::default()
        });
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.control_status
            .insert(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN | ControlStatus::IN_AIR);
        ekf.state.pos.z = -5.0;
        ekf.time_last_imu = 2_000_000;
        ekf.terrain.set(0.0, 0.1);
        ekf.terrain.update_continuity(1.0, 0);
        ekf.terrain.update_validity(false, ekf.time_last_imu);
        ekf.imu_sample_delayed.delta_ang_dt = 0.01;
        ekf.imu_sample_delayed.delta_vel_dt = 0.01;
        ekf.flow_sample_delayed = FlowSample {
            quality: 255,
            dt: 0.1,
            ..Default::default()
        };
        ekf.flow_data_ready = true;
        ekf
    }

    #[test]
    fn test_flow_start_without_gps_resets_to_flow() {
        let mut ekf = flow_ekf();
        ekf.last_known_pos_ne = Vector2::new(4.0, -1.0);
        // Scene moving as if flying east at 0.5 m/s
        ekf.flow_sample_delayed.flow_rad_xy_comp = Vector2::new(0.5 / 5.0, 0.0) * 0.1;

        ekf.control_optical_flow_fusion();

        assert!(ekf.control_status.contains(ControlStatus::OPT_FLOW));
        assert_abs_diff_eq!(ekf.state.vel.y, 0.5, epsilon = 0.05);
        assert_abs_diff_eq!(ekf.state.pos.x, 4.0, epsilon = 0.1);
    }

    #[test]
    fn test_flow_needs_valid_terrain() {
        let mut ekf = flow_ekf();
        ekf.terrain = Default::default();

        ekf.control_optical_flow_fusion();

        assert!(!ekf.control_status.contains(ControlStatus::OPT_FLOW));
    }

    #[test]
    fn test_flow_disabled_clears_status() {
        let mut ekf = flow_ekf();
        ekf.control_status.insert(ControlStatus::OPT_FLOW);
        ekf.params.fusion_mode = FusionMode::USE_GPS;

        ekf.control_optical_flow_fusion();

        assert!(!ekf.control_status.contains(ControlStatus::OPT_FLOW));
    }

    #[test]
    fn test_gyro_accumulates_between_samples() {
        let mut ekf = flow_ekf();
        ekf.flow_data_ready = false;
        ekf.imu_sample_delayed.delta_ang = Vector3::new(0.001, 0.0, 0.0);

        ekf.control_optical_flow_fusion();
        ekf.control_optical_flow_fusion();

        assert_abs_diff_eq!(ekf.imu_del_ang_of.x, 0.002);
        assert_abs_diff_eq!(ekf.delta_time_of, 0.02);
    }
}
