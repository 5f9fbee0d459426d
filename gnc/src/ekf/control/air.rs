use defmt_or_log::info;

use crate::ekf::{Ekf, params::FusionMode, status::ControlStatus};

/// Wind is no longer observed this long after the last air data fusion (us)
const AIR_DATA_TIMEOUT_US: u64 = 10_000_000;

impl Ekf {
    fn start_wind_estimation(&mut self) {
        if self.control_status.contains(ControlStatus::WIND) {
            return;
        }

        self.control_status.insert(ControlStatus::WIND);
        // Restart the timeouts so the new states are not dropped at once
        self.time_last_arsp_fuse = self.time_last_imu;
        self.time_last_beta_fuse = self.time_last_imu;
        self.reset_wind_states();
        self.reset_wind_covariance();
        info!("EKF commencing wind estimation");
    }

    pub(super) fn control_air_data_fusion(&mut self) {
        let now = self.time_last_imu;
        let airspeed_timed_out = now.saturating_sub(self.time_last_arsp_fuse) > AIR_DATA_TIMEOUT_US;
        let sideslip_timed_out = now.saturating_sub(self.time_last_beta_fuse) > AIR_DATA_TIMEOUT_US;
        let use_drag = self.params.fusion_mode.contains(FusionMode::USE_DRAG);

        if airspeed_timed_out && sideslip_timed_out && !use_drag {
            self.control_status.remove(ControlStatus::WIND);
        }
        if airspeed_timed_out {
            self.control_status.remove(ControlStatus::FUSE_ASPD);
        }

        if self.tas_data_ready && self.control_status.contains(ControlStatus::IN_AIR) {
            self.control_status.insert(ControlStatus::FUSE_ASPD);
            self.start_wind_estimation();
            self.fuse_airspeed();
        }
    }

    /// Synthetic sideslip is fused at a reduced rate once enabled by the host.
    pub(super) fn control_beta_fusion(&mut self) {
        let elapsed_us = self.time_last_imu.saturating_sub(self.time_last_beta_fuse);
        let due = elapsed_us as f32 > self.params.beta_avg_ft_us;

        if due && self.control_status.contains(ControlStatus::FUSE_BETA | ControlStatus::IN_AIR) {
            self.start_wind_estimation();
            self.fuse_sideslip();
        }
    }

    pub(super) fn control_drag_fusion(&mut self) {
        let t = self.imu_sample_delayed.time_us;
        let drag = self.buffers.drag.pop_first_older_than(t);

        if !self.control_status.contains(ControlStatus::IN_AIR) {
            if !self.air_data_aiding() {
                self.control_status.remove(ControlStatus::WIND);
            }
            return;
        }

        if !self.params.fusion_mode.contains(FusionMode::USE_DRAG) {
            return;
        }

        if !self.control_status.contains(ControlStatus::WIND) {
            self.start_wind_estimation();
        } else if let Some(drag) = drag {
            self.drag_sample_delayed = drag;
            self.fuse_drag();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::sensors::AirspeedSample, ekf::Parameters};
    use nalgebra::{UnitQuaternion, Vector3};

    fn flying_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.state.vel = Vector3::new(15.0, 0.0, 0.0);
        ekf.state.quat_nominal = UnitQuaternion::identity();
        ekf.control_status.insert(ControlStatus::TILT_ALIGN | ControlStatus::IN_AIR);
        ekf.time_last_imu = 20_000_000;
        ekf.imu_sample_delayed.time_us = 19_800_000;
        ekf
    }

    #[test]
    fn test_airspeed_starts_wind_estimation() {
        let mut ekf = flying_ekf();
        ekf.airspeed_sample_delayed = AirspeedSample {
            true_airspeed: 15.0,
            eas2tas: 1.0,
            time_us: 19_790_000,
        };
        ekf.tas_data_ready = true;

        ekf.control_air_data_fusion();

        assert!(ekf.control_status.contains(ControlStatus::WIND | ControlStatus::FUSE_ASPD));
        assert_eq!(ekf.time_last_arsp_fuse, ekf.time_last_imu);
    }

    #[test]
    fn test_wind_dropped_after_air_data_timeout() {
        let mut ekf = flying_ekf();
        ekf.control_status.insert(ControlStatus::WIND | ControlStatus::FUSE_ASPD);
        ekf.time_last_arsp_fuse = 1_000_000;
        ekf.time_last_beta_fuse = 1_000_000;

        ekf.control_air_data_fusion();

        assert!(!ekf.control_status.intersects(ControlStatus::WIND | ControlStatus::FUSE_ASPD));
    }

    #[test]
    fn test_sideslip_needs_host_enable() {
        let mut ekf = flying_ekf();
        ekf.control_beta_fusion();
        assert!(!ekf.control_status.contains(ControlStatus::WIND));

        ekf.set_fuse_beta_flag(true);
        ekf.control_beta_fusion();
        assert!(ekf.control_status.contains(ControlStatus::WIND));
    }

    #[test]
    fn test_drag_starts_wind_in_air_only() {
        let mut ekf = Ekf::new(Parameters {
            fusion_mode: FusionMode::USE_GPS | FusionMode::USE_DRAG,
            ..Default::default()
        });
        ekf.init(0);
        ekf.initialise_covariance();

        ekf.control_drag_fusion();
        assert!(!ekf.control_status.contains(ControlStatus::WIND));

        ekf.set_in_air_status(true);
        ekf.control_drag_fusion();
        assert!(ekf.control_status.contains(ControlStatus::WIND));

        ekf.set_in_air_status(false);
        ekf.control_drag_fusion();
        assert!(!ekf.control_status.contains(ControlStatus::WIND));
    }
}
