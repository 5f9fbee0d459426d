use defmt_or_log::{info, warn};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use crate::ekf::{
    Ekf,
    decision::{self, MagMode, MagModeInputs},
    params::{DeclinationSource, MagFuseType},
    status::ControlStatus,
};

/// Climb since take-off needed to be clear of ground magnetic anomalies (m)
const MAG_ALIGN_HEIGHT: f32 = 1.5;
/// Yaw rotation after which the bias observability check restarts (rad)
const YAW_SECTION_RAD: f32 = 0.7854;

impl Ekf {
    /// Yaw is observable from the GPS or vision velocity while accelerating,
    /// the field biases while yawing. Both use hysteresis.
    fn check_mag_observability(&mut self) {
        let accel = self.accel_lpf_ne.norm();
        let acc_gate = self.params.mag_acc_gate;

        self.yaw_angle_observable = if self.yaw_angle_observable {
            accel > acc_gate
        } else {
            accel > 2.0 * acc_gate
        } && self.control_status.intersects(ControlStatus::GPS | ControlStatus::EV_POS);

        let t = self.imu_sample_delayed.time_us;
        let rate_gate = self.params.mag_yaw_rate_gate;

        if !self.mag_bias_observable && self.yaw_rate_lpf_ef.abs() > rate_gate {
            self.mag_bias_observable = true;
            self.yaw_delta_ef = 0.0;
            self.time_yaw_started = t;
        } else if self.mag_bias_observable {
            // Observed in 45 deg sections
            if self.yaw_delta_ef.abs() > YAW_SECTION_RAD {
                self.time_yaw_started = t;
                self.yaw_delta_ef = 0.0;
            }

            // Yawing must continue at half the starting rate
            let min_yaw_change = 0.5 * rate_gate * 1e-6 * t.saturating_sub(self.time_yaw_started) as f32;
            self.mag_bias_observable = self.yaw_delta_ef.abs() > min_yaw_change;
        }

        if self.mag_bias_observable || self.yaw_angle_observable {
            self.time_last_movement = t;
        }
    }

    fn mag_mode_inputs(&self) -> MagModeInputs {
        let cs = self.control_status;
        MagModeInputs {
            fuse_type: self.params.mag_fusion_type,
            tilt_align: cs.contains(ControlStatus::TILT_ALIGN),
            in_air: cs.contains(ControlStatus::IN_AIR),
            ev_yaw: cs.contains(ControlStatus::EV_YAW),
            mag_fault: cs.contains(ControlStatus::MAG_FAULT),
            flt_mag_align_complete: self.flt_mag_align_complete,
            height_achieved: self.last_on_ground_pos_d - self.state.pos.z > MAG_ALIGN_HEIGHT,
            time_since_movement_us: self
                .imu_sample_delayed
                .time_us
                .saturating_sub(self.time_last_movement),
        }
    }

    /// Aligns yaw and the field states when 3-axis fusion starts in flight.
    fn start_mag_3d(&mut self) {
        let cs = self.control_status;

        self.flt_mag_align_complete = if cs.contains(ControlStatus::FIXED_WING | ControlStatus::IN_AIR) {
            self.realign_yaw_gps()
        } else {
            let mag = self.mag_sample_delayed.mag;
            self.reset_mag_heading(&mag)
        };

        if self.flt_mag_align_complete {
            self.control_status.insert(ControlStatus::YAW_ALIGN);
            info!("EKF commencing 3-axis magnetometer fusion");
        } else {
            warn!("EKF in-flight magnetometer alignment failed");
        }
    }

    fn set_mag_mode(&mut self, mode: MagMode) {
        let cs = self.control_status;
        let was_3d = cs.contains(ControlStatus::MAG_3D);

        match mode {
            MagMode::Mag3D if self.params.mag_fusion_type == MagFuseType::Mag3D => {
                if !was_3d {
                    let mag = self.mag_sample_delayed.mag;
                    let yaw_aligned = self.reset_mag_heading(&mag);
                    self.control_status.set(ControlStatus::YAW_ALIGN, yaw_aligned);
                }
                self.control_status.insert(ControlStatus::MAG_3D);
                self.control_status.remove(ControlStatus::MAG_HDG);
            }
            MagMode::Mag3D => {
                if !was_3d || !cs.contains(ControlStatus::YAW_ALIGN) {
                    self.start_mag_3d();
                } else if !self.control_status_prev.contains(ControlStatus::MAG_3D) {
                    self.restore_mag_covariance();
                }
                let use_3d = self.flt_mag_align_complete;
                self.control_status.set(ControlStatus::MAG_3D, use_3d);
                self.control_status.set(ControlStatus::MAG_HDG, !use_3d);
            }
            MagMode::Heading => {
                self.control_status.insert(ControlStatus::MAG_HDG);
                self.control_status.remove(ControlStatus::MAG_3D);
            }
            MagMode::Off => {
                self.control_status.remove(ControlStatus::MAG_HDG | ControlStatus::MAG_3D);
            }
        }

        // Keep the learned field variances for the next 3-axis period
        if was_3d && !self.control_status.contains(ControlStatus::MAG_3D) {
            self.save_mag_covariance();
        }
    }

    pub(super) fn control_mag_fusion(&mut self) {
        let cs = self.control_status;

        if !cs.contains(ControlStatus::IN_AIR) {
            self.last_on_ground_pos_d = self.state.pos.z;
            self.flt_mag_align_complete = false;
            self.num_bad_flight_yaw_events = 0;
        }

        // Vision yaw replaces the magnetometer
        if cs.contains(ControlStatus::EV_YAW) {
            return;
        }

        self.check_mag_observability();

        if !self.mag_data_ready {
            return;
        }

        let mode = decision::select_mag_mode(&self.mag_mode_inputs());
        self.set_mag_mode(mode);

        let states_only = decision::mag_states_only(
            self.params.mag_fusion_type,
            cs.contains(ControlStatus::FIXED_WING),
            cs.contains(ControlStatus::IN_AIR),
        ) && self.control_status.contains(ControlStatus::MAG_3D);
        if !states_only && self.control_status.contains(ControlStatus::UPDATE_MAG_STATES_ONLY) {
            // Field learning with attitude frozen leaves the covariances unusable
            self.reset_mag_covariance();
        }
        self.control_status.set(ControlStatus::UPDATE_MAG_STATES_ONLY, states_only);

        let active_mode = if self.control_status.contains(ControlStatus::MAG_3D) {
            MagMode::Mag3D
        } else {
            mode
        };
        let fuse_decl = decision::fuse_declination(
            active_mode,
            self.control_status.contains(ControlStatus::GPS),
            self.params
                .mag_declination_source
                .contains(DeclinationSource::FUSE_DECL),
        );
        self.control_status.set(ControlStatus::MAG_DEC, fuse_decl);

        let cs = self.control_status;
        if !cs.contains(ControlStatus::YAW_ALIGN) {
            return;
        }

        if cs.contains(ControlStatus::MAG_3D) {
            self.fuse_mag();
            if cs.contains(ControlStatus::MAG_DEC) {
                self.fuse_declination();
            }
        } else if cs.contains(ControlStatus::MAG_HDG) {
            self.fuse_heading();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::sensors::MagSample,
        ekf::{Parameters, states::THETA},
    };
    use nalgebra::{Vector2, Vector3};

    fn mag_ekf(fuse_type: MagFuseType) -> Ekf {
        let mut ekf = Ekf::new(Parameters {
            mag_fusion_type: fuse_type,
            ..Default::default()
        });
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.control_status
            .insert(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN | ControlStatus::BARO_HGT);
        ekf.imu_sample_delayed.time_us = 10_000_000;
        ekf.time_last_imu = 10_000_000;
        ekf.mag_sample_delayed = MagSample {
            mag: Vector3::new(0.2, 0.0, 0.4),
            time_us: 9_990_000,
        };
        ekf.mag_data_ready = true;
        ekf
    }

    #[test]
    fn test_heading_fusion_on_ground() {
        let mut ekf = mag_ekf(MagFuseType::Auto);

        ekf.control_mag_fusion();

        assert!(ekf.control_status.contains(ControlStatus::MAG_HDG));
        assert!(!ekf.control_status.contains(ControlStatus::MAG_3D));
        assert!(!ekf.control_status.contains(ControlStatus::MAG_DEC));
    }

    #[test]
    fn test_3d_fusion_after_climb_with_movement() {
        let mut ekf = mag_ekf(MagFuseType::Auto);
        ekf.control_mag_fusion();

        ekf.set_in_air_status(true);
        ekf.state.pos.z = -2.0;
        ekf.time_last_movement = ekf.imu_sample_delayed.time_us;
        ekf.control_mag_fusion();

        assert!(ekf.flt_mag_align_complete);
        assert!(ekf.control_status.contains(ControlStatus::MAG_3D));
        // No GPS, so the declination holds the heading
        assert!(ekf.control_status.contains(ControlStatus::MAG_DEC));
    }

    #[test]
    fn test_3d_falls_back_to_heading_without_movement() {
        let mut ekf = mag_ekf(MagFuseType::Auto);
        ekf.set_in_air_status(true);
        ekf.flt_mag_align_complete = true;
        ekf.time_last_movement = 0;

        ekf.control_mag_fusion();

        assert!(ekf.control_status.contains(ControlStatus::MAG_HDG));
        assert!(!ekf.control_status.contains(ControlStatus::MAG_3D));
    }

    #[test]
    fn test_fixed_3d_mode_resets_heading_on_entry() {
        let mut ekf = mag_ekf(MagFuseType::Mag3D);
        ekf.p[(THETA + 2, THETA + 2)] = 1.0;

        ekf.control_mag_fusion();

        assert!(ekf.control_status.contains(ControlStatus::MAG_3D));
        assert!(ekf.p[(THETA + 2, THETA + 2)] < 1.0);
    }

    #[test]
    fn test_mag_fault_stops_fusion() {
        let mut ekf = mag_ekf(MagFuseType::Auto);
        ekf.control_status.insert(ControlStatus::MAG_FAULT | ControlStatus::MAG_HDG);

        ekf.control_mag_fusion();

        assert!(!ekf.control_status.intersects(ControlStatus::MAG_HDG | ControlStatus::MAG_3D));
    }

    #[test]
    fn test_yaw_observable_when_accelerating_with_gps() {
        let mut ekf = mag_ekf(MagFuseType::Auto);
        ekf.accel_lpf_ne = Vector2::new(1.5, 0.0);
        ekf.check_mag_observability();
        assert!(!ekf.yaw_angle_observable);

        ekf.control_status.insert(ControlStatus::GPS);
        ekf.check_mag_observability();
        assert!(ekf.yaw_angle_observable);
        assert_eq!(ekf.time_last_movement, ekf.imu_sample_delayed.time_us);

        // Hysteresis keeps it observable down to the gate
        ekf.accel_lpf_ne = Vector2::new(0.6, 0.0);
        ekf.check_mag_observability();
        assert!(ekf.yaw_angle_observable);
    }
}
