use defmt_or_log::info;
use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::{
    common::math::sq,
    ekf::{
        Ekf,
        fuse::{HorizontalObservation, VerticalObservation},
        params::{EV_MAX_INTERVAL_US, FusionMode, VdistSensor},
        status::ControlStatus,
    },
};

/// Vision aiding stops after this long without data (us)
const EV_DATA_STOPPED_US: u64 = 5_000_000;
/// Largest step of the frame rotation vector accepted per sample (rad)
const EV_ROT_SPIKE_LIM: f32 = 0.1;
/// Cutoff of the frame rotation filter (rad/us)
const EV_ROT_LPF_RAD_PER_US: f32 = 0.2e-6;

impl Ekf {
    /// The vision frame is rotated into the navigation frame only when its
    /// yaw is not being fused directly.
    fn ev_frame_rotation_enabled(&self) -> bool {
        let mode = self.params.fusion_mode;
        mode.contains(FusionMode::ROTATE_EV)
            && mode.intersects(FusionMode::USE_EVPOS | FusionMode::USE_EVVEL)
            && !self.control_status.contains(ControlStatus::EV_YAW)
    }

    fn ev_frame_error(&self) -> Vector3<f32> {
        let q_error = self.state.quat_nominal * self.ev_sample_delayed.quat.inverse();
        q_error.scaled_axis()
    }

    /// Tracks the rotation from the vision frame to the navigation frame with
    /// a spike limited low pass filter.
    fn calc_ext_vis_rot_mat(&mut self) {
        let mut rot_vec = self.ev_frame_error();

        if rot_vec.norm() > 1e-6 {
            let delta = rot_vec - self.ev_rot_vec_filt;
            let delta_len = delta.norm();
            if delta_len > EV_ROT_SPIKE_LIM {
                rot_vec = self.ev_rot_vec_filt + delta * (EV_ROT_SPIKE_LIM / delta_len);
            }

            let elapsed_us = self.time_last_imu.saturating_sub(self.ev_rot_last_time_us);
            let alpha = (EV_ROT_LPF_RAD_PER_US * elapsed_us as f32).clamp(0.0, 1.0);
            self.ev_rot_last_time_us = self.time_last_imu;
            self.ev_rot_vec_filt = self.ev_rot_vec_filt * (1.0 - alpha) + rot_vec * alpha;
        }

        self.ev_rot_mat = UnitQuaternion::from_scaled_axis(self.ev_rot_vec_filt)
            .to_rotation_matrix()
            .into_inner();
    }

    /// Rotates a vector from the vision frame into the navigation frame.
    pub(crate) fn ev_to_ekf_frame(&self, v: &Vector3<f32>) -> Vector3<f32> {
        if self.ev_frame_rotation_enabled() {
            self.ev_rot_mat * v
        } else {
            *v
        }
    }

    /// Snaps the frame rotation to the current attitude error, used after a
    /// yaw reset.
    pub(crate) fn reset_ext_vision_rotation(&mut self) {
        let rot_vec = self.ev_frame_error();
        self.ev_rot_vec_filt = if rot_vec.norm() > 1e-9 { rot_vec } else { Vector3::zeros() };
        self.ev_rot_last_time_us = self.time_last_imu;
        self.ev_rot_mat = UnitQuaternion::from_scaled_axis(self.ev_rot_vec_filt)
            .to_rotation_matrix()
            .into_inner();
    }

    fn start_ev_aiding(&mut self) {
        let cs = self.control_status;
        let mode = self.params.fusion_mode;
        let aligned = cs.contains(ControlStatus::TILT_ALIGN | ControlStatus::YAW_ALIGN);
        let recent = self.time_last_imu.saturating_sub(self.arrivals.ext_vision) < 2 * EV_MAX_INTERVAL_US;

        if !(aligned && recent) {
            return;
        }

        if mode.contains(FusionMode::USE_EVPOS) && !cs.contains(ControlStatus::EV_POS) {
            self.control_status.insert(ControlStatus::EV_POS);
            // Vision positions are fused as increments while GPS holds the position
            if !cs.contains(ControlStatus::GPS) {
                self.reset_position();
                self.reset_velocity();
            }
            self.hpos_prev_available = false;
            info!("EKF commencing vision position fusion");
        }

        if mode.contains(FusionMode::USE_EVVEL) && !cs.contains(ControlStatus::EV_VEL) {
            self.control_status.insert(ControlStatus::EV_VEL);
            if !cs.contains(ControlStatus::GPS) {
                self.reset_velocity();
            }
            info!("EKF commencing vision velocity fusion");
        }
    }

    fn start_ev_yaw(&mut self) {
        let recent = self.time_last_imu.saturating_sub(self.arrivals.ext_vision) < 2 * EV_MAX_INTERVAL_US;
        let can_start = self.params.fusion_mode.contains(FusionMode::USE_EVYAW)
            && !self.control_status.contains(ControlStatus::EV_YAW)
            && self.control_status.contains(ControlStatus::TILT_ALIGN)
            && recent;

        if !can_start {
            return;
        }

        self.control_status.insert(ControlStatus::EV_YAW);
        let mag = self.mag_sample_delayed.mag;
        if let Some((yaw, yaw_var)) = self.yaw_observation(&mag) {
            self.reset_quat_state_yaw(yaw, yaw_var, true);
        }

        self.control_status.insert(ControlStatus::YAW_ALIGN);
        self.control_status
            .remove(ControlStatus::MAG_HDG | ControlStatus::MAG_3D | ControlStatus::MAG_DEC);
        info!("EKF commencing vision yaw fusion");
    }

    fn start_ev_height(&mut self) {
        if self.primary_hgt_source == VdistSensor::ExtVision && !self.control_status.contains(ControlStatus::EV_HGT) {
            self.set_height_source_flag(ControlStatus::EV_HGT);
            self.reset_height();
            info!("EKF commencing vision height fusion");
        }
    }

    /// Requests the vision position, either as an absolute position or, when
    /// another source holds the absolute position, as the change since the
    /// previous sample.
    fn request_ev_position(&mut self) {
        let offset_earth = self.r_to_earth * (self.params.ev_pos_body - self.params.imu_pos_body);
        self.ev_sample_delayed.pos_ned -= offset_earth;

        let ev = self.ev_sample_delayed;
        self.fuse_hpos_as_odom = self.control_status.contains(ControlStatus::GPS);

        let meas = if self.fuse_hpos_as_odom {
            let meas = if self.hpos_prev_available {
                let delta = self.ev_to_ekf_frame(&(ev.pos_ned - self.pos_meas_prev));
                Some(self.hpos_pred_prev + delta.xy())
            } else {
                self.hpos_prev_available = true;
                None
            };
            self.pos_meas_prev = ev.pos_ned;
            self.hpos_pred_prev = self.state.pos.xy();
            meas
        } else {
            if self.time_last_imu.saturating_sub(self.time_last_pos_fuse) > self.params.no_gps_timeout_max {
                // Only reset velocity when nothing else constrains it
                let now = self.time_last_imu;
                if now.saturating_sub(self.time_last_of_fuse) > 1_000_000
                    && now.saturating_sub(self.time_last_vel_fuse) > 1_000_000
                {
                    self.reset_velocity();
                }
                self.reset_position();
            }
            Some(self.ev_to_ekf_frame(&ev.pos_ned).xy())
        };

        if let Some(meas) = meas {
            self.obs.hor_pos = Some(HorizontalObservation {
                meas,
                obs_var: Vector2::repeat(sq(ev.pos_err.max(0.01))),
                gate: self.params.ev_innov_gate.max(1.0),
            });
        }
    }

    fn request_ev_velocity(&mut self) {
        let ev = self.ev_sample_delayed;
        let vel = self.ev_to_ekf_frame(&ev.vel_ned);
        let obs_var = sq(ev.vel_err.max(0.01));
        let gate = self.params.ev_innov_gate.max(1.0);

        self.obs.hor_vel = Some(HorizontalObservation {
            meas: vel.xy(),
            obs_var: Vector2::repeat(obs_var),
            gate,
        });
        self.obs.vert_vel = Some(VerticalObservation {
            meas: vel.z,
            obs_var,
            gate,
        });
    }

    pub(super) fn control_external_vision_fusion(&mut self) {
        if !self.ev_data_ready {
            let now = self.time_last_imu;
            let stopped = now.saturating_sub(self.arrivals.ext_vision) > EV_DATA_STOPPED_US;
            if stopped && self.control_status.intersects(ControlStatus::EV_POS | ControlStatus::EV_VEL) {
                self.control_status.remove(ControlStatus::EV_POS | ControlStatus::EV_VEL);
                info!("EKF vision data stopped");
            }
            return;
        }

        if self.ev_frame_rotation_enabled() {
            self.calc_ext_vis_rot_mat();
        }

        self.start_ev_aiding();
        self.start_ev_yaw();
        self.start_ev_height();

        // GPS and flow requests were consumed earlier in the cycle
        self.obs.height = self.control_status.contains(ControlStatus::EV_HGT);

        if self.control_status.contains(ControlStatus::EV_POS) {
            self.request_ev_position();
        }
        if self.control_status.contains(ControlStatus::EV_VEL) {
            self.request_ev_velocity();
        }

        if self.obs.any() {
            self.fuse_vel_pos_height();
        }

        if self.control_status.contains(ControlStatus::EV_YAW) {
            self.fuse_heading();
        }
    }
}
