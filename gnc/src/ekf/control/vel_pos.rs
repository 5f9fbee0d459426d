use defmt_or_log::warn;
use nalgebra::Vector2;

use crate::{
    common::math::sq,
    ekf::{Ekf, fuse::HorizontalObservation, status::ControlStatus},
};

/// Synthetic position observations are fused at this interval (us)
const FAKE_POS_INTERVAL_US: u64 = 200_000;
/// A longer gap means synthetic position fusion restarts (us)
const FAKE_POS_RESTART_US: u64 = 400_000;
/// Synthetic position noise on ground or before tilt alignment (m)
const FAKE_POS_NOISE_ALIGNING: f32 = 0.5;
/// The synthetic position is never rejected
const FAKE_POS_GATE: f32 = 100.0;

impl Ekf {
    fn has_horizontal_aiding_source(&self) -> bool {
        let cs = self.control_status;
        cs.intersects(ControlStatus::GPS | ControlStatus::OPT_FLOW | ControlStatus::EV_POS | ControlStatus::EV_VEL)
            || cs.contains(ControlStatus::FUSE_ASPD | ControlStatus::FUSE_BETA)
    }

    /// Without any horizontal aiding the position is held at the last known
    /// value to stop the inertial solution from drifting away.
    pub(super) fn control_fake_pos_fusion(&mut self) {
        if self.has_horizontal_aiding_source() {
            self.using_synthetic_position = false;
            return;
        }

        self.using_synthetic_position = true;

        let now = self.time_last_imu;
        let since_last = now.saturating_sub(self.time_last_fake_pos);
        if since_last <= FAKE_POS_INTERVAL_US && !self.obs.height {
            return;
        }

        if since_last > FAKE_POS_RESTART_US {
            self.reset_position();
            self.reset_velocity();
            if self.time_last_fake_pos != 0 {
                warn!("EKF stopping navigation");
            }
        }

        self.fuse_hpos_as_odom = false;
        self.time_last_fake_pos = now;

        let cs = self.control_status;
        let noise = if cs.contains(ControlStatus::IN_AIR | ControlStatus::TILT_ALIGN) {
            self.params.pos_noaid_noise.max(self.params.gps_pos_noise)
        } else {
            FAKE_POS_NOISE_ALIGNING
        };

        self.obs.hor_vel = None;
        self.obs.vert_vel = None;
        self.obs.hor_pos = Some(HorizontalObservation {
            meas: self.last_known_pos_ne,
            obs_var: Vector2::repeat(sq(noise)),
            gate: FAKE_POS_GATE,
        });
    }

    /// Auxiliary velocity only complements a primary horizontal source.
    pub(super) fn control_aux_vel_fusion(&mut self) {
        let t = self.imu_sample_delayed.time_us;
        let Some(sample) = self.buffers.aux_vel.pop_first_older_than(t) else {
            return;
        };
        self.aux_vel_sample_delayed = sample;

        let primary_aiding = self.control_status.intersects(
            ControlStatus::GPS | ControlStatus::EV_POS | ControlStatus::EV_VEL | ControlStatus::OPT_FLOW,
        );
        if primary_aiding {
            self.fuse_aux_vel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::sensors::AuxVelSample, ekf::Parameters};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn unaided_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.control_status.insert(ControlStatus::TILT_ALIGN | ControlStatus::BARO_HGT);
        ekf
    }

    #[test]
    fn test_synthetic_position_while_unaided() {
        let mut ekf = unaided_ekf();
        ekf.time_last_imu = 1_000_000;

        ekf.control_fake_pos_fusion();

        assert!(ekf.using_synthetic_position);
        assert_eq!(ekf.time_last_fake_pos, 1_000_000);
        let obs = ekf.obs.hor_pos.unwrap();
        assert_abs_diff_eq!(obs.obs_var.x, sq(FAKE_POS_NOISE_ALIGNING));
        assert_abs_diff_eq!(obs.gate, FAKE_POS_GATE);
    }

    #[test]
    fn test_synthetic_position_rate_limited() {
        let mut ekf = unaided_ekf();
        ekf.time_last_imu = 1_000_000;
        ekf.control_fake_pos_fusion();
        ekf.obs = Default::default();

        ekf.time_last_imu += 100_000;
        ekf.control_fake_pos_fusion();
        assert!(ekf.obs.hor_pos.is_none());

        // Height fusion this cycle brings it forward
        ekf.obs.height = true;
        ekf.control_fake_pos_fusion();
        assert!(ekf.obs.hor_pos.is_some());
    }

    #[test]
    fn test_in_air_noise_uses_unaided_setting() {
        let mut ekf = unaided_ekf();
        ekf.set_in_air_status(true);
        ekf.time_last_imu = 1_000_000;

        ekf.control_fake_pos_fusion();

        let obs = ekf.obs.hor_pos.unwrap();
        assert_abs_diff_eq!(obs.obs_var.x, sq(ekf.params.pos_noaid_noise));
    }

    #[test]
    fn test_no_synthetic_position_with_gps() {
        let mut ekf = unaided_ekf();
        ekf.control_status.insert(ControlStatus::GPS);
        ekf.using_synthetic_position = true;
        ekf.time_last_imu = 1_000_000;

        ekf.control_fake_pos_fusion();

        assert!(!ekf.using_synthetic_position);
        assert!(!ekf.obs.any());
    }

    #[test]
    fn test_aux_vel_needs_primary_aiding() {
        let mut ekf = unaided_ekf();
        ekf.imu_sample_delayed.time_us = 1_000_000;
        ekf.time_last_imu = 1_000_000;
        let sample = AuxVelSample {
            vel_ne: Vector2::new(1.0, 0.0),
            vel_var_ne: Vector2::new(0.01, 0.01),
            time_us: 900_000,
        };

        ekf.buffers.aux_vel.push(sample).unwrap();
        ekf.control_aux_vel_fusion();
        assert_abs_diff_eq!(ekf.state.vel.x, 0.0);

        ekf.control_status.insert(ControlStatus::GPS);
        ekf.buffers.aux_vel.push(AuxVelSample { time_us: 950_000, ..sample }).unwrap();
        ekf.control_aux_vel_fusion();
        assert!(ekf.state.vel.x > 0.4);
    }
}
