//! Direct observations of the velocity, position and height states.

use defmt_or_log::warn;
use nalgebra::Vector2;

use crate::{
    common::math::sq,
    ekf::{
        Ekf, FusionError,
        fusion::test_ratio,
        states::{StateMask, StateVector, VEL},
        status::{ControlStatus, FaultStatus, InnovationFaultStatus},
    },
};

/// North and East observation of the velocity or the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HorizontalObservation {
    pub meas: Vector2<f32>,
    pub obs_var: Vector2<f32>,
    pub gate: f32,
}

/// Down observation of the velocity or the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct VerticalObservation {
    pub meas: f32,
    pub obs_var: f32,
    pub gate: f32,
}

/// Observations requested by the aiding sources during one fusion cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct DirectObservations {
    pub hor_vel: Option<HorizontalObservation>,
    pub vert_vel: Option<VerticalObservation>,
    pub hor_pos: Option<HorizontalObservation>,
    /// Fuse the active height source
    pub height: bool,
}

impl DirectObservations {
    pub fn any(&self) -> bool {
        self.hor_vel.is_some() || self.vert_vel.is_some() || self.hor_pos.is_some() || self.height
    }
}

/// Fault bits of the velocity then the position axes
const AXIS_FAULTS: [FaultStatus; 6] = [
    FaultStatus::BAD_VEL_N,
    FaultStatus::BAD_VEL_E,
    FaultStatus::BAD_VEL_D,
    FaultStatus::BAD_POS_N,
    FaultStatus::BAD_POS_E,
    FaultStatus::BAD_POS_D,
];

/// Removes the part of a positive baro innovation that ground effect
/// overpressure can explain.
fn ground_effect_deadzone(innov: f32, deadzone: f32) -> f32 {
    if innov <= 0.0 {
        innov
    } else if innov >= deadzone {
        innov - deadzone
    } else {
        0.0
    }
}

impl Ekf {
    /// Velocity then position state, indexed like the innovations.
    fn vel_pos_state(&self, index: usize) -> f32 {
        if index < 3 {
            self.state.vel[index]
        } else {
            self.state.pos[index - 3]
        }
    }

    /// Vertical position observed by the active height source.
    pub(crate) fn height_observation(&self) -> Option<VerticalObservation> {
        let p = &self.params;

        if self.control_status.contains(ControlStatus::BARO_HGT) {
            Some(VerticalObservation {
                meas: self.hgt_sensor_offset - self.baro_sample_delayed.hgt + self.baro_hgt_offset,
                obs_var: sq(p.baro_noise.max(0.01)),
                gate: p.baro_innov_gate.max(1.0),
            })
        } else if self.control_status.contains(ControlStatus::GPS_HGT) {
            // Vertical accuracy is typically 1.5 times worse than horizontal
            let lower = p.gps_pos_noise.max(0.01);
            let upper = p.pos_noaid_noise.max(lower);
            let gps = &self.gps_sample_delayed;
            Some(VerticalObservation {
                meas: self.hgt_sensor_offset - gps.hgt + self.gps_alt_ref,
                obs_var: sq(1.5 * gps.vacc.clamp(lower, upper)),
                gate: p.baro_innov_gate.max(1.0),
            })
        } else if self.control_status.contains(ControlStatus::RNG_HGT)
            && self.r_rng_to_earth_2_2 > p.range_cos_max_tilt
        {
            let rng = self.range_sample_delayed.rng;
            let r22 = self.r_rng_to_earth_2_2;
            Some(VerticalObservation {
                meas: self.hgt_sensor_offset - (rng * r22).max(p.rng_gnd_clearance),
                obs_var: ((sq(p.range_noise) + sq(p.range_noise_scaler * rng)) * sq(r22)).max(0.01),
                gate: p.range_innov_gate.max(1.0),
            })
        } else if self.control_status.contains(ControlStatus::EV_HGT) {
            let ev = &self.ev_sample_delayed;
            Some(VerticalObservation {
                meas: ev.pos_ned.z,
                obs_var: sq(ev.pos_err.max(0.01)),
                gate: p.ev_innov_gate.max(1.0),
            })
        } else {
            None
        }
    }

    fn height_innovation(&self, meas: f32) -> f32 {
        let innov = meas - self.state.pos.z;

        if self.control_status.contains(ControlStatus::BARO_HGT | ControlStatus::GND_EFFECT) {
            ground_effect_deadzone(innov, self.params.gnd_effect_deadzone)
        } else {
            innov
        }
    }

    /// Fuses a direct observation of state `index` and records the numerical
    /// health of the update in the fault status.
    pub(crate) fn fuse_direct(&mut self, index: usize, innov: f32, obs_var: f32, fault: FaultStatus) -> Result<(), FusionError> {
        let mut h = StateVector::zeros();
        h[index] = 1.0;

        let result = self
            .innovation_variance(&h, obs_var)
            .and_then(|innov_var| self.fuse_scalar(&h, innov, innov_var, &StateMask::all()));

        self.fault_status.set(fault, result.is_err());
        result
    }

    /// Fuses the velocity, position and height observations requested this
    /// cycle. Position and height are gated as separate sensors and every
    /// gate is open until the tilt is aligned.
    pub(crate) fn fuse_vel_pos_height(&mut self) {
        let obs = core::mem::take(&mut self.obs);
        let gates_active = self.control_status.contains(ControlStatus::TILT_ALIGN);

        let mut meas: [Option<(f32, f32, f32)>; 6] = [None; 6];

        if let Some(v) = obs.hor_vel {
            for i in 0..2 {
                meas[i] = Some((v.meas[i], v.obs_var[i], v.gate));
            }
        }
        if let Some(v) = obs.vert_vel {
            meas[2] = Some((v.meas, v.obs_var, v.gate));
        }
        if let Some(p) = obs.hor_pos {
            for i in 0..2 {
                meas[3 + i] = Some((p.meas[i], p.obs_var[i], p.gate));
            }
        }
        if obs.height {
            meas[5] = self.height_observation().map(|h| (h.meas, h.obs_var, h.gate));
        }

        for (i, m) in meas.iter().enumerate() {
            let Some((value, obs_var, gate)) = *m else {
                continue;
            };

            let innov = if i == 5 {
                self.height_innovation(value)
            } else {
                value - self.vel_pos_state(i)
            };
            let innov_var = self.p[(VEL + i, VEL + i)] + obs_var;

            self.innov.vel_pos[i] = innov;
            self.innov.vel_pos_var[i] = innov_var;
            self.innov.vel_pos_test_ratio[i] = test_ratio(innov, innov_var, gate);
        }

        let ratio = self.innov.vel_pos_test_ratio;
        let passes = |range: core::ops::Range<usize>| {
            !gates_active || range.filter(|i| meas[*i].is_some()).all(|i| ratio[i] <= 1.0)
        };
        let vel_pass = passes(0..3);
        let pos_pass = passes(3..5);
        let hgt_pass = passes(5..6);

        let now = self.time_last_imu;

        if meas[..3].iter().any(Option::is_some) {
            if vel_pass {
                self.time_last_vel_fuse = now;
            }
            self.innov_check_fail_status
                .set(InnovationFaultStatus::REJECT_VEL_NED, !vel_pass);
        }

        if obs.hor_pos.is_some() {
            if pos_pass {
                if self.fuse_hpos_as_odom {
                    self.time_last_delpos_fuse = now;
                } else {
                    self.time_last_pos_fuse = now;
                }
            }
            self.innov_check_fail_status
                .set(InnovationFaultStatus::REJECT_POS_NE, !pos_pass);
        }

        if meas[5].is_some() {
            if hgt_pass {
                self.time_last_hgt_fuse = now;
            }
            self.innov_check_fail_status
                .set(InnovationFaultStatus::REJECT_POS_D, !hgt_pass);
        }

        for (i, m) in meas.iter().enumerate() {
            let Some((value, obs_var, _)) = *m else {
                continue;
            };

            let pass = match i {
                0..=2 => vel_pass,
                3 | 4 => pos_pass,
                _ => hgt_pass,
            };
            if !pass {
                continue;
            }

            // Earlier axes may have moved this state through its correlations
            let innov = if i == 5 {
                self.height_innovation(value)
            } else {
                value - self.vel_pos_state(i)
            };

            if self.fuse_direct(VEL + i, innov, obs_var, AXIS_FAULTS[i]).is_err() {
                warn!("EKF velocity and position fusion failed on axis {}", i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::{Parameters, states::POS};
    use approx::assert_abs_diff_eq;

    fn aligned_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.control_status.insert(ControlStatus::TILT_ALIGN);
        ekf
    }

    #[test]
    fn test_ground_effect_deadzone() {
        assert_abs_diff_eq!(ground_effect_deadzone(-1.0, 4.0), -1.0);
        assert_abs_diff_eq!(ground_effect_deadzone(2.0, 4.0), 0.0);
        assert_abs_diff_eq!(ground_effect_deadzone(5.0, 4.0), 1.0);
    }

    #[test]
    fn test_baro_height_observation() {
        let mut ekf = aligned_ekf();
        ekf.control_status.insert(ControlStatus::BARO_HGT);
        ekf.baro_hgt_offset = 100.0;
        ekf.baro_sample_delayed.hgt = 102.0;

        let obs = ekf.height_observation().unwrap();
        assert_abs_diff_eq!(obs.meas, -2.0);
        assert_abs_diff_eq!(obs.obs_var, sq(ekf.params.baro_noise));
    }

    #[test]
    fn test_position_fusion_moves_towards_measurement() {
        let mut ekf = aligned_ekf();
        ekf.obs.hor_pos = Some(HorizontalObservation {
            meas: Vector2::new(0.5, -0.5),
            obs_var: Vector2::repeat(0.25),
            gate: 5.0,
        });

        ekf.fuse_vel_pos_height();

        assert!(ekf.state.pos.x > 0.0 && ekf.state.pos.x < 0.5);
        assert!(ekf.state.pos.y < 0.0 && ekf.state.pos.y > -0.5);
        assert!(!ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_POS_NE));
        assert_eq!(ekf.obs, DirectObservations::default());
    }

    #[test]
    fn test_outlier_is_rejected_once_aligned() {
        let mut ekf = aligned_ekf();
        let var_before = ekf.p[(POS, POS)];
        ekf.obs.hor_pos = Some(HorizontalObservation {
            meas: Vector2::new(1000.0, 0.0),
            obs_var: Vector2::repeat(0.25),
            gate: 5.0,
        });

        ekf.fuse_vel_pos_height();

        assert_abs_diff_eq!(ekf.state.pos.x, 0.0);
        assert_abs_diff_eq!(ekf.p[(POS, POS)], var_before);
        assert!(ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_POS_NE));
        assert!(ekf.innov.vel_pos_test_ratio[3] > 1.0);
    }

    #[test]
    fn test_gates_open_before_tilt_alignment() {
        let mut ekf = aligned_ekf();
        ekf.control_status.remove(ControlStatus::TILT_ALIGN);
        ekf.obs.vert_vel = Some(VerticalObservation {
            meas: 50.0,
            obs_var: 0.01,
            gate: 5.0,
        });

        ekf.fuse_vel_pos_height();

        assert!(ekf.state.vel.z > 1.0);
        assert!(!ekf.innov_check_fail_status.contains(InnovationFaultStatus::REJECT_VEL_NED));
    }
}
