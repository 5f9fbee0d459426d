//! Height source selection, switching on timeouts and the offsets that keep
//! each source consistent with the vertical position when it takes over.

use defmt_or_log::{info, warn};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use crate::{
    common::math::sq,
    ekf::{
        Ekf,
        decision::{self, HeightSource, HeightTimeoutInputs, RangeAidInputs},
        fusion::test_ratio,
        params::{
            BADACC_PROBATION_US, BARO_MAX_INTERVAL_US, EV_MAX_INTERVAL_US, GNDEFFECT_TIMEOUT_US,
            GPS_MAX_INTERVAL_US, RNG_MAX_INTERVAL_US, VdistSensor,
        },
        states::POS,
        status::ControlStatus,
    },
};

/// Height fusion is considered timed out after this long (us)
const HGT_FUSION_TIMEOUT_US: u64 = 5_000_000;
/// Time constant of the baro to local origin offset filter (1/s)
const BARO_OFFSET_RATE: f32 = 0.1;
/// Largest baro offset correction rate (m/s)
const BARO_OFFSET_RATE_LIM: f32 = 0.1;

impl Ekf {
    fn is_fresh(&self, newest_us: Option<u64>, max_interval_us: u64) -> bool {
        newest_us.is_some_and(|t| self.time_last_imu.saturating_sub(t) < 2 * max_interval_us)
    }

    /// Detects vibration induced accelerometer clipping, which makes the
    /// inertial solution think it is falling. Baro height and GPS vertical
    /// velocity must both disagree with it.
    fn check_vertical_accel_health(&mut self) {
        let lim = self.params.vert_innov_test_lim;
        let innov = &self.innov;
        let t = self.imu_sample_delayed.time_us;

        let bad_vert_accel = self.control_status.contains(ControlStatus::BARO_HGT)
            && sq(innov.vel_pos[5] * innov.vel_pos[2]) > sq(sq(lim)) * innov.vel_pos_var[5] * innov.vel_pos_var[2]
            && innov.vel_pos[2] < 0.0
            && t.saturating_sub(self.baro_sample_delayed.time_us) < 2 * BARO_MAX_INTERVAL_US
            && t.saturating_sub(self.gps_sample_delayed.time_us) < 2 * GPS_MAX_INTERVAL_US;

        let now = self.time_last_imu;
        if bad_vert_accel {
            self.time_bad_vert_accel = now;
        } else {
            self.time_good_vert_accel = now;
        }

        // Stays declared for a probation period
        self.bad_vert_accel_detected = if self.bad_vert_accel_detected {
            now.saturating_sub(self.time_bad_vert_accel) < BADACC_PROBATION_US
        } else {
            bad_vert_accel
        };
    }

    fn height_timeout_inputs(&self) -> HeightTimeoutInputs {
        let now = self.time_last_imu;
        let baro = self.buffers.baro.last_pushed().copied();
        let gps = self.buffers.gps.last_pushed().copied();

        let baro_available = self.is_fresh(baro.map(|b| b.time_us), BARO_MAX_INTERVAL_US);
        let gps_available = self.is_fresh(gps.map(|g| g.time_us), GPS_MAX_INTERVAL_US);

        let baro_consistent = baro.is_some_and(|b| {
            let innov = self.hgt_sensor_offset - b.hgt + self.baro_hgt_offset - self.state.pos.z;
            innov.abs() < (sq(self.params.baro_noise) + self.p[(POS + 2, POS + 2)]) * sq(self.params.baro_innov_gate)
        });

        HeightTimeoutInputs {
            baro_available,
            baro_consistent,
            baro_faulty: self.baro_hgt_faulty,
            gps_hgt_accurate: gps.is_some_and(|g| g.vacc < self.params.req_vacc) && !self.gps_hgt_faulty,
            gps_hgt_intermittent: !gps_available,
            rng_available: self.is_fresh(self.buffers.range.newest_time_us(), RNG_MAX_INTERVAL_US),
            ev_available: self.is_fresh(self.buffers.ext_vision.newest_time_us(), EV_MAX_INTERVAL_US),
            recent_bad_vert_accel: self.time_bad_vert_accel > 0
                && now.saturating_sub(self.time_bad_vert_accel) < BADACC_PROBATION_US,
        }
    }

    /// Resets the height to the best available source when height fusion has
    /// timed out or the accelerometer keeps failing, and switches to that
    /// source.
    pub(super) fn control_height_sensor_timeouts(&mut self) {
        self.check_vertical_accel_health();

        let now = self.time_last_imu;
        let continuous_bad_accel_hgt =
            now.saturating_sub(self.time_good_vert_accel) > self.params.bad_acc_reset_delay_us;
        let hgt_fusion_timeout = now.saturating_sub(self.time_last_hgt_fuse) > HGT_FUSION_TIMEOUT_US;
        let hgt_var_large = self.p[(POS + 2, POS + 2)] > sq(self.params.hgt_reset_lim);

        if !(hgt_var_large && (hgt_fusion_timeout || continuous_bad_accel_hgt)) {
            return;
        }

        let Some(current) = HeightSource::from_status(self.control_status) else {
            return;
        };
        let Some(target) = decision::height_timeout_action(current, &self.height_timeout_inputs()) else {
            return;
        };

        match (current, target) {
            (HeightSource::Baro, HeightSource::Gps) => {
                self.baro_hgt_faulty = true;
                self.gps_hgt_faulty = false;
                warn!("EKF baro height timeout, reset to GPS");
            }
            (HeightSource::Baro, _) => {
                self.baro_hgt_faulty = false;
                warn!("EKF baro height timeout, reset to baro");
            }
            (HeightSource::Gps, HeightSource::Baro) => {
                self.gps_hgt_faulty = true;
                self.baro_hgt_faulty = false;
                warn!("EKF GPS height timeout, reset to baro");
            }
            (HeightSource::Gps, _) => {
                self.gps_hgt_faulty = false;
                warn!("EKF GPS height timeout, reset to GPS");
            }
            (HeightSource::Range, HeightSource::Baro) => {
                self.rng_hgt_faulty = true;
                self.baro_hgt_faulty = false;
                warn!("EKF range height timeout, reset to baro");
            }
            (HeightSource::Range, _) => {
                self.rng_hgt_faulty = false;
                warn!("EKF range height timeout, reset to range");
            }
            (HeightSource::ExtVision, HeightSource::Baro) => {
                self.baro_hgt_faulty = false;
                warn!("EKF vision height timeout, reset to baro");
            }
            (HeightSource::ExtVision, _) => warn!("EKF vision height timeout, reset to vision"),
        }

        self.set_height_source_flag(target.flag());
        self.reset_height();
        self.time_last_hgt_fuse = now;
    }

    fn range_aid_conditions_met(&self) -> bool {
        if !self.params.range_aid {
            return false;
        }

        let cs = self.control_status;
        let hagl_test_ratio = if self.innov.hagl_var > 0.0 {
            test_ratio(self.innov.hagl, self.innov.hagl_var, self.params.range_aid_innov_gate)
        } else {
            f32::INFINITY
        };

        decision::range_aid_conditions_met(&RangeAidInputs {
            in_air: cs.contains(ControlStatus::IN_AIR),
            rng_faulty: self.rng_hgt_faulty,
            terrain_valid: self.get_terrain_valid(),
            in_range_aid_mode: self.in_range_aid_mode,
            hagl: self.get_hagl(),
            max_hagl: self.params.max_hagl_for_range_aid,
            horz_vel_valid: cs.intersects(ControlStatus::GPS | ControlStatus::EV_POS | ControlStatus::OPT_FLOW)
                && self.fault_status.is_empty(),
            ground_speed: self.state.vel.xy().norm(),
            max_speed: self.params.max_vel_for_range_aid,
            hagl_test_ratio,
        })
    }

    fn switched_to(&self, flag: ControlStatus) -> bool {
        self.control_status.contains(flag) && !self.control_status_prev.contains(flag)
    }

    /// Offset that makes the range measurement match the current height when
    /// range height takes over.
    fn range_height_offset(&self, on_ground_clearance: bool) -> f32 {
        let in_air = self.control_status.contains(ControlStatus::IN_AIR);

        if on_ground_clearance && !in_air {
            self.params.rng_gnd_clearance
        } else if self.get_terrain_valid() {
            self.get_terrain_vert_pos()
        } else {
            self.r_rng_to_earth_2_2 * self.range_sample_delayed.rng + self.state.pos.z
        }
    }

    fn use_range_height(&mut self, on_ground_clearance: bool) {
        self.set_height_source_flag(ControlStatus::RNG_HGT);
        if self.switched_to(ControlStatus::RNG_HGT) {
            self.hgt_sensor_offset = self.range_height_offset(on_ground_clearance);
            info!("EKF using range height");
        }
    }

    fn use_baro_height(&mut self) {
        self.set_height_source_flag(ControlStatus::BARO_HGT);
        // Baro tracks its own offset to the local origin
        if self.switched_to(ControlStatus::BARO_HGT) {
            self.hgt_sensor_offset = 0.0;
            info!("EKF using baro height");
        }
    }

    fn use_gps_height(&mut self) {
        self.set_height_source_flag(ControlStatus::GPS_HGT);
        if self.switched_to(ControlStatus::GPS_HGT) {
            self.hgt_sensor_offset = self.gps_sample_delayed.hgt - self.gps_alt_ref + self.state.pos.z;
            info!("EKF using GPS height");
        }
    }

    /// Selects the height source from the configured primary source, range
    /// aiding and sensor health, and requests fusion of its new data.
    pub(super) fn control_height_fusion(&mut self) {
        if self.range_data_ready {
            let offset_earth = self.r_to_earth * (self.params.rng_pos_body - self.params.imu_pos_body);
            self.range_sample_delayed.rng += offset_earth.z / self.r_rng_to_earth_2_2;
        }

        let rng_ready = self.range_data_ready && !self.rng_hgt_faulty;
        let baro_ready = self.baro_data_ready && !self.baro_hgt_faulty;
        let gps_ready = self.gps_data_ready && !self.gps_hgt_faulty;

        match self.primary_hgt_source {
            VdistSensor::Baro | VdistSensor::Gps => {
                self.in_range_aid_mode = self.range_aid_conditions_met();
                // Waiting for range data while in range aid mode
                let awaiting_range = self.in_range_aid_mode && !self.range_data_ready && !self.rng_hgt_faulty;
                let primary_is_gps = self.primary_hgt_source == VdistSensor::Gps;

                if self.in_range_aid_mode && rng_ready {
                    self.use_range_height(false);
                    self.obs.height = true;
                } else if primary_is_gps && gps_ready && !awaiting_range {
                    self.use_gps_height();
                    self.obs.height = true;
                    self.in_range_aid_mode = false;
                } else if !primary_is_gps && baro_ready && !awaiting_range {
                    self.use_baro_height();
                    self.obs.height = true;
                    self.in_range_aid_mode = false;
                } else if primary_is_gps && self.control_status.contains(ControlStatus::BARO_HGT) && baro_ready {
                    // Baro after a timeout reset away from GPS
                    self.obs.height = true;
                    self.in_range_aid_mode = false;
                } else if !primary_is_gps && self.control_status.contains(ControlStatus::GPS_HGT) && gps_ready {
                    // GPS after a timeout reset away from baro
                    self.obs.height = true;
                    self.in_range_aid_mode = false;
                }
            }
            VdistSensor::Range => {
                if !self.rng_hgt_faulty {
                    self.use_range_height(true);
                    self.obs.height = self.range_data_ready;
                } else if baro_ready {
                    self.use_baro_height();
                    self.obs.height = true;
                }
            }
            // Vision height is handled with the other vision observations
            VdistSensor::ExtVision => {}
        }

        self.update_baro_offset();
        self.check_ground_effect();

        let rng_hgt_stale = self.time_last_imu.saturating_sub(self.time_last_hgt_fuse) > 2 * RNG_MAX_INTERVAL_US;
        if rng_hgt_stale && self.control_status.contains(ControlStatus::RNG_HGT) && !self.range_data_ready {
            // Missing or rejected range data on ground, the range is known
            if !self.control_status.contains(ControlStatus::IN_AIR) {
                self.range_sample_delayed.rng = self.params.rng_gnd_clearance;
                self.range_sample_delayed.time_us = self.imu_sample_delayed.time_us;
            }
            self.obs.height = true;
        }
    }

    /// Low pass filters the offset between the baro height and the local
    /// origin while another source provides the height.
    fn update_baro_offset(&mut self) {
        if self.control_status.contains(ControlStatus::BARO_HGT) || !self.baro_data_ready {
            return;
        }

        let dt = (1e-6 * self.delta_time_baro_us as f32).clamp(0.0, 1.0);
        let rate = BARO_OFFSET_RATE * (self.baro_sample_delayed.hgt + self.state.pos.z - self.baro_hgt_offset);
        self.baro_hgt_offset += dt * rate.clamp(-BARO_OFFSET_RATE_LIM, BARO_OFFSET_RATE_LIM);
    }

    /// Ground effect protection ends a while after the host stops asking for
    /// it, or once clear of the ground.
    fn check_ground_effect(&mut self) {
        if !self.control_status.contains(ControlStatus::GND_EFFECT) {
            return;
        }

        let timed_out = self.time_last_imu.saturating_sub(self.time_last_gnd_effect_on) > GNDEFFECT_TIMEOUT_US;
        let clear_of_ground = self.get_terrain_valid() && self.get_hagl() > self.params.gnd_effect_max_hgt;

        if timed_out || clear_of_ground {
            self.control_status.remove(ControlStatus::GND_EFFECT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::sensors::{BaroSample, GpsSample},
        ekf::Parameters,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn baro_ekf() -> Ekf {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);
        ekf.initialise_covariance();
        ekf.set_height_source_flag(ControlStatus::BARO_HGT);
        ekf.control_status_prev = ekf.control_status;
        ekf
    }

    #[test]
    fn test_baro_height_requested() {
        let mut ekf = baro_ekf();
        ekf.baro_data_ready = true;

        ekf.control_height_fusion();

        assert!(ekf.obs.height);
        assert_eq!(HeightSource::from_status(ekf.control_status), Some(HeightSource::Baro));
    }

    #[test]
    fn test_switch_to_gps_height_sets_offset() {
        let mut ekf = Ekf::new(Parameters {
            vdist_sensor_type: VdistSensor::Gps,
            ..Default::default()
        });
        ekf.init(0);
        ekf.set_height_source_flag(ControlStatus::BARO_HGT);
        ekf.control_status_prev = ekf.control_status;
        ekf.state.pos.z = -3.0;
        ekf.gps_alt_ref = 100.0;
        ekf.gps_sample_delayed = GpsSample {
            hgt: 104.0,
            ..Default::default()
        };
        ekf.gps_data_ready = true;

        ekf.control_height_fusion();

        assert!(ekf.control_status.contains(ControlStatus::GPS_HGT));
        assert_abs_diff_eq!(ekf.hgt_sensor_offset, 1.0);

        // The switch must not step the height
        let obs = ekf.height_observation().unwrap();
        assert_abs_diff_eq!(obs.meas, ekf.state.pos.z);
    }

    #[test]
    fn test_baro_offset_tracks_while_unused() {
        let mut ekf = baro_ekf();
        ekf.set_height_source_flag(ControlStatus::GPS_HGT);
        ekf.baro_hgt_offset = 0.0;
        ekf.baro_sample_delayed = BaroSample {
            hgt: 10.0,
            time_us: 100_000,
        };
        ekf.delta_time_baro_us = 100_000;
        ekf.baro_data_ready = true;

        ekf.update_baro_offset();

        // Rate limited to 0.1 m/s over 0.1 s
        assert_abs_diff_eq!(ekf.baro_hgt_offset, 0.01, epsilon = 1e-6);
    }

    #[test]
    fn test_baro_timeout_resets_to_gps() {
        let mut ekf = baro_ekf();
        ekf.time_last_imu = 20_000_000;
        ekf.time_good_vert_accel = ekf.time_last_imu;
        ekf.time_last_hgt_fuse = 10_000_000;
        ekf.gps_hgt_faulty = false;
        ekf.buffers
            .gps
            .push(GpsSample {
                hgt: 50.0,
                vacc: 1.0,
                time_us: 19_900_000,
                ..Default::default()
            })
            .unwrap();

        ekf.control_height_sensor_timeouts();

        assert!(ekf.control_status.contains(ControlStatus::GPS_HGT));
        assert!(ekf.baro_hgt_faulty);
        assert_eq!(ekf.time_last_hgt_fuse, ekf.time_last_imu);
    }

    #[test]
    fn test_ground_effect_times_out() {
        let mut ekf = baro_ekf();
        ekf.set_gnd_effect_flag(true);
        ekf.time_last_imu = GNDEFFECT_TIMEOUT_US + 1;

        ekf.check_ground_effect();

        assert!(!ekf.control_status.contains(ControlStatus::GND_EFFECT));
    }
}
