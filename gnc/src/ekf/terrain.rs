//! Single state estimator of the terrain vertical position under the vehicle,
//! fused from the range finder.

use super::{
    Ekf,
    fusion::test_ratio,
    states::POS,
    status::{ControlStatus, InnovationFaultStatus},
};
use crate::common::math::sq;

/// Range data older than this cannot initialise the terrain (us)
const HAGL_INIT_MAX_AGE_US: u64 = 200_000;
/// Persistent rejection for this long resets the terrain to the measurement (us)
const HAGL_REJECT_RESET_US: u64 = 10_000_000;
/// Terrain stays valid this long after the last fusion (us)
const HAGL_VALID_TIMEOUT_US: u64 = 5_000_000;
const RANGE_CONTINUITY_LIMIT_US: f32 = 2e6;

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct TerrainEstimator {
    /// Terrain vertical position, positive down (m)
    vpos: f32,
    var: f32,
    initialised: bool,
    valid: bool,
    time_last_fuse: u64,
    dt_last_range_filt_us: f32,
    range_continuous: bool,
}

/// Outcome of one range finder update of the terrain state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct HaglFusion {
    pub innov: f32,
    pub innov_var: f32,
    pub test_ratio: f32,
    pub rejected: bool,
}

impl TerrainEstimator {
    pub fn vpos(&self) -> f32 {
        self.vpos
    }

    pub fn var(&self) -> f32 {
        self.var
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set(&mut self, vpos: f32, var: f32) {
        self.vpos = vpos;
        self.var = var;
        self.initialised = true;
    }

    /// Moves the terrain with a shift of the vertical datum.
    pub fn shift(&mut self, delta_d: f32) {
        self.vpos += delta_d;
    }

    /// Low pass filters the age of the range data to decide whether it
    /// arrives continuously.
    pub fn update_continuity(&mut self, dt: f32, range_age_us: u64) {
        let alpha = 0.5 * dt;
        self.dt_last_range_filt_us =
            (self.dt_last_range_filt_us * (1.0 - alpha) + alpha * range_age_us as f32).min(4e6);
        self.range_continuous = self.dt_last_range_filt_us < RANGE_CONTINUITY_LIMIT_US;
    }

    /// Grows the uncertainty for vehicle height errors and terrain gradient
    /// at the given horizontal speed.
    pub fn predict(&mut self, dt: f32, p_noise: f32, gradient: f32, speed_sq: f32) {
        self.var += sq(dt * p_noise) + sq(dt * gradient) * speed_sq;
        self.var = self.var.clamp(0.0, 1e4);
    }

    /// Fuses a height above ground measurement. `obs_var` includes the
    /// vehicle height uncertainty.
    pub fn fuse(&mut self, meas_hagl: f32, pos_d: f32, obs_var: f32, gate: f32, now_us: u64) -> HaglFusion {
        // Measurement minus prediction
        let innov = meas_hagl - (self.vpos - pos_d);
        let innov_var = (self.var + obs_var).max(obs_var);
        let ratio = test_ratio(innov, innov_var, gate.max(1.0));

        let rejected = if ratio <= 1.0 {
            let gain = self.var / innov_var;
            self.vpos += gain * innov;
            self.var = (self.var * (1.0 - gain)).max(0.0);
            self.time_last_fuse = now_us;
            false
        } else if now_us.saturating_sub(self.time_last_fuse) > HAGL_REJECT_RESET_US {
            self.vpos = pos_d + meas_hagl;
            self.var = obs_var;
            false
        } else {
            true
        };

        HaglFusion {
            innov,
            innov_var,
            test_ratio: ratio,
            rejected,
        }
    }

    /// Keeps the terrain at least `clearance` below the vehicle.
    pub fn constrain_below(&mut self, pos_d: f32, clearance: f32) {
        if self.vpos - pos_d < clearance {
            self.vpos = pos_d + clearance;
        }
    }

    pub fn update_validity(&mut self, rng_stuck: bool, now_us: u64) {
        self.valid = self.initialised
            && self.range_continuous
            && !rng_stuck
            && now_us.saturating_sub(self.time_last_fuse) < HAGL_VALID_TIMEOUT_US;
    }
}

impl Ekf {
    /// Initialises the terrain from a fresh range reading, or from the ground
    /// clearance while on ground.
    fn init_hagl(&mut self) -> bool {
        let fresh_range = self
            .buffers
            .range
            .last_pushed()
            .filter(|r| self.time_last_imu.saturating_sub(r.time_us) < HAGL_INIT_MAX_AGE_US)
            .map(|r| r.rng);

        match fresh_range {
            Some(rng) if self.r_rng_to_earth_2_2 > self.params.range_cos_max_tilt => {
                self.terrain
                    .set(self.state.pos.z + rng * self.r_rng_to_earth_2_2, sq(self.params.range_noise));
                true
            }
            _ if !self.control_status.contains(ControlStatus::IN_AIR) => {
                let clearance = self.params.rng_gnd_clearance;
                self.terrain.set(self.state.pos.z + clearance, sq(clearance));
                true
            }
            _ => false,
        }
    }

    pub(super) fn run_terrain_estimator(&mut self) {
        let dt = self.imu_sample_delayed.delta_vel_dt;
        let range_age_us = self
            .imu_sample_delayed
            .time_us
            .saturating_sub(self.range_sample_delayed.time_us);
        self.terrain.update_continuity(dt, range_age_us);

        if !self.terrain.is_initialised() {
            self.init_hagl();
        } else {
            self.terrain.predict(
                dt,
                self.params.terrain_p_noise,
                self.params.terrain_gradient,
                self.state.vel.xy().norm_squared(),
            );

            if self.range_data_ready && !self.control_status.contains(ControlStatus::RNG_STUCK) {
                self.fuse_hagl();
            }

            self.terrain
                .constrain_below(self.state.pos.z, self.params.rng_gnd_clearance);
        }

        self.terrain.update_validity(
            self.control_status.contains(ControlStatus::RNG_STUCK),
            self.time_last_imu,
        );
    }

    fn fuse_hagl(&mut self) {
        if self.r_rng_to_earth_2_2 <= self.params.range_cos_max_tilt {
            self.innov_check_fail_status.insert(InnovationFaultStatus::REJECT_HAGL);
            return;
        }

        let rng = self.range_sample_delayed.rng;
        let meas_hagl = rng * self.r_rng_to_earth_2_2;
        let obs_var = (self.p[(POS + 2, POS + 2)] * self.params.vehicle_variance_scaler)
            .max(0.0)
            + sq(self.params.range_noise)
            + sq(self.params.range_noise_scaler * rng);

        let result = self.terrain.fuse(
            meas_hagl,
            self.state.pos.z,
            obs_var,
            self.params.range_innov_gate,
            self.time_last_imu,
        );

        self.innov.hagl = result.innov;
        self.innov.hagl_var = result.innov_var;
        self.innov.hagl_test_ratio = result.test_ratio;
        self.innov_check_fail_status
            .set(InnovationFaultStatus::REJECT_HAGL, result.rejected);
    }

    pub fn get_terrain_valid(&self) -> bool {
        self.terrain.is_valid()
    }

    /// Terrain vertical position in the local frame, positive down (m).
    pub fn get_terrain_vert_pos(&self) -> f32 {
        self.terrain.vpos()
    }

    /// Height of the body above the terrain (m).
    pub fn get_hagl(&self) -> f32 {
        self.terrain.vpos() - self.state.pos.z
    }

    pub(super) fn terrain_variance(&self) -> f32 {
        self.terrain.var()
    }
}
