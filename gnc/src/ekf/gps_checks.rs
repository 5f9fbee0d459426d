//! GPS quality gate and collection of the local origin.

use defmt_or_log::info;
use nalgebra::{Vector2, Vector3};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use super::{
    Ekf,
    params::{DeclinationSource, GpsCheckMask, Parameters, VdistSensor},
    status::{ControlStatus, GpsCheckFailStatus},
};
use crate::{common::geo::MapProjection, datatypes::sensors::GpsMessage};

/// Filtered drift rates used by the on ground GPS checks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsDriftMetrics {
    /// Horizontal position drift rate (m/s)
    pub hdrift: f32,
    /// Vertical position drift rate (m/s)
    pub vdrift: f32,
    /// Filtered horizontal speed (m/s)
    pub hspeed: f32,
    /// Whether the metrics were refreshed by the last check
    pub updated: bool,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct GpsChecks {
    fail_status: GpsCheckFailStatus,
    drift: GpsDriftMetrics,
    pos_prev: MapProjection,
    alt_prev: f32,
    time_usec_prev: Option<u64>,
    pos_deriv_filt: Vector3<f32>,
    vel_ne_filt: Vector2<f32>,
    vel_d_diff_filt: f32,
    last_fail_us: Option<u64>,
    last_pass_us: u64,
    failing: bool,
    error_norm: f32,
}

impl Default for GpsChecks {
    fn default() -> Self {
        Self {
            fail_status: GpsCheckFailStatus::empty(),
            drift: GpsDriftMetrics::default(),
            pos_prev: MapProjection::default(),
            alt_prev: 0.0,
            time_usec_prev: None,
            pos_deriv_filt: Vector3::zeros(),
            vel_ne_filt: Vector2::zeros(),
            vel_d_diff_filt: 0.0,
            last_fail_us: None,
            last_pass_us: 0,
            failing: true,
            error_norm: 0.0,
        }
    }
}

impl GpsChecks {
    pub fn fail_status(&self) -> GpsCheckFailStatus {
        self.fail_status
    }

    pub fn drift_metrics(&self) -> GpsDriftMetrics {
        self.drift
    }

    pub fn last_fail_us(&self) -> u64 {
        self.last_fail_us.unwrap_or(0)
    }

    pub fn last_pass_us(&self) -> u64 {
        self.last_pass_us
    }

    /// Whether an enabled check failed on the last solution.
    pub fn is_failing(&self) -> bool {
        self.failing
    }

    /// Largest of the reported accuracies relative to their requirement.
    pub fn error_norm(&self) -> f32 {
        self.error_norm
    }

    /// Runs every quality check on one receiver solution. Returns true once
    /// the enabled checks have passed continuously for `min_health_time_us`.
    ///
    /// The drift filters only advance on a new solution, so checking the same
    /// message again gives the same outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &mut self,
        gps: &GpsMessage,
        params: &Parameters,
        now_us: u64,
        in_air: bool,
        state_vel_d: f32,
        min_health_time_us: u64,
    ) -> bool {
        let mut fail = GpsCheckFailStatus::empty();
        fail.set(GpsCheckFailStatus::FIX, gps.fix_type < 3);
        fail.set(GpsCheckFailStatus::NSATS, gps.nsats < params.req_nsats);
        fail.set(GpsCheckFailStatus::GDOP, gps.gdop > params.req_gdop);
        fail.set(GpsCheckFailStatus::HACC, gps.eph > params.req_hacc);
        fail.set(GpsCheckFailStatus::VACC, gps.epv > params.req_vacc);
        fail.set(GpsCheckFailStatus::SACC, gps.sacc > params.req_sacc);

        self.error_norm = (gps.eph / params.req_hacc)
            .max(gps.epv / params.req_vacc)
            .max(gps.sacc / params.req_sacc);

        let lat_deg = gps.lat as f64 * 1e-7;
        let lon_deg = gps.lon as f64 * 1e-7;
        let alt = gps.alt as f32 * 1e-3;
        let is_new = self.time_usec_prev != Some(gps.time_usec);

        if is_new {
            if in_air {
                // Drift is only meaningful while stationary
                self.drift = GpsDriftMetrics::default();
                self.pos_deriv_filt = Vector3::zeros();
                self.vel_ne_filt = Vector2::zeros();
                self.vel_d_diff_filt = 0.0;
            } else {
                self.update_drift(gps, params, lat_deg, lon_deg, alt, now_us, state_vel_d);
            }

            self.pos_prev = MapProjection::new(lat_deg, lon_deg, now_us);
            self.alt_prev = alt;
            self.time_usec_prev = Some(gps.time_usec);
        }

        if !in_air {
            fail.set(GpsCheckFailStatus::HDRIFT, self.drift.hdrift > params.req_hdrift);
            fail.set(GpsCheckFailStatus::VDRIFT, self.drift.vdrift > params.req_vdrift);
            fail.set(GpsCheckFailStatus::HSPEED, self.drift.hspeed > params.req_hdrift);
            fail.set(GpsCheckFailStatus::VSPEED, self.vel_d_diff_filt.abs() > params.req_vdrift);
        }

        self.fail_status = fail;

        // Assume failed the first time through
        if self.last_fail_us.is_none() {
            self.last_fail_us = Some(now_us);
        }

        let mask = params.gps_check_mask;
        let failed = fail.contains(GpsCheckFailStatus::FIX)
            || (fail.contains(GpsCheckFailStatus::NSATS) && mask.contains(GpsCheckMask::NSATS))
            || (fail.contains(GpsCheckFailStatus::GDOP) && mask.contains(GpsCheckMask::GDOP))
            || (fail.contains(GpsCheckFailStatus::HACC) && mask.contains(GpsCheckMask::HACC))
            || (fail.contains(GpsCheckFailStatus::VACC) && mask.contains(GpsCheckMask::VACC))
            || (fail.contains(GpsCheckFailStatus::SACC) && mask.contains(GpsCheckMask::SACC))
            || (fail.contains(GpsCheckFailStatus::HDRIFT) && mask.contains(GpsCheckMask::HDRIFT))
            || (fail.contains(GpsCheckFailStatus::VDRIFT) && mask.contains(GpsCheckMask::VDRIFT))
            || (fail.contains(GpsCheckFailStatus::HSPEED) && mask.contains(GpsCheckMask::HSPD))
            || (fail.contains(GpsCheckFailStatus::VSPEED) && mask.contains(GpsCheckMask::VSPD));

        self.failing = failed;
        if failed {
            self.last_fail_us = Some(now_us);
        } else {
            self.last_pass_us = now_us;
        }

        now_us.saturating_sub(self.last_fail_us.unwrap_or(now_us)) > min_health_time_us
    }

    #[allow(clippy::too_many_arguments)]
    fn update_drift(
        &mut self,
        gps: &GpsMessage,
        params: &Parameters,
        lat_deg: f64,
        lon_deg: f64,
        alt: f32,
        now_us: u64,
        state_vel_d: f32,
    ) {
        let (delta_n, delta_e, delta_alt) = if self.pos_prev.is_initialized() {
            let (n, e) = self.pos_prev.project(lat_deg, lon_deg);
            (n as f32, e as f32, self.alt_prev - alt)
        } else {
            (0.0, 0.0, 0.0)
        };

        let dt = (now_us.saturating_sub(self.pos_prev.timestamp_us()) as f32 * 1e-6).clamp(0.001, 10.0);
        let filter_coef = dt / 10.0;

        let vel_limit = Vector3::new(params.req_hdrift, params.req_hdrift, params.req_vdrift) * 10.0;
        let pos_derived = Vector3::new(delta_n, delta_e, delta_alt) / dt;
        let pos_derived = pos_derived.zip_map(&vel_limit, |v, lim| v.clamp(-lim, lim));

        self.pos_deriv_filt = pos_derived * filter_coef + self.pos_deriv_filt * (1.0 - filter_coef);
        self.drift.hdrift = self.pos_deriv_filt.xy().norm();
        self.drift.vdrift = self.pos_deriv_filt.z.abs();

        let hspeed_lim = 10.0 * params.req_hdrift;
        let vel_ne = gps.vel_ned.xy().map(|v| v.clamp(-hspeed_lim, hspeed_lim));
        self.vel_ne_filt = vel_ne * filter_coef + self.vel_ne_filt * (1.0 - filter_coef);
        self.drift.hspeed = self.vel_ne_filt.norm();

        let vz_lim = 10.0 * params.req_vdrift;
        let vel_d_diff = (gps.vel_ned.z - state_vel_d).clamp(-vz_lim, vz_lim);
        self.vel_d_diff_filt = vel_d_diff * filter_coef + self.vel_d_diff_filt * (1.0 - filter_coef);

        self.drift.updated = true;
    }
}

impl Ekf {
    /// Checks a GPS solution and sets the local origin from the first good
    /// one. Returns true when the sample can be projected into the local
    /// frame.
    pub(super) fn collect_gps(&mut self, gps: &GpsMessage) -> bool {
        let in_air = self.control_status.contains(ControlStatus::IN_AIR);
        let gps_checks_passed = self.gps_checks.check(
            gps,
            &self.params,
            self.time_last_imu,
            in_air,
            self.state.vel.z,
            self.host.min_gps_health_time_us,
        );

        if !self.ned_origin_initialised && gps_checks_passed {
            let lat_deg = gps.lat as f64 * 1e-7;
            let lon_deg = gps.lon as f64 * 1e-7;
            self.pos_ref = MapProjection::new(lat_deg, lon_deg, self.time_last_imu);

            // Correct for the distance travelled since navigation started
            if self
                .control_status
                .intersects(ControlStatus::OPT_FLOW | ControlStatus::GPS | ControlStatus::EV_POS)
            {
                let (lat, lon) = self
                    .pos_ref
                    .reproject(-self.state.pos.x as f64, -self.state.pos.y as f64);
                self.pos_ref = MapProjection::new(lat, lon, self.time_last_imu);
            }

            self.gps_alt_ref = gps.alt as f32 * 1e-3 + self.state.pos.z;
            self.ned_origin_initialised = true;
            self.last_gps_origin_time_us = self.time_last_imu;
            self.gps_origin_eph = gps.eph;
            self.gps_origin_epv = gps.epv;

            if let Some(decl) = self.host.geo_declination_deg {
                self.mag_declination_gps = decl.to_radians();
            }

            if self.primary_hgt_source == VdistSensor::Gps {
                self.control_status.remove(ControlStatus::HEIGHT_SOURCES);
                self.control_status.insert(ControlStatus::GPS_HGT);
                self.hgt_sensor_offset = 0.0;
            }

            info!("EKF GPS checks passed, WGS-84 origin set");
        }

        self.ned_origin_initialised && gps.fix_type >= 3
    }

    /// Latitude (deg), longitude (deg) and altitude (m) of the local origin.
    pub fn get_ekf_global_origin(&self) -> Option<(f64, f64, f32)> {
        self.ned_origin_initialised
            .then(|| (self.pos_ref.lat_deg(), self.pos_ref.lon_deg(), self.gps_alt_ref))
    }

    /// Moves the local origin. Position states, the output history and the
    /// height offsets are shifted so that the estimate keeps describing the
    /// same physical location.
    pub fn set_ekf_global_origin(&mut self, lat_deg: f64, lon_deg: f64, alt_m: f32) -> bool {
        let valid = lat_deg.is_finite()
            && lat_deg.abs() <= 90.0
            && lon_deg.is_finite()
            && lon_deg.abs() <= 180.0
            && alt_m.is_finite()
            && alt_m > -12_000.0
            && alt_m < 100_000.0;

        if !valid {
            return false;
        }

        let old_ref = self.pos_ref;
        let had_origin = self.ned_origin_initialised;
        let current_alt = -self.state.pos.z + self.gps_alt_ref;

        let current_pos = (had_origin && self.is_horizontal_aiding_active())
            .then(|| old_ref.reproject(self.state.pos.x as f64, self.state.pos.y as f64));

        self.pos_ref = MapProjection::new(lat_deg, lon_deg, self.imu_sample_delayed.time_us);
        self.gps_alt_ref = alt_m;
        self.ned_origin_initialised = true;

        if had_origin {
            // Buffered samples were projected with the previous origin
            let new_ref = self.pos_ref;
            for s in self.buffers.gps.iter_mut() {
                let (lat, lon) = old_ref.reproject(s.pos.x as f64, s.pos.y as f64);
                let (n, e) = new_ref.project(lat, lon);
                s.pos = Vector2::new(n as f32, e as f32);
            }
        }

        if let Some((lat, lon)) = current_pos {
            let (n, e) = self.pos_ref.project(lat, lon);
            self.reset_horizontal_position_to(&Vector2::new(n as f32, e as f32));
        }

        if had_origin {
            let delta_d = self.gps_alt_ref - current_alt - self.state.pos.z;
            if delta_d.abs() > 0.0 {
                self.reset_vertical_position_to(self.gps_alt_ref - current_alt);
                self.shift_height_references(delta_d);
            }
        }

        if self
            .params
            .mag_declination_source
            .contains(DeclinationSource::USE_GEO_DECL)
        {
            if let Some(decl) = self.host.geo_declination_deg {
                self.mag_declination_gps = decl.to_radians();
            }
        }

        true
    }

    pub fn gps_drift_metrics(&self) -> GpsDriftMetrics {
        self.gps_checks.drift_metrics()
    }
}
