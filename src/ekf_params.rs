//! Builds the estimator tuning from the `ekf` section of the parameter tree.
//! Entries missing from the tree keep their default tuning.

use anyhow::{Context, Result, anyhow, bail};
use nalgebra::Vector3;
use nav_gnc::ekf::params::{
    DeclinationSource, FusionMode, GpsCheckMask, MagFuseType, Parameters, VdistSensor,
};

use crate::parameters::{self, Parameter, ParameterMap};

/// Path of the learned declination written back after a flight
pub const DECLINATION_PATH: &str = "ekf.mag.declination_deg";

struct Section<'a> {
    map: Option<&'a ParameterMap>,
}

impl<'a> Section<'a> {
    fn new(root: &'a ParameterMap, path: &str) -> Result<Self> {
        match root.get_map(path) {
            Ok(map) => Ok(Section { map: Some(map) }),
            Err(parameters::Error::NotFound { .. }) => Ok(Section { map: None }),
            Err(e) => Err(e.into()),
        }
    }

    fn param(&self, key: &str) -> Result<Option<&'a Parameter>> {
        let Some(map) = self.map else {
            return Ok(None);
        };

        match map.get_param(key) {
            Ok(p) => Ok(Some(p)),
            Err(parameters::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn f32(&self, key: &str, default: f32) -> Result<f32> {
        Ok(match self.param(key)? {
            Some(p) => p.value_float()? as f32,
            None => default,
        })
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(match self.param(key)? {
            Some(p) => p.value_bool()?,
            None => default,
        })
    }

    fn int<T: TryFrom<i64>>(&self, key: &str, default: T) -> Result<T> {
        match self.param(key)? {
            Some(p) => {
                let val = p.value_int()?;
                T::try_from(val).map_err(|_| anyhow!("Parameter '{}' out of range: {}", p.path(), val))
            }
            None => Ok(default),
        }
    }

    fn vec3(&self, key: &str, default: Vector3<f32>) -> Result<Vector3<f32>> {
        match self.param(key)? {
            Some(p) => {
                let arr = p.value_float_arr()?;
                if arr.len() != 3 {
                    bail!("Parameter '{}' must have 3 elements, has {}", p.path(), arr.len());
                }
                Ok(Vector3::new(arr[0] as f32, arr[1] as f32, arr[2] as f32))
            }
            None => Ok(default),
        }
    }

    fn mask<F>(&self, key: &str, default: F, from_bits: impl Fn(u32) -> Option<F>) -> Result<F> {
        match self.param(key)? {
            Some(p) => {
                let val = p.value_int()?;
                u32::try_from(val)
                    .ok()
                    .and_then(from_bits)
                    .ok_or_else(|| anyhow!("Parameter '{}' has unknown bits: {}", p.path(), val))
            }
            None => Ok(default),
        }
    }
}

pub fn load_parameters(root: &ParameterMap) -> Result<Parameters> {
    let d = Parameters::default();

    let ekf = Section::new(root, "ekf")?;
    let delay = Section::new(root, "ekf.delay")?;
    let noise = Section::new(root, "ekf.noise")?;
    let init = Section::new(root, "ekf.init")?;
    let aid = Section::new(root, "ekf.aid")?;
    let mag = Section::new(root, "ekf.mag")?;
    let air = Section::new(root, "ekf.air")?;
    let rng = Section::new(root, "ekf.range")?;
    let flow = Section::new(root, "ekf.flow")?;
    let gps = Section::new(root, "ekf.gps")?;
    let body = Section::new(root, "ekf.body")?;
    let out = Section::new(root, "ekf.output")?;

    let vdist_sensor_type = VdistSensor::try_from(ekf.int("height_source", d.vdist_sensor_type as i64)?)
        .context("Loading ekf.height_source")?;
    let mag_fusion_type =
        MagFuseType::try_from(mag.int("fusion_type", d.mag_fusion_type as i64)?).context("Loading ekf.mag.fusion_type")?;

    Ok(Parameters {
        fusion_mode: ekf.mask("fusion_mode", d.fusion_mode, FusionMode::from_bits)?,
        vdist_sensor_type,
        sensor_interval_min_ms: ekf.int("sensor_interval_min_ms", d.sensor_interval_min_ms)?,
        filter_update_period_us: ekf.int("filter_update_period_us", d.filter_update_period_us)?,

        min_delay_ms: delay.f32("min_ms", d.min_delay_ms)?,
        mag_delay_ms: delay.f32("mag_ms", d.mag_delay_ms)?,
        baro_delay_ms: delay.f32("baro_ms", d.baro_delay_ms)?,
        gps_delay_ms: delay.f32("gps_ms", d.gps_delay_ms)?,
        airspeed_delay_ms: delay.f32("airspeed_ms", d.airspeed_delay_ms)?,
        flow_delay_ms: delay.f32("flow_ms", d.flow_delay_ms)?,
        range_delay_ms: delay.f32("range_ms", d.range_delay_ms)?,
        ev_delay_ms: delay.f32("ev_ms", d.ev_delay_ms)?,
        auxvel_delay_ms: delay.f32("auxvel_ms", d.auxvel_delay_ms)?,

        gyro_noise: noise.f32("gyro", d.gyro_noise)?,
        accel_noise: noise.f32("accel", d.accel_noise)?,
        gyro_bias_p_noise: noise.f32("gyro_bias_p", d.gyro_bias_p_noise)?,
        accel_bias_p_noise: noise.f32("accel_bias_p", d.accel_bias_p_noise)?,
        mage_p_noise: noise.f32("mag_earth_p", d.mage_p_noise)?,
        magb_p_noise: noise.f32("mag_body_p", d.magb_p_noise)?,
        wind_vel_p_noise: noise.f32("wind_vel_p", d.wind_vel_p_noise)?,
        terrain_p_noise: noise.f32("terrain_p", d.terrain_p_noise)?,
        terrain_gradient: noise.f32("terrain_gradient", d.terrain_gradient)?,

        switch_on_gyro_bias: init.f32("gyro_bias", d.switch_on_gyro_bias)?,
        switch_on_accel_bias: init.f32("accel_bias", d.switch_on_accel_bias)?,
        initial_tilt_err: init.f32("tilt_err", d.initial_tilt_err)?,
        initial_wind_uncertainty: init.f32("wind_uncertainty", d.initial_wind_uncertainty)?,

        gps_vel_noise: gps.f32("vel_noise", d.gps_vel_noise)?,
        gps_pos_noise: gps.f32("pos_noise", d.gps_pos_noise)?,
        pos_noaid_noise: aid.f32("pos_noaid_noise", d.pos_noaid_noise)?,
        baro_noise: aid.f32("baro_noise", d.baro_noise)?,
        baro_innov_gate: aid.f32("baro_innov_gate", d.baro_innov_gate)?,
        pos_ne_innov_gate: aid.f32("pos_ne_innov_gate", d.pos_ne_innov_gate)?,
        vel_innov_gate: aid.f32("vel_innov_gate", d.vel_innov_gate)?,
        gnd_effect_deadzone: aid.f32("gnd_effect_deadzone", d.gnd_effect_deadzone)?,
        gnd_effect_max_hgt: aid.f32("gnd_effect_max_hgt", d.gnd_effect_max_hgt)?,
        hgt_reset_lim: aid.f32("hgt_reset_lim", d.hgt_reset_lim)?,

        mag_heading_noise: mag.f32("heading_noise", d.mag_heading_noise)?,
        mag_noise: mag.f32("noise", d.mag_noise)?,
        mag_declination_deg: mag.f32("declination_deg", d.mag_declination_deg)?,
        heading_innov_gate: mag.f32("heading_innov_gate", d.heading_innov_gate)?,
        mag_innov_gate: mag.f32("innov_gate", d.mag_innov_gate)?,
        mag_declination_source: mag.mask("declination_source", d.mag_declination_source, DeclinationSource::from_bits)?,
        mag_fusion_type,
        mag_acc_gate: mag.f32("acc_gate", d.mag_acc_gate)?,
        mag_yaw_rate_gate: mag.f32("yaw_rate_gate", d.mag_yaw_rate_gate)?,

        tas_innov_gate: air.f32("tas_innov_gate", d.tas_innov_gate)?,
        eas_noise: air.f32("eas_noise", d.eas_noise)?,
        beta_innov_gate: air.f32("beta_innov_gate", d.beta_innov_gate)?,
        beta_noise: air.f32("beta_noise", d.beta_noise)?,
        beta_avg_ft_us: air.f32("beta_avg_ft_us", d.beta_avg_ft_us)?,
        drag_noise: air.f32("drag_noise", d.drag_noise)?,
        bcoef_x: air.f32("bcoef_x", d.bcoef_x)?,
        bcoef_y: air.f32("bcoef_y", d.bcoef_y)?,

        range_noise: rng.f32("noise", d.range_noise)?,
        range_innov_gate: rng.f32("innov_gate", d.range_innov_gate)?,
        rng_gnd_clearance: rng.f32("gnd_clearance", d.rng_gnd_clearance)?,
        rng_sens_pitch: rng.f32("sens_pitch", d.rng_sens_pitch)?,
        range_noise_scaler: rng.f32("noise_scaler", d.range_noise_scaler)?,
        vehicle_variance_scaler: rng.f32("vehicle_variance_scaler", d.vehicle_variance_scaler)?,
        max_hagl_for_range_aid: rng.f32("max_hagl_for_aid", d.max_hagl_for_range_aid)?,
        max_vel_for_range_aid: rng.f32("max_vel_for_aid", d.max_vel_for_range_aid)?,
        range_aid: rng.bool("aid", d.range_aid)?,
        range_aid_innov_gate: rng.f32("aid_innov_gate", d.range_aid_innov_gate)?,
        range_cos_max_tilt: rng.f32("cos_max_tilt", d.range_cos_max_tilt)?,

        ev_innov_gate: aid.f32("ev_innov_gate", d.ev_innov_gate)?,
        auxvel_noise: aid.f32("auxvel_noise", d.auxvel_noise)?,
        auxvel_gate: aid.f32("auxvel_gate", d.auxvel_gate)?,

        flow_noise: flow.f32("noise", d.flow_noise)?,
        flow_noise_qual_min: flow.f32("noise_qual_min", d.flow_noise_qual_min)?,
        flow_qual_min: flow.int("qual_min", d.flow_qual_min)?,
        flow_innov_gate: flow.f32("innov_gate", d.flow_innov_gate)?,

        gps_check_mask: gps.mask("check_mask", d.gps_check_mask, GpsCheckMask::from_bits)?,
        req_hacc: gps.f32("req_hacc", d.req_hacc)?,
        req_vacc: gps.f32("req_vacc", d.req_vacc)?,
        req_sacc: gps.f32("req_sacc", d.req_sacc)?,
        req_nsats: gps.int("req_nsats", d.req_nsats)?,
        req_gdop: gps.f32("req_gdop", d.req_gdop)?,
        req_hdrift: gps.f32("req_hdrift", d.req_hdrift)?,
        req_vdrift: gps.f32("req_vdrift", d.req_vdrift)?,
        no_gps_timeout_max: gps.int("no_gps_timeout_max_us", d.no_gps_timeout_max)?,

        imu_pos_body: body.vec3("imu", d.imu_pos_body)?,
        gps_pos_body: body.vec3("gps", d.gps_pos_body)?,
        rng_pos_body: body.vec3("range", d.rng_pos_body)?,
        flow_pos_body: body.vec3("flow", d.flow_pos_body)?,
        ev_pos_body: body.vec3("ev", d.ev_pos_body)?,

        vel_tau: out.f32("vel_tau", d.vel_tau)?,
        pos_tau: out.f32("pos_tau", d.pos_tau)?,

        acc_bias_lim: noise.f32("acc_bias_lim", d.acc_bias_lim)?,
        acc_bias_learn_acc_lim: noise.f32("acc_bias_learn_acc_lim", d.acc_bias_learn_acc_lim)?,
        acc_bias_learn_gyr_lim: noise.f32("acc_bias_learn_gyr_lim", d.acc_bias_learn_gyr_lim)?,
        acc_bias_learn_tc: noise.f32("acc_bias_learn_tc", d.acc_bias_learn_tc)?,

        no_aid_timeout_max: aid.int("no_aid_timeout_max_us", d.no_aid_timeout_max)?,
        valid_timeout_max: aid.int("valid_timeout_max_us", d.valid_timeout_max)?,

        vert_innov_test_lim: aid.f32("vert_innov_test_lim", d.vert_innov_test_lim)?,
        bad_acc_reset_delay_us: aid.int("bad_acc_reset_delay_us", d.bad_acc_reset_delay_us)?,

        is_moving_scaler: ekf.f32("is_moving_scaler", d.is_moving_scaler)?,
    })
}

/// Stores the declination learned by the estimator, if it has one worth keeping.
pub fn save_declination(root: &mut ParameterMap, declination_deg: Option<f32>) -> Result<bool> {
    match declination_deg {
        Some(decl) => {
            root.set_float(DECLINATION_PATH, decl as f64)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::parse_string;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_tree_gives_defaults() {
        let params = load_parameters(&ParameterMap::default()).unwrap();
        assert_eq!(params, Parameters::default());
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let root = parse_string(include_str!("../config/params.toml")).unwrap();
        assert_eq!(load_parameters(&root).unwrap(), Parameters::default());
    }

    #[test]
    fn test_overrides() {
        let toml = "
        [ekf]
        fusion_mode = { val = 9, type = \"int\" }
        height_source = { val = 2, type = \"int\" }

        [ekf.delay]
        gps_ms = { val = 200.0, type = \"float\" }

        [ekf.range]
        aid = { val = true, type = \"bool\" }

        [ekf.body]
        gps = { val = [0.1, 0.0, -0.2], type = \"float[]\" }
        ";
        let params = load_parameters(&parse_string(toml).unwrap()).unwrap();

        assert_eq!(params.fusion_mode, FusionMode::USE_GPS | FusionMode::USE_EVPOS);
        assert_eq!(params.vdist_sensor_type, VdistSensor::Range);
        assert_relative_eq!(params.gps_delay_ms, 200.0);
        assert!(params.range_aid);
        assert_relative_eq!(params.gps_pos_body, Vector3::new(0.1, 0.0, -0.2));
        assert_relative_eq!(params.baro_noise, Parameters::default().baro_noise);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let bad_type = parse_string("[ekf.delay]\ngps_ms = { val = 1, type = \"int\" }").unwrap();
        assert!(load_parameters(&bad_type).is_err());

        let bad_selector = parse_string("[ekf.mag]\nfusion_type = { val = 4, type = \"int\" }").unwrap();
        assert!(load_parameters(&bad_selector).is_err());

        let bad_range = parse_string("[ekf.gps]\nreq_nsats = { val = 300, type = \"int\" }").unwrap();
        assert!(load_parameters(&bad_range).is_err());

        let bad_mask = parse_string("[ekf]\nfusion_mode = { val = 128, type = \"int\" }").unwrap();
        assert!(load_parameters(&bad_mask).is_err());

        let bad_vec = parse_string("[ekf.body]\nimu = { val = [1.0], type = \"float[]\" }").unwrap();
        assert!(load_parameters(&bad_vec).is_err());
    }

    #[test]
    fn test_declination_write_back() {
        let mut root = ParameterMap::default();

        assert!(!save_declination(&mut root, None).unwrap());
        assert!(save_declination(&mut root, Some(3.5)).unwrap());

        let params = load_parameters(&root).unwrap();
        assert_relative_eq!(params.mag_declination_deg, 3.5);
    }
}
