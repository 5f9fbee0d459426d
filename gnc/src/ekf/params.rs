//! Estimator tuning and source selection.

use bitflags::bitflags;
use nalgebra::Vector3;
use thiserror::Error;

/// Maximum interval between GPS measurements before data is considered stale (us)
pub const GPS_MAX_INTERVAL_US: u64 = 500_000;
/// Maximum interval between baro measurements (us)
pub const BARO_MAX_INTERVAL_US: u64 = 200_000;
/// Maximum interval between range finder measurements (us)
pub const RNG_MAX_INTERVAL_US: u64 = 200_000;
/// Maximum interval between external vision measurements (us)
pub const EV_MAX_INTERVAL_US: u64 = 200_000;

/// Time accel data declared bad must continuously pass checks to be good again (us)
pub const BADACC_PROBATION_US: u64 = 10_000_000;
/// Delta velocity process noise used while accel data is declared bad (m/s^2)
pub const BADACC_BIAS_PNOISE: f32 = 4.9;

/// Maximum time ground effect protection stays active after it was last requested (us)
pub const GNDEFFECT_TIMEOUT_US: u64 = 10_000_000;

bitflags! {
    /// Aiding sources and behaviours enabled by the user.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FusionMode: u32 {
        const USE_GPS = 1 << 0;
        const USE_OF = 1 << 1;
        const INHIBIT_ACC_BIAS = 1 << 2;
        const USE_EVPOS = 1 << 3;
        const USE_EVYAW = 1 << 4;
        const USE_DRAG = 1 << 5;
        /// Vision observations are not in NED and must be rotated first
        const ROTATE_EV = 1 << 6;
        const USE_EVVEL = 1 << 8;
    }

    /// Handling of the magnetic declination.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DeclinationSource: u32 {
        /// Use the host supplied geo declination once the origin is set
        const USE_GEO_DECL = 1 << 0;
        /// Report the geo declination for storage
        const SAVE_GEO_DECL = 1 << 1;
        /// Always fuse declination when 3-axis fusion runs
        const FUSE_DECL = 1 << 2;
    }

    /// GPS quality checks that gate the use of GPS.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct GpsCheckMask: u32 {
        const NSATS = 1 << 0;
        const GDOP = 1 << 1;
        const HACC = 1 << 2;
        const VACC = 1 << 3;
        const SACC = 1 << 4;
        const HDRIFT = 1 << 5;
        const VDRIFT = 1 << 6;
        const HSPD = 1 << 7;
        const VSPD = 1 << 8;
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorError {
    #[error("{value} is not a valid height source")]
    BadHeightSource { value: i64 },

    #[error("{value} is not a valid magnetometer fusion type")]
    BadMagFusionType { value: i64 },
}

/// Primary height source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdistSensor {
    #[default]
    Baro = 0,
    Gps = 1,
    Range = 2,
    ExtVision = 3,
}

impl TryFrom<i64> for VdistSensor {
    type Error = SelectorError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Baro),
            1 => Ok(Self::Gps),
            2 => Ok(Self::Range),
            3 => Ok(Self::ExtVision),
            value => Err(SelectorError::BadHeightSource { value }),
        }
    }
}

/// Magnetometer fusion method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MagFuseType {
    /// Heading or 3-axis fusion selected from the manoeuvre level
    #[default]
    Auto = 0,
    /// Yaw angle fusion only
    Heading = 1,
    /// 3-axis field fusion only
    Mag3D = 2,
    /// As `Auto`, but a fixed wing vehicle only corrects the field states
    AutoFw = 3,
    /// No magnetometer fusion
    None = 5,
}

impl TryFrom<i64> for MagFuseType {
    type Error = SelectorError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Auto),
            1 => Ok(Self::Heading),
            2 => Ok(Self::Mag3D),
            3 => Ok(Self::AutoFw),
            5 => Ok(Self::None),
            value => Err(SelectorError::BadMagFusionType { value }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Parameters {
    // Measurement source control
    pub fusion_mode: FusionMode,
    pub vdist_sensor_type: VdistSensor,
    /// Minimum arrival interval of non IMU sensors, sizes the observation buffers (ms)
    pub sensor_interval_min_ms: u32,
    /// Period of the down-sampled IMU data driving the filter (us)
    pub filter_update_period_us: u32,

    // Measurement delays relative to the IMU (ms)
    pub min_delay_ms: f32,
    pub mag_delay_ms: f32,
    pub baro_delay_ms: f32,
    pub gps_delay_ms: f32,
    pub airspeed_delay_ms: f32,
    pub flow_delay_ms: f32,
    pub range_delay_ms: f32,
    pub ev_delay_ms: f32,
    pub auxvel_delay_ms: f32,

    // Input noise
    /// Rate gyro noise (rad/s)
    pub gyro_noise: f32,
    /// Accelerometer noise (m/s^2)
    pub accel_noise: f32,

    // Process noise
    /// Gyro bias random walk (rad/s^2)
    pub gyro_bias_p_noise: f32,
    /// Accelerometer bias random walk (m/s^3)
    pub accel_bias_p_noise: f32,
    /// Earth field random walk (Gauss/s)
    pub mage_p_noise: f32,
    /// Body field random walk (Gauss/s)
    pub magb_p_noise: f32,
    /// Wind velocity random walk (m/s^2)
    pub wind_vel_p_noise: f32,
    /// Terrain height random walk (m/s)
    pub terrain_p_noise: f32,
    /// Terrain gradient used to scale terrain process noise with ground speed (m/m)
    pub terrain_gradient: f32,

    // Initialisation errors
    pub switch_on_gyro_bias: f32,
    pub switch_on_accel_bias: f32,
    pub initial_tilt_err: f32,
    pub initial_wind_uncertainty: f32,

    // Position and velocity fusion
    pub gps_vel_noise: f32,
    pub gps_pos_noise: f32,
    pub pos_noaid_noise: f32,
    pub baro_noise: f32,
    pub baro_innov_gate: f32,
    pub pos_ne_innov_gate: f32,
    pub vel_innov_gate: f32,
    pub gnd_effect_deadzone: f32,
    pub gnd_effect_max_hgt: f32,
    /// Position D variance above which a height timeout triggers a reset (m)
    pub hgt_reset_lim: f32,

    // Magnetometer fusion
    pub mag_heading_noise: f32,
    pub mag_noise: f32,
    pub mag_declination_deg: f32,
    pub heading_innov_gate: f32,
    pub mag_innov_gate: f32,
    pub mag_declination_source: DeclinationSource,
    pub mag_fusion_type: MagFuseType,
    pub mag_acc_gate: f32,
    pub mag_yaw_rate_gate: f32,

    // Airspeed fusion
    pub tas_innov_gate: f32,
    pub eas_noise: f32,

    // Synthetic sideslip fusion
    pub beta_innov_gate: f32,
    pub beta_noise: f32,
    /// Average time between synthetic sideslip measurements (us)
    pub beta_avg_ft_us: f32,

    // Range finder fusion
    pub range_noise: f32,
    pub range_innov_gate: f32,
    pub rng_gnd_clearance: f32,
    pub rng_sens_pitch: f32,
    pub range_noise_scaler: f32,
    pub vehicle_variance_scaler: f32,
    pub max_hagl_for_range_aid: f32,
    pub max_vel_for_range_aid: f32,
    pub range_aid: bool,
    pub range_aid_innov_gate: f32,
    pub range_cos_max_tilt: f32,

    // Vision fusion
    pub ev_innov_gate: f32,

    // Optical flow fusion
    pub flow_noise: f32,
    pub flow_noise_qual_min: f32,
    pub flow_qual_min: u8,
    pub flow_innov_gate: f32,

    // GPS quality checks
    pub gps_check_mask: GpsCheckMask,
    pub req_hacc: f32,
    pub req_vacc: f32,
    pub req_sacc: f32,
    pub req_nsats: u8,
    pub req_gdop: f32,
    pub req_hdrift: f32,
    pub req_vdrift: f32,

    // Sensor positions in body frame (m)
    pub imu_pos_body: Vector3<f32>,
    pub gps_pos_body: Vector3<f32>,
    pub rng_pos_body: Vector3<f32>,
    pub flow_pos_body: Vector3<f32>,
    pub ev_pos_body: Vector3<f32>,

    // Output complementary filter
    pub vel_tau: f32,
    pub pos_tau: f32,

    // Accel bias learning
    pub acc_bias_lim: f32,
    pub acc_bias_learn_acc_lim: f32,
    pub acc_bias_learn_gyr_lim: f32,
    pub acc_bias_learn_tc: f32,

    /// Horizontal dead reckoning allowed before resetting to GPS (us)
    pub no_gps_timeout_max: u64,
    /// Time without horizontal aiding after which dead reckoning is reported (us)
    pub no_aid_timeout_max: u64,
    /// Dead reckoning time after which the horizontal solution is reported invalid (us)
    pub valid_timeout_max: u64,

    // Multirotor drag fusion
    pub drag_noise: f32,
    pub bcoef_x: f32,
    pub bcoef_y: f32,

    // Accel error detection
    pub vert_innov_test_lim: f32,
    pub bad_acc_reset_delay_us: u64,

    // Auxiliary velocity fusion
    pub auxvel_noise: f32,
    pub auxvel_gate: f32,

    pub is_moving_scaler: f32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            fusion_mode: FusionMode::USE_GPS,
            vdist_sensor_type: VdistSensor::Baro,
            sensor_interval_min_ms: 20,
            filter_update_period_us: 10_000,

            min_delay_ms: 0.0,
            mag_delay_ms: 0.0,
            baro_delay_ms: 0.0,
            gps_delay_ms: 110.0,
            airspeed_delay_ms: 100.0,
            flow_delay_ms: 5.0,
            range_delay_ms: 5.0,
            ev_delay_ms: 100.0,
            auxvel_delay_ms: 0.0,

            gyro_noise: 1.5e-2,
            accel_noise: 3.5e-1,

            gyro_bias_p_noise: 1.0e-3,
            accel_bias_p_noise: 6.0e-3,
            mage_p_noise: 1.0e-3,
            magb_p_noise: 1.0e-4,
            wind_vel_p_noise: 1.0e-1,
            terrain_p_noise: 5.0,
            terrain_gradient: 0.5,

            switch_on_gyro_bias: 0.1,
            switch_on_accel_bias: 0.2,
            initial_tilt_err: 0.1,
            initial_wind_uncertainty: 1.0,

            gps_vel_noise: 5.0e-1,
            gps_pos_noise: 0.5,
            pos_noaid_noise: 10.0,
            baro_noise: 2.0,
            baro_innov_gate: 5.0,
            pos_ne_innov_gate: 5.0,
            vel_innov_gate: 5.0,
            gnd_effect_deadzone: 5.0,
            gnd_effect_max_hgt: 0.5,
            hgt_reset_lim: 0.0,

            mag_heading_noise: 3.0e-1,
            mag_noise: 5.0e-2,
            mag_declination_deg: 0.0,
            heading_innov_gate: 2.6,
            mag_innov_gate: 3.0,
            mag_declination_source: DeclinationSource::all(),
            mag_fusion_type: MagFuseType::Auto,
            mag_acc_gate: 0.5,
            mag_yaw_rate_gate: 0.25,

            tas_innov_gate: 5.0,
            eas_noise: 1.4,

            beta_innov_gate: 5.0,
            beta_noise: 0.3,
            beta_avg_ft_us: 150_000.0,

            range_noise: 0.1,
            range_innov_gate: 5.0,
            rng_gnd_clearance: 0.1,
            rng_sens_pitch: 0.0,
            range_noise_scaler: 0.0,
            vehicle_variance_scaler: 0.0,
            max_hagl_for_range_aid: 5.0,
            max_vel_for_range_aid: 1.0,
            range_aid: false,
            range_aid_innov_gate: 1.0,
            range_cos_max_tilt: 0.7071,

            ev_innov_gate: 5.0,

            flow_noise: 0.15,
            flow_noise_qual_min: 0.5,
            flow_qual_min: 1,
            flow_innov_gate: 3.0,

            gps_check_mask: GpsCheckMask::NSATS | GpsCheckMask::HACC | GpsCheckMask::SACC,
            req_hacc: 5.0,
            req_vacc: 8.0,
            req_sacc: 1.0,
            req_nsats: 6,
            req_gdop: 2.0,
            req_hdrift: 0.3,
            req_vdrift: 0.5,

            imu_pos_body: Vector3::zeros(),
            gps_pos_body: Vector3::zeros(),
            rng_pos_body: Vector3::zeros(),
            flow_pos_body: Vector3::zeros(),
            ev_pos_body: Vector3::zeros(),

            vel_tau: 0.25,
            pos_tau: 0.25,

            acc_bias_lim: 0.4,
            acc_bias_learn_acc_lim: 25.0,
            acc_bias_learn_gyr_lim: 3.0,
            acc_bias_learn_tc: 0.5,

            no_gps_timeout_max: 7_000_000,
            no_aid_timeout_max: 1_000_000,
            valid_timeout_max: 5_000_000,

            drag_noise: 2.5,
            bcoef_x: 25.0,
            bcoef_y: 25.0,

            vert_innov_test_lim: 4.5,
            bad_acc_reset_delay_us: 500_000,

            auxvel_noise: 0.5,
            auxvel_gate: 5.0,

            is_moving_scaler: 1.0,
        }
    }
}

impl Parameters {
    /// Largest configured sensor delay, used to size the sample buffers (ms).
    pub fn max_delay_ms(&self) -> f32 {
        let mut max_delay = self.min_delay_ms.max(self.mag_delay_ms).max(self.baro_delay_ms);

        if self.fusion_mode.contains(FusionMode::USE_GPS) || self.vdist_sensor_type == VdistSensor::Gps {
            max_delay = max_delay.max(self.gps_delay_ms);
        }

        if self.fusion_mode.contains(FusionMode::USE_OF) {
            max_delay = max_delay.max(self.flow_delay_ms);
        }

        if self
            .fusion_mode
            .intersects(FusionMode::USE_EVPOS | FusionMode::USE_EVYAW | FusionMode::USE_EVVEL)
        {
            max_delay = max_delay.max(self.ev_delay_ms);
        }

        max_delay
            .max(self.airspeed_delay_ms)
            .max(self.range_delay_ms)
            .max(self.auxvel_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_conversion() {
        assert_eq!(VdistSensor::try_from(2), Ok(VdistSensor::Range));
        assert_eq!(
            VdistSensor::try_from(7),
            Err(SelectorError::BadHeightSource { value: 7 })
        );
        assert_eq!(MagFuseType::try_from(3), Ok(MagFuseType::AutoFw));
        assert!(MagFuseType::try_from(4).is_err());
    }

    #[test]
    fn test_default_masks() {
        let params = Parameters::default();
        assert_eq!(params.gps_check_mask.bits(), 21);
        assert_eq!(params.mag_declination_source.bits(), 7);
        assert_eq!(params.fusion_mode.bits(), 1);
    }

    #[test]
    fn test_max_delay() {
        let mut params = Parameters::default();
        assert_eq!(params.max_delay_ms(), 110.0);

        params.fusion_mode = FusionMode::empty();
        assert_eq!(params.max_delay_ms(), 100.0);
    }
}
