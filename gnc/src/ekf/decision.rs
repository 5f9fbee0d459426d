//! Aiding source selection rules, kept free of estimator state so that every
//! combination of their inputs can be exercised directly.

use super::{params::MagFuseType, status::ControlStatus};

/// 3-axis fusion needs the field states to stay observable. After this long
/// without manoeuvres it falls back to heading fusion (us).
pub const MAG_3D_MOVEMENT_TIMEOUT_US: u64 = 2_000_000;

/// Magnetometer fusion method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MagMode {
    Off,
    /// Euler yaw angle only
    Heading,
    /// Body field components, estimating earth field and body bias
    Mag3D,
}

#[derive(Debug, Clone, Copy)]
pub struct MagModeInputs {
    pub fuse_type: MagFuseType,
    pub tilt_align: bool,
    pub in_air: bool,
    pub ev_yaw: bool,
    pub mag_fault: bool,
    pub flt_mag_align_complete: bool,
    /// Climbed far enough since take-off to be clear of ground magnetic
    /// anomalies
    pub height_achieved: bool,
    /// Time since the yaw or field biases were last observable (us)
    pub time_since_movement_us: u64,
}

pub fn select_mag_mode(i: &MagModeInputs) -> MagMode {
    if i.ev_yaw || i.mag_fault {
        return MagMode::Off;
    }

    match i.fuse_type {
        MagFuseType::Auto | MagFuseType::AutoFw => {
            let aligned = i.flt_mag_align_complete || i.height_achieved;
            if i.tilt_align && i.in_air && aligned && i.time_since_movement_us < MAG_3D_MOVEMENT_TIMEOUT_US {
                MagMode::Mag3D
            } else {
                MagMode::Heading
            }
        }
        MagFuseType::Heading => MagMode::Heading,
        MagFuseType::Mag3D => MagMode::Mag3D,
        MagFuseType::None => MagMode::Off,
    }
}

/// Fixed wing vehicles in the AUTOFW mode only learn the field states in
/// flight, leaving attitude to the other sources.
pub fn mag_states_only(fuse_type: MagFuseType, fixed_wing: bool, in_air: bool) -> bool {
    fuse_type == MagFuseType::AutoFw && fixed_wing && in_air
}

/// Declination is fused to stop heading drift whenever the field is
/// estimated without GPS aiding, and always when requested.
pub fn fuse_declination(mode: MagMode, gps: bool, fuse_decl_requested: bool) -> bool {
    mode == MagMode::Mag3D && (!gps || fuse_decl_requested)
}

/// Active vertical position reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HeightSource {
    Baro,
    Gps,
    Range,
    ExtVision,
}

impl HeightSource {
    pub fn flag(self) -> ControlStatus {
        match self {
            HeightSource::Baro => ControlStatus::BARO_HGT,
            HeightSource::Gps => ControlStatus::GPS_HGT,
            HeightSource::Range => ControlStatus::RNG_HGT,
            HeightSource::ExtVision => ControlStatus::EV_HGT,
        }
    }

    pub fn from_status(status: ControlStatus) -> Option<Self> {
        [
            HeightSource::Baro,
            HeightSource::Gps,
            HeightSource::Range,
            HeightSource::ExtVision,
        ]
        .into_iter()
        .find(|s| status.contains(s.flag()))
    }
}

/// Sensor availability used when height fusion has timed out.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeightTimeoutInputs {
    pub baro_available: bool,
    pub baro_consistent: bool,
    pub baro_faulty: bool,
    pub gps_hgt_accurate: bool,
    pub gps_hgt_intermittent: bool,
    pub rng_available: bool,
    pub ev_available: bool,
    /// Bad vertical accelerometer data within the probation period
    pub recent_bad_vert_accel: bool,
}

/// Chooses the height source to reset to after a height fusion timeout.
/// `None` leaves the height untouched.
pub fn height_timeout_action(current: HeightSource, i: &HeightTimeoutInputs) -> Option<HeightSource> {
    match current {
        HeightSource::Baro => {
            // Only blame the baro if the timeout cannot be blamed on the IMU
            let reset_to_gps =
                !i.gps_hgt_intermittent && ((i.gps_hgt_accurate && !i.recent_bad_vert_accel) || !i.baro_available);
            if reset_to_gps {
                Some(HeightSource::Gps)
            } else if i.baro_available {
                Some(HeightSource::Baro)
            } else {
                None
            }
        }
        HeightSource::Gps => {
            let baro_preferred = (i.baro_consistent && !i.baro_faulty && !i.gps_hgt_accurate) || i.gps_hgt_intermittent;
            if i.baro_available && baro_preferred {
                Some(HeightSource::Baro)
            } else if !i.gps_hgt_intermittent {
                Some(HeightSource::Gps)
            } else {
                None
            }
        }
        HeightSource::Range => {
            if !i.rng_available && i.baro_available {
                Some(HeightSource::Baro)
            } else if i.rng_available {
                Some(HeightSource::Range)
            } else {
                None
            }
        }
        HeightSource::ExtVision => {
            if !i.ev_available && i.baro_available {
                Some(HeightSource::Baro)
            } else if i.ev_available {
                Some(HeightSource::ExtVision)
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeAidInputs {
    pub in_air: bool,
    pub rng_faulty: bool,
    pub terrain_valid: bool,
    pub in_range_aid_mode: bool,
    pub hagl: f32,
    pub max_hagl: f32,
    /// Horizontal velocity is constrained by an aiding source and no fusion
    /// faults are present
    pub horz_vel_valid: bool,
    pub ground_speed: f32,
    pub max_speed: f32,
    /// Height above ground innovation test ratio against the range aid gate
    pub hagl_test_ratio: f32,
}

/// Whether the range finder may replace the primary height source. Entering
/// the mode needs more margin than staying in it.
pub fn range_aid_conditions_met(i: &RangeAidInputs) -> bool {
    if !i.in_air || i.rng_faulty || !i.terrain_valid || !i.horz_vel_valid {
        return false;
    }

    let (margin, ratio_lim) = if i.in_range_aid_mode { (1.0, 1.0) } else { (0.7, 0.01) };

    i.hagl < margin * i.max_hagl && i.ground_speed < margin * i.max_speed && i.hagl_test_ratio < ratio_lim
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mag_inputs(fuse_type: MagFuseType) -> MagModeInputs {
        MagModeInputs {
            fuse_type,
            tilt_align: true,
            in_air: true,
            ev_yaw: false,
            mag_fault: false,
            flt_mag_align_complete: true,
            height_achieved: false,
            time_since_movement_us: 0,
        }
    }

    #[test]
    fn test_auto_mag_mode() {
        let mut i = mag_inputs(MagFuseType::Auto);
        assert_eq!(select_mag_mode(&i), MagMode::Mag3D);

        i.time_since_movement_us = MAG_3D_MOVEMENT_TIMEOUT_US;
        assert_eq!(select_mag_mode(&i), MagMode::Heading);

        i.time_since_movement_us = 0;
        i.flt_mag_align_complete = false;
        assert_eq!(select_mag_mode(&i), MagMode::Heading);

        // Climbing clear of the ground allows the first in-flight alignment
        i.height_achieved = true;
        assert_eq!(select_mag_mode(&i), MagMode::Mag3D);

        i.tilt_align = false;
        assert_eq!(select_mag_mode(&i), MagMode::Heading);

        i.tilt_align = true;
        i.flt_mag_align_complete = true;
        i.in_air = false;
        assert_eq!(select_mag_mode(&i), MagMode::Heading);
    }

    #[test]
    fn test_fixed_mag_modes() {
        let mut i = mag_inputs(MagFuseType::Heading);
        assert_eq!(select_mag_mode(&i), MagMode::Heading);

        i.fuse_type = MagFuseType::Mag3D;
        i.in_air = false;
        assert_eq!(select_mag_mode(&i), MagMode::Mag3D);

        i.fuse_type = MagFuseType::None;
        assert_eq!(select_mag_mode(&i), MagMode::Off);

        i.fuse_type = MagFuseType::Mag3D;
        i.ev_yaw = true;
        assert_eq!(select_mag_mode(&i), MagMode::Off);

        i.ev_yaw = false;
        i.mag_fault = true;
        assert_eq!(select_mag_mode(&i), MagMode::Off);
    }

    #[test]
    fn test_mag_states_only_and_declination() {
        assert!(mag_states_only(MagFuseType::AutoFw, true, true));
        assert!(!mag_states_only(MagFuseType::AutoFw, true, false));
        assert!(!mag_states_only(MagFuseType::Auto, true, true));

        assert!(fuse_declination(MagMode::Mag3D, false, false));
        assert!(!fuse_declination(MagMode::Mag3D, true, false));
        assert!(fuse_declination(MagMode::Mag3D, true, true));
        assert!(!fuse_declination(MagMode::Heading, false, true));
    }

    #[test]
    fn test_height_source_flags() {
        assert_eq!(HeightSource::Range.flag(), ControlStatus::RNG_HGT);
        assert_eq!(
            HeightSource::from_status(ControlStatus::GPS | ControlStatus::GPS_HGT),
            Some(HeightSource::Gps)
        );
        assert_eq!(HeightSource::from_status(ControlStatus::GPS), None);
    }

    #[test]
    fn test_baro_timeout() {
        let mut i = HeightTimeoutInputs {
            baro_available: true,
            gps_hgt_accurate: true,
            ..Default::default()
        };
        assert_eq!(height_timeout_action(HeightSource::Baro, &i), Some(HeightSource::Gps));

        // Bad accel data gets the blame, so stay on baro
        i.recent_bad_vert_accel = true;
        assert_eq!(height_timeout_action(HeightSource::Baro, &i), Some(HeightSource::Baro));

        i.gps_hgt_intermittent = true;
        i.baro_available = false;
        assert_eq!(height_timeout_action(HeightSource::Baro, &i), None);
    }

    #[test]
    fn test_gps_timeout() {
        let mut i = HeightTimeoutInputs {
            baro_available: true,
            baro_consistent: true,
            gps_hgt_accurate: false,
            ..Default::default()
        };
        assert_eq!(height_timeout_action(HeightSource::Gps, &i), Some(HeightSource::Baro));

        i.baro_faulty = true;
        assert_eq!(height_timeout_action(HeightSource::Gps, &i), Some(HeightSource::Gps));

        // Baro is the only height left
        i.gps_hgt_intermittent = true;
        assert_eq!(height_timeout_action(HeightSource::Gps, &i), Some(HeightSource::Baro));

        i.baro_available = false;
        assert_eq!(height_timeout_action(HeightSource::Gps, &i), None);
    }

    #[test]
    fn test_range_and_vision_timeout() {
        let mut i = HeightTimeoutInputs {
            baro_available: true,
            ..Default::default()
        };
        assert_eq!(height_timeout_action(HeightSource::Range, &i), Some(HeightSource::Baro));
        assert_eq!(height_timeout_action(HeightSource::ExtVision, &i), Some(HeightSource::Baro));

        i.rng_available = true;
        i.ev_available = true;
        assert_eq!(height_timeout_action(HeightSource::Range, &i), Some(HeightSource::Range));
        assert_eq!(height_timeout_action(HeightSource::ExtVision, &i), Some(HeightSource::ExtVision));

        i = HeightTimeoutInputs::default();
        assert_eq!(height_timeout_action(HeightSource::Range, &i), None);
    }

    #[test]
    fn test_range_aid_hysteresis() {
        let mut i = RangeAidInputs {
            in_air: true,
            terrain_valid: true,
            horz_vel_valid: true,
            hagl: 4.0,
            max_hagl: 5.0,
            ground_speed: 0.5,
            max_speed: 1.0,
            hagl_test_ratio: 0.005,
            ..Default::default()
        };

        // 4 m is above 70 % of the limit, so the mode is not entered
        assert!(!range_aid_conditions_met(&i));

        // but is kept once active
        i.in_range_aid_mode = true;
        assert!(range_aid_conditions_met(&i));

        i.hagl_test_ratio = 0.5;
        assert!(range_aid_conditions_met(&i));
        i.in_range_aid_mode = false;
        i.hagl = 1.0;
        assert!(!range_aid_conditions_met(&i));

        i.hagl_test_ratio = 0.0;
        assert!(range_aid_conditions_met(&i));

        i.horz_vel_valid = false;
        assert!(!range_aid_conditions_met(&i));
    }
}
