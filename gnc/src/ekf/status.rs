//! Bit packed status words published by the estimator. Bit positions are part
//! of the external interface and must not be reordered.

use bitflags::bitflags;
use nalgebra::{UnitQuaternion, Vector2};

bitflags! {
    /// Which aiding sources and modes are active.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ControlStatus: u32 {
        const TILT_ALIGN = 1 << 0;
        const YAW_ALIGN = 1 << 1;
        const GPS = 1 << 2;
        const OPT_FLOW = 1 << 3;
        const MAG_HDG = 1 << 4;
        const MAG_3D = 1 << 5;
        const MAG_DEC = 1 << 6;
        const IN_AIR = 1 << 7;
        const WIND = 1 << 8;
        const BARO_HGT = 1 << 9;
        const RNG_HGT = 1 << 10;
        const GPS_HGT = 1 << 11;
        const EV_POS = 1 << 12;
        const EV_YAW = 1 << 13;
        const EV_HGT = 1 << 14;
        const FUSE_BETA = 1 << 15;
        const UPDATE_MAG_STATES_ONLY = 1 << 16;
        const FIXED_WING = 1 << 17;
        const MAG_FAULT = 1 << 18;
        const FUSE_ASPD = 1 << 19;
        const GND_EFFECT = 1 << 20;
        const RNG_STUCK = 1 << 21;
        const EV_VEL = 1 << 24;

        const HEIGHT_SOURCES = Self::BARO_HGT.bits()
            | Self::RNG_HGT.bits()
            | Self::GPS_HGT.bits()
            | Self::EV_HGT.bits();
    }

    /// Numerical failures of the fusion steps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FaultStatus: u16 {
        const BAD_MAG_X = 1 << 0;
        const BAD_MAG_Y = 1 << 1;
        const BAD_MAG_Z = 1 << 2;
        const BAD_MAG_HDG = 1 << 3;
        const BAD_MAG_DECL = 1 << 4;
        const BAD_AIRSPEED = 1 << 5;
        const BAD_SIDESLIP = 1 << 6;
        const BAD_OPTFLOW_X = 1 << 7;
        const BAD_OPTFLOW_Y = 1 << 8;
        const BAD_VEL_N = 1 << 9;
        const BAD_VEL_E = 1 << 10;
        const BAD_VEL_D = 1 << 11;
        const BAD_POS_N = 1 << 12;
        const BAD_POS_E = 1 << 13;
        const BAD_POS_D = 1 << 14;
        const BAD_ACC_BIAS = 1 << 15;
    }

    /// Observations rejected by their innovation consistency check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct InnovationFaultStatus: u16 {
        const REJECT_VEL_NED = 1 << 0;
        const REJECT_POS_NE = 1 << 1;
        const REJECT_POS_D = 1 << 2;
        const REJECT_MAG_X = 1 << 3;
        const REJECT_MAG_Y = 1 << 4;
        const REJECT_MAG_Z = 1 << 5;
        const REJECT_YAW = 1 << 6;
        const REJECT_AIRSPEED = 1 << 7;
        const REJECT_SIDESLIP = 1 << 8;
        const REJECT_HAGL = 1 << 9;
        const REJECT_OPTFLOW_X = 1 << 10;
        const REJECT_OPTFLOW_Y = 1 << 11;
    }

    /// Outcome of each GPS quality check, set when the check fails.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct GpsCheckFailStatus: u16 {
        const FIX = 1 << 0;
        const NSATS = 1 << 1;
        const GDOP = 1 << 2;
        const HACC = 1 << 3;
        const VACC = 1 << 4;
        const SACC = 1 << 5;
        const HDRIFT = 1 << 6;
        const VDRIFT = 1 << 7;
        const HSPEED = 1 << 8;
        const VSPEED = 1 << 9;
    }

    /// Which parts of the solution are good enough to use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SolutionStatus: u16 {
        const ATTITUDE = 1 << 0;
        const VELOCITY_HORIZ = 1 << 1;
        const VELOCITY_VERT = 1 << 2;
        const POS_HORIZ_REL = 1 << 3;
        const POS_HORIZ_ABS = 1 << 4;
        const POS_VERT_ABS = 1 << 5;
        const POS_VERT_AGL = 1 << 6;
        const CONST_POS_MODE = 1 << 7;
        const PRED_POS_HORIZ_REL = 1 << 8;
        const PRED_POS_HORIZ_ABS = 1 << 9;
        const GPS_GLITCH = 1 << 10;
        const ACCEL_ERROR = 1 << 11;
    }

    /// Sensors whose newest sample is older than twice their maximum interval.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SensorTimeouts: u8 {
        const GPS = 1 << 0;
        const BARO = 1 << 1;
        const RANGE = 1 << 2;
        const EXT_VISION = 1 << 3;
    }
}

/// Record of the discrete state changes applied by resets, so that consumers
/// of the output can compensate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateResetStatus {
    pub vel_ne_counter: u8,
    pub vel_d_counter: u8,
    pub pos_ne_counter: u8,
    pub pos_d_counter: u8,
    pub quat_counter: u8,
    pub vel_ne_change: Vector2<f32>,
    pub vel_d_change: f32,
    pub pos_ne_change: Vector2<f32>,
    pub pos_d_change: f32,
    pub quat_change: UnitQuaternion<f32>,
}

impl Default for StateResetStatus {
    fn default() -> Self {
        Self {
            vel_ne_counter: 0,
            vel_d_counter: 0,
            pos_ne_counter: 0,
            pos_d_counter: 0,
            quat_counter: 0,
            vel_ne_change: Vector2::zeros(),
            vel_d_change: 0.0,
            pos_ne_change: Vector2::zeros(),
            pos_d_change: 0.0,
            quat_change: UnitQuaternion::identity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_control_status_layout() {
        assert_eq!(ControlStatus::TILT_ALIGN.bits(), 1);
        assert_eq!(ControlStatus::GPS.bits(), 0b100);
        assert_eq!(ControlStatus::BARO_HGT.bits(), 1 << 9);
        assert_eq!(ControlStatus::FUSE_BETA.bits(), 1 << 15);
        assert_eq!(ControlStatus::RNG_STUCK.bits(), 1 << 21);
        assert_eq!(ControlStatus::EV_VEL.bits(), 1 << 24);
        assert_eq!(ControlStatus::HEIGHT_SOURCES.bits(), 0b0100_1110_0000_0000);
    }

    #[test]
    fn test_fault_status_layout() {
        assert_eq!(FaultStatus::BAD_MAG_HDG.bits(), 1 << 3);
        assert_eq!(FaultStatus::BAD_VEL_N.bits(), 1 << 9);
        assert_eq!(FaultStatus::BAD_ACC_BIAS.bits(), 1 << 15);
    }

    #[test]
    fn test_innovation_and_gps_layout() {
        assert_eq!(InnovationFaultStatus::REJECT_YAW.bits(), 1 << 6);
        assert_eq!(InnovationFaultStatus::REJECT_OPTFLOW_Y.bits(), 1 << 11);
        assert_eq!(GpsCheckFailStatus::HACC.bits(), 1 << 3);
        assert_eq!(GpsCheckFailStatus::VSPEED.bits(), 1 << 9);
    }

    #[test]
    fn test_solution_status_layout() {
        assert_eq!(SolutionStatus::CONST_POS_MODE.bits(), 1 << 7);
        assert_eq!(SolutionStatus::ACCEL_ERROR.bits(), 1 << 11);

        let status = SolutionStatus::ATTITUDE | SolutionStatus::VELOCITY_VERT;
        assert_eq!(status.bits(), 0b101);
    }
}
