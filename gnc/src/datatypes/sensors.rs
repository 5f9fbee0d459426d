//! Timestamped physical samples handed to the estimator by the sensor drivers,
//! and the buffered forms the estimator fuses.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::common::SampleTime;

/// Integrated IMU output over one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Delta angle in body frame (rad)
    pub delta_ang: Vector3<f32>,
    /// Delta velocity in body frame (m/s)
    pub delta_vel: Vector3<f32>,
    /// Delta angle integration period (s)
    pub delta_ang_dt: f32,
    /// Delta velocity integration period (s)
    pub delta_vel_dt: f32,
    pub time_us: u64,
}

impl Default for ImuSample {
    fn default() -> Self {
        Self {
            delta_ang: Vector3::zeros(),
            delta_vel: Vector3::zeros(),
            delta_ang_dt: 0.0,
            delta_vel_dt: 0.0,
            time_us: 0,
        }
    }
}

/// Raw receiver solution as reported by the GPS driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsMessage {
    pub time_usec: u64,
    /// Latitude (1e-7 deg)
    pub lat: i32,
    /// Longitude (1e-7 deg)
    pub lon: i32,
    /// Altitude above MSL (mm)
    pub alt: i32,
    /// 0-1: no fix, 2: 2D fix, 3: 3D fix, 4: DGPS, 5: RTK
    pub fix_type: u8,
    /// Horizontal position accuracy (m)
    pub eph: f32,
    /// Vertical position accuracy (m)
    pub epv: f32,
    /// Speed accuracy (m/s)
    pub sacc: f32,
    /// Ground speed (m/s)
    pub vel_m_s: f32,
    pub vel_ned: Vector3<f32>,
    pub vel_ned_valid: bool,
    pub nsats: u8,
    pub gdop: f32,
}

impl Default for GpsMessage {
    fn default() -> Self {
        Self {
            time_usec: 0,
            lat: 0,
            lon: 0,
            alt: 0,
            fix_type: 0,
            eph: 0.0,
            epv: 0.0,
            sacc: 0.0,
            vel_m_s: 0.0,
            vel_ned: Vector3::zeros(),
            vel_ned_valid: false,
            nsats: 0,
            gdop: 0.0,
        }
    }
}

/// GPS measurement relative to the local origin.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsSample {
    /// North/East position relative to the origin (m)
    pub pos: Vector2<f32>,
    /// Altitude above MSL (m)
    pub hgt: f32,
    pub vel: Vector3<f32>,
    pub hacc: f32,
    pub vacc: f32,
    pub sacc: f32,
    pub time_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MagSample {
    /// Body frame field (Gauss)
    pub mag: Vector3<f32>,
    pub time_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BaroSample {
    /// Pressure altitude above MSL (m)
    pub hgt: f32,
    pub time_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RangeSample {
    /// Distance along the sensor axis (m)
    pub rng: f32,
    pub time_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AirspeedSample {
    pub true_airspeed: f32,
    pub eas2tas: f32,
    pub time_us: u64,
}

/// Optical flow message as reported by the flow sensor driver.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowMessage {
    pub time_us: u64,
    pub quality: u8,
    /// Integrated flow about the body X and Y axes (rad)
    pub flowdata: Vector2<f32>,
    /// Integrated gyro rotation about the body axes (rad)
    pub gyrodata: Vector3<f32>,
    /// Integration time (us)
    pub dt_us: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowSample {
    pub quality: u8,
    /// Image delta angle about the body X and Y axes (rad)
    pub flow_rad_xy: Vector2<f32>,
    /// Image delta angle with body rotation removed (rad)
    pub flow_rad_xy_comp: Vector2<f32>,
    /// Inertial delta angle from the sensor gyro (rad)
    pub gyro_xyz: Vector3<f32>,
    /// Integration time (s)
    pub dt: f32,
    pub time_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtVisionSample {
    /// Position relative to the vision frame origin (m)
    pub pos_ned: Vector3<f32>,
    /// Rotation from body to the vision frame
    pub quat: UnitQuaternion<f32>,
    /// 1-sigma spherical position accuracy (m)
    pub pos_err: f32,
    /// 1-sigma angular error (rad)
    pub ang_err: f32,
    /// Velocity in the vision frame (m/s)
    pub vel_ned: Vector3<f32>,
    /// 1-sigma velocity accuracy (m/s)
    pub vel_err: f32,
    pub time_us: u64,
}

impl Default for ExtVisionSample {
    fn default() -> Self {
        Self {
            pos_ned: Vector3::zeros(),
            quat: UnitQuaternion::identity(),
            pos_err: 0.0,
            ang_err: 0.0,
            vel_ned: Vector3::zeros(),
            vel_err: 0.0,
            time_us: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DragSample {
    /// Specific force along the body X and Y axes (m/s^2)
    pub accel_xy: Vector2<f32>,
    pub time_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AuxVelSample {
    pub vel_ne: Vector2<f32>,
    pub vel_var_ne: Vector2<f32>,
    pub time_us: u64,
}

macro_rules! impl_sample_time {
    ($($t:ty),+) => {
        $(
            impl SampleTime for $t {
                fn time_us(&self) -> u64 {
                    self.time_us
                }
            }
        )+
    };
}

impl_sample_time!(
    ImuSample,
    GpsSample,
    MagSample,
    BaroSample,
    RangeSample,
    AirspeedSample,
    FlowSample,
    ExtVisionSample,
    DragSample,
    AuxVelSample
);
