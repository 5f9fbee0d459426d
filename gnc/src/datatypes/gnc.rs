use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::common::SampleTime;

/// Full estimator state at the fusion time horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSample {
    /// Rotation from body to earth (NED) frame
    pub quat_nominal: UnitQuaternion<f32>,
    pub vel: Vector3<f32>,
    pub pos: Vector3<f32>,
    /// Gyro bias (rad/s)
    pub gyro_bias: Vector3<f32>,
    /// Accelerometer bias (m/s^2)
    pub accel_bias: Vector3<f32>,
    /// Earth magnetic field in NED (Gauss)
    pub mag_i: Vector3<f32>,
    /// Magnetometer bias in body frame (Gauss)
    pub mag_b: Vector3<f32>,
    pub wind_vel: Vector2<f32>,
}

impl Default for StateSample {
    fn default() -> Self {
        Self {
            quat_nominal: UnitQuaternion::identity(),
            vel: Vector3::zeros(),
            pos: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            mag_i: Vector3::zeros(),
            mag_b: Vector3::zeros(),
            wind_vel: Vector2::zeros(),
        }
    }
}

impl StateSample {
    pub fn is_finite(&self) -> bool {
        self.quat_nominal.coords.iter().all(|v| v.is_finite())
            && self.vel.iter().all(|v| v.is_finite())
            && self.pos.iter().all(|v| v.is_finite())
            && self.gyro_bias.iter().all(|v| v.is_finite())
            && self.accel_bias.iter().all(|v| v.is_finite())
            && self.mag_i.iter().all(|v| v.is_finite())
            && self.mag_b.iter().all(|v| v.is_finite())
            && self.wind_vel.iter().all(|v| v.is_finite())
    }
}

/// IMU rate prediction of the vehicle pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSample {
    pub quat_nominal: UnitQuaternion<f32>,
    pub vel: Vector3<f32>,
    pub pos: Vector3<f32>,
    pub time_us: u64,
}

impl Default for OutputSample {
    fn default() -> Self {
        Self {
            quat_nominal: UnitQuaternion::identity(),
            vel: Vector3::zeros(),
            pos: Vector3::zeros(),
            time_us: 0,
        }
    }
}

/// Vertical channel integrated separately from the position output so its
/// velocity stays kinematically consistent with its height.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputVert {
    pub vel_d: f32,
    pub vel_d_integ: f32,
    pub dt: f32,
    pub time_us: u64,
}

impl SampleTime for OutputSample {
    fn time_us(&self) -> u64 {
        self.time_us
    }
}

impl SampleTime for OutputVert {
    fn time_us(&self) -> u64 {
        self.time_us
    }
}

/// Navigation solution published to the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationOutput {
    pub quat_nb: UnitQuaternion<f32>,

    pub pos_n_m: Vector3<f32>,
    pub vel_n_m_s: Vector3<f32>,
    pub vel_d_integ_m_s: f32,

    pub angvel_unbias_b_rad_s: Vector3<f32>,
    pub acc_unbias_b_m_s2: Vector3<f32>,

    pub control_status: u32,
    pub solution_status: u16,
}
