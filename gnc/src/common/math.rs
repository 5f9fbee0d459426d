//! Small attitude and scalar helpers shared by the estimator.

use core::f32::consts::PI;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
#[cfg(not(feature = "std"))]
use num_traits::Float;

pub const GRAVITY_M_S2: f32 = 9.80665;

#[inline]
pub fn sq(x: f32) -> f32 {
    x * x
}

/// Wraps an angle to the [-pi, pi] interval. Odd multiples of pi may land on
/// either end after rounding.
pub fn wrap_pi(angle: f32) -> f32 {
    if !angle.is_finite() {
        return angle;
    }

    let mut a = angle;
    while a >= PI {
        a -= 2.0 * PI;
    }
    while a < -PI {
        a += 2.0 * PI;
    }
    a
}

/// Yaw of a 321 (yaw, pitch, roll) rotation sequence.
pub fn yaw_321(r: &Matrix3<f32>) -> f32 {
    r[(1, 0)].atan2(r[(0, 0)])
}

/// Yaw of a 312 (yaw, roll, pitch) rotation sequence.
pub fn yaw_312(r: &Matrix3<f32>) -> f32 {
    (-r[(0, 1)]).atan2(r[(1, 1)])
}

/// The 321 sequence is singular near +-90 deg pitch, the 312 one near +-90 deg
/// roll. Returns true when the 321 yaw is the better conditioned choice.
pub fn prefer_321_yaw(r: &Matrix3<f32>) -> bool {
    r[(2, 0)].abs() < r[(2, 1)].abs()
}

/// Builds a body to earth rotation from the 312 angles.
pub fn rotation_from_euler_312(roll: f32, pitch: f32, yaw: f32) -> Matrix3<f32> {
    let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), yaw);
    let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), roll);
    let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), pitch);

    (rz * rx * ry).into_inner()
}

/// Roll and pitch of the 312 sequence.
pub fn roll_pitch_312(r: &Matrix3<f32>) -> (f32, f32) {
    let roll = r[(2, 1)].clamp(-1.0, 1.0).asin();
    let pitch = (-r[(2, 0)]).atan2(r[(2, 2)]);
    (roll, pitch)
}

/// Returns the attitude `q` with its yaw replaced by `yaw`, keeping the tilt.
/// `use_321` selects the rotation sequence the yaw angle refers to.
pub fn with_yaw(q: &UnitQuaternion<f32>, yaw: f32, use_321: bool) -> UnitQuaternion<f32> {
    if use_321 {
        let (roll, pitch, _) = q.euler_angles();
        UnitQuaternion::from_euler_angles(roll, pitch, yaw)
    } else {
        let r = q.to_rotation_matrix().into_inner();
        let (roll, pitch) = roll_pitch_312(&r);
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
            rotation_from_euler_312(roll, pitch, yaw),
        ))
    }
}

/// Body to earth attitude that aligns the measured specific force with
/// gravity, with zero yaw.
pub fn tilt_from_specific_force(accel_b: &Vector3<f32>) -> UnitQuaternion<f32> {
    let norm = accel_b.norm();
    if norm < 1e-3 {
        return UnitQuaternion::identity();
    }

    // At rest the accelerometer measures minus gravity
    let down_b = -accel_b / norm;
    let pitch = (-down_b.x).clamp(-1.0, 1.0).asin();
    let roll = down_b.y.atan2(down_b.z);

    UnitQuaternion::from_euler_angles(roll, pitch, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_wrap_pi() {
        assert_abs_diff_eq!(wrap_pi(0.5), 0.5);
        assert_abs_diff_eq!(wrap_pi(PI + 0.1), -PI + 0.1, epsilon = 1e-5);
        assert_abs_diff_eq!(wrap_pi(-PI - 0.1), PI - 0.1, epsilon = 1e-5);
        assert_abs_diff_eq!(wrap_pi(5.0 * PI).abs(), PI, epsilon = 1e-4);
        assert_abs_diff_eq!(wrap_pi(4.0 * PI + 0.2), 0.2, epsilon = 1e-5);
    }

    #[test]
    fn test_yaw_extraction() {
        let r = UnitQuaternion::from_euler_angles(0.1, -0.2, 1.2)
            .to_rotation_matrix()
            .into_inner();
        assert_abs_diff_eq!(yaw_321(&r), 1.2, epsilon = 1e-5);

        let r = rotation_from_euler_312(0.3, -0.2, -2.0);
        assert_abs_diff_eq!(yaw_312(&r), -2.0, epsilon = 1e-5);
        let (roll, pitch) = roll_pitch_312(&r);
        assert_abs_diff_eq!(roll, 0.3, epsilon = 1e-5);
        assert_abs_diff_eq!(pitch, -0.2, epsilon = 1e-5);
    }

    #[test]
    fn test_with_yaw_keeps_tilt() {
        let q = UnitQuaternion::from_euler_angles(0.2, 0.1, 0.5);

        for use_321 in [true, false] {
            let q_new = with_yaw(&q, -1.0, use_321);
            let r_old = q.to_rotation_matrix().into_inner();
            let r_new = q_new.to_rotation_matrix().into_inner();

            // Gravity direction in body frame is unchanged
            let d_old = r_old.transpose() * Vector3::z();
            let d_new = r_new.transpose() * Vector3::z();
            assert_abs_diff_eq!(d_old, d_new, epsilon = 1e-5);

            let yaw = if use_321 {
                yaw_321(&r_new)
            } else {
                yaw_312(&r_new)
            };
            assert_abs_diff_eq!(yaw, -1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_tilt_from_specific_force() {
        let q_true = UnitQuaternion::from_euler_angles(0.3, -0.25, 0.0);
        let f_b = q_true.inverse_transform_vector(&Vector3::new(0.0, 0.0, -GRAVITY_M_S2));

        let q = tilt_from_specific_force(&f_b);
        assert_abs_diff_eq!(q.angle_to(&q_true), 0.0, epsilon = 1e-4);
    }
}
