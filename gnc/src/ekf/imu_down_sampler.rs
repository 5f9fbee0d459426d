//! Accumulates high rate IMU samples into intervals of the filter update
//! period.

use nalgebra::UnitQuaternion;

use crate::datatypes::sensors::ImuSample;

#[derive(Debug, Clone)]
pub struct ImuDownSampler {
    target_dt: f32,
    collection_time_adj: f32,
    accumulated: ImuSample,
    delta_angle: UnitQuaternion<f32>,
    do_reset: bool,
}

impl ImuDownSampler {
    pub fn new(target_dt: f32) -> Self {
        Self {
            target_dt,
            collection_time_adj: 0.0,
            accumulated: ImuSample::default(),
            delta_angle: UnitQuaternion::identity(),
            do_reset: false,
        }
    }

    fn reset(&mut self) {
        self.accumulated = ImuSample::default();
        self.delta_angle = UnitQuaternion::identity();
        self.do_reset = false;
    }

    /// Adds one sample to the current interval. Returns the down-sampled
    /// interval once its duration reaches the target period.
    pub fn update(&mut self, imu: &ImuSample) -> Option<ImuSample> {
        if self.do_reset {
            self.reset();
        }

        self.accumulated.delta_ang_dt += imu.delta_ang_dt;
        self.accumulated.delta_vel_dt += imu.delta_vel_dt;

        let dq = UnitQuaternion::from_scaled_axis(imu.delta_ang);
        self.delta_angle = UnitQuaternion::new_normalize((self.delta_angle * dq).into_inner());

        // Express the accumulated delta velocity in the body frame at the end
        // of the newest sample
        self.accumulated.delta_vel = dq.inverse_transform_vector(&self.accumulated.delta_vel) + imu.delta_vel;

        if self.accumulated.delta_ang_dt < self.target_dt - self.collection_time_adj {
            return None;
        }

        // Slowly trim the collection threshold so the average interval
        // converges on the target
        self.collection_time_adj += 0.01 * (self.accumulated.delta_ang_dt - self.target_dt);
        let adj_lim = 0.5 * self.target_dt;
        self.collection_time_adj = self.collection_time_adj.clamp(-adj_lim, adj_lim);

        self.accumulated.delta_ang = self.delta_angle.scaled_axis();
        self.accumulated.time_us = imu.time_us;
        self.do_reset = true;

        Some(self.accumulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn imu(time_us: u64, delta_ang: Vector3<f32>, delta_vel: Vector3<f32>) -> ImuSample {
        ImuSample {
            delta_ang,
            delta_vel,
            delta_ang_dt: 0.001,
            delta_vel_dt: 0.001,
            time_us,
        }
    }

    #[test]
    fn test_emits_every_period() {
        let mut ds = ImuDownSampler::new(0.01);
        let mut emitted = 0;

        for i in 1..=100 {
            if ds.update(&imu(i * 1000, Vector3::zeros(), Vector3::zeros())).is_some() {
                emitted += 1;
            }
        }

        assert!((9..=11).contains(&emitted));
    }

    #[test]
    fn test_accumulates_rotation_and_velocity() {
        let mut ds = ImuDownSampler::new(0.01);
        let dang = Vector3::new(0.0, 0.0, 0.001);
        let dvel = Vector3::new(0.0, 0.0, -0.0098);

        let mut out = None;
        let mut t = 0;
        while out.is_none() {
            t += 1000;
            out = ds.update(&imu(t, dang, dvel));
        }

        let out = out.unwrap();
        let n = (out.delta_ang_dt / 0.001).round();
        assert_abs_diff_eq!(out.delta_ang.z, 0.001 * n, epsilon = 1e-6);
        // Rotation about the vertical leaves a vertical delta velocity unchanged
        assert_abs_diff_eq!(out.delta_vel.z, -0.0098 * n, epsilon = 1e-5);
        assert_eq!(out.time_us, t);

        // The next sample starts a new interval
        assert!(ds.update(&imu(t + 1000, dang, dvel)).is_none());
    }

    #[test]
    fn test_rotates_delta_velocity_into_final_frame() {
        let mut ds = ImuDownSampler::new(0.0015);

        // First sample: pure X velocity, no rotation
        assert!(ds.update(&imu(1000, Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))).is_none());

        // Second sample: 90 deg yaw, no velocity
        let out = ds
            .update(&imu(2000, Vector3::new(0.0, 0.0, core::f32::consts::FRAC_PI_2), Vector3::zeros()))
            .unwrap();

        // The earlier X velocity now lies along -Y of the rotated body frame
        assert_abs_diff_eq!(out.delta_vel, Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-5);
    }
}
