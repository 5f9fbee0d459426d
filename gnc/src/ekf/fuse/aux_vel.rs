//! Horizontal velocity from an auxiliary source, such as a landing target
//! tracker, fused alongside the primary aiding.

use defmt_or_log::warn;

use crate::ekf::{
    Ekf,
    fusion::test_ratio,
    states::VEL,
    status::{FaultStatus, InnovationFaultStatus},
};

impl Ekf {
    /// Both axes are gated together. The reported variance is floored at the
    /// configured noise.
    pub(crate) fn fuse_aux_vel(&mut self) {
        let sample = self.aux_vel_sample_delayed;
        let gate = self.params.auxvel_gate.max(1.0);

        for axis in 0..2 {
            let obs_var = sample.vel_var_ne[axis].max(self.params.auxvel_noise * self.params.auxvel_noise);
            let innov = sample.vel_ne[axis] - self.state.vel[axis];
            let innov_var = self.p[(VEL + axis, VEL + axis)] + obs_var;

            self.innov.aux_vel[axis] = innov;
            self.innov.aux_vel_var[axis] = innov_var;
            self.innov.aux_vel_test_ratio[axis] = test_ratio(innov, innov_var, gate);
        }

        if self.innov.aux_vel_test_ratio.iter().any(|r| *r > 1.0) {
            self.innov_check_fail_status.insert(InnovationFaultStatus::REJECT_VEL_NED);
            return;
        }

        let faults = [FaultStatus::BAD_VEL_N, FaultStatus::BAD_VEL_E];
        for axis in 0..2 {
            let obs_var = sample.vel_var_ne[axis].max(self.params.auxvel_noise * self.params.auxvel_noise);
            let innov = sample.vel_ne[axis] - self.state.vel[axis];

            if self.fuse_direct(VEL + axis, innov, obs_var, faults[axis]).is_err() {
                warn!("EKF auxiliary velocity fusion numerical error");
                return;
            }
        }
        self.time_last_vel_fuse = self.time_last_imu;
    }
}
