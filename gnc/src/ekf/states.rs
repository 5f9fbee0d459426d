//! Layout of the error state vector.
//!
//! Attitude errors are small rotations expressed in the earth frame, so that
//! the true attitude is `exp(theta) * q`. Biases are kept in rate units.

use nalgebra::{SMatrix, SVector};

pub const NUM_STATES: usize = 23;

pub const THETA: usize = 0;
pub const VEL: usize = 3;
pub const POS: usize = 6;
pub const GYRO_BIAS: usize = 9;
pub const ACCEL_BIAS: usize = 12;
pub const MAG_I: usize = 15;
pub const MAG_B: usize = 18;
pub const WIND: usize = 21;

pub type Covariance = SMatrix<f32, NUM_STATES, NUM_STATES>;
pub type StateVector = SVector<f32, NUM_STATES>;

/// Per-state flags marking which states a measurement is allowed to correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMask([bool; NUM_STATES]);

impl StateMask {
    pub const fn all() -> Self {
        Self([true; NUM_STATES])
    }

    pub const fn none() -> Self {
        Self([false; NUM_STATES])
    }

    pub fn with_range(mut self, start: usize, len: usize, value: bool) -> Self {
        self.set_range(start, len, value);
        self
    }

    pub fn set_range(&mut self, start: usize, len: usize, value: bool) {
        for flag in self.0[start..start + len].iter_mut() {
            *flag = value;
        }
    }

    pub fn set(&mut self, index: usize, value: bool) {
        self.0[index] = value;
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0[index]
    }

    /// Zeroes every element of `v` that is not in the mask.
    pub fn apply(&self, v: &mut StateVector) {
        for (x, keep) in v.iter_mut().zip(self.0.iter()) {
            if !keep {
                *x = 0.0;
            }
        }
    }

    pub fn intersect(&self, other: &StateMask) -> StateMask {
        let mut out = *self;
        for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
            *a &= *b;
        }
        out
    }
}

impl Default for StateMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Clears all cross covariances of the given states, keeping their variances.
pub fn decorrelate(p: &mut Covariance, start: usize, len: usize) {
    for i in start..start + len {
        let var = p[(i, i)];
        p.row_mut(i).fill(0.0);
        p.column_mut(i).fill(0.0);
        p[(i, i)] = var;
    }
}

/// Clears rows and columns of the given states and sets their variances.
pub fn reset_block(p: &mut Covariance, start: usize, len: usize, var: f32) {
    for i in start..start + len {
        p.row_mut(i).fill(0.0);
        p.column_mut(i).fill(0.0);
        p[(i, i)] = var;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_layout_is_contiguous() {
        assert_eq!(VEL, THETA + 3);
        assert_eq!(POS, VEL + 3);
        assert_eq!(GYRO_BIAS, POS + 3);
        assert_eq!(ACCEL_BIAS, GYRO_BIAS + 3);
        assert_eq!(MAG_I, ACCEL_BIAS + 3);
        assert_eq!(MAG_B, MAG_I + 3);
        assert_eq!(WIND + 2, NUM_STATES);
    }

    #[test]
    fn test_mask_apply() {
        let mask = StateMask::all().with_range(MAG_I, 6, false);
        let mut v = StateVector::repeat(1.0);
        mask.apply(&mut v);

        assert_eq!(v.sum(), (NUM_STATES - 6) as f32);
        assert!(!mask.contains(MAG_B + 2));
        assert!(mask.contains(WIND));

        let only_wind = StateMask::none().with_range(WIND, 2, true);
        let both = mask.intersect(&only_wind);
        assert!(both.contains(WIND + 1));
        assert!(!both.contains(VEL));
    }

    #[test]
    fn test_decorrelate_keeps_variance() {
        let mut p = Covariance::repeat(0.5);
        decorrelate(&mut p, WIND, 2);

        assert_eq!(p[(WIND, WIND)], 0.5);
        assert_eq!(p[(WIND, 0)], 0.0);
        assert_eq!(p[(0, WIND + 1)], 0.0);
        assert_eq!(p[(WIND, WIND + 1)], 0.0);
        assert_eq!(p[(0, 1)], 0.5);
    }
}
