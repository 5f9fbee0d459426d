#![no_std]

pub mod common;
pub mod component;
pub mod components;
pub mod datatypes;
pub mod ekf;
pub mod hal;

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub use ekf::{Ekf, params::Parameters};

pub type InstantU64 = fugit::Instant<u64, 1, 1_000_000>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(pub InstantU64);

impl Instant {
    pub fn from_micros(us: u64) -> Self {
        Instant(InstantU64::from_ticks(us))
    }

    pub fn as_micros(&self) -> u64 {
        self.0.ticks()
    }
}
