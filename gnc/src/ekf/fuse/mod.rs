//! Measurement models. Each one builds the observation Jacobian of the error
//! state, gates the innovation and hands the update to the shared scalar
//! fusion.

mod air;
mod aux_vel;
mod mag;
mod optflow;
mod vel_pos;

pub(crate) use vel_pos::{DirectObservations, HorizontalObservation, VerticalObservation};
