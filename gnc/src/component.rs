use crate::Instant;

/// Host or flight events that change how a component runs.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Event {
    Liftoff,
    Landed,
    /// The vehicle flies as a fixed wing (true) or a multirotor (false)
    FixedWing(bool),
    /// Expect baro errors from rotor wash near the ground
    GroundEffect(bool),
    /// Fuse the zero sideslip assumption
    FuseSideslip(bool),
    /// Declination from a world magnetic model (deg)
    GeoDeclination(f32),
    /// Restart the estimator from scratch
    Reset,
}

pub trait Component {
    fn handle_event(&mut self, event: Event, now: Instant);

    fn step(&mut self, now: Instant);
}
