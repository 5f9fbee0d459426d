pub mod geo;
pub mod math;
pub mod ring_buffer;
mod timestamped;

pub use ring_buffer::{PushError, SampleBuffer};
pub use timestamped::*;
