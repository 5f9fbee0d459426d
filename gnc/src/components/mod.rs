pub mod navigation;

pub use navigation::{NavigationComponent, NavigationHarness};
