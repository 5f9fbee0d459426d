pub mod ekf_params;
pub mod logging;
pub mod parameters;
pub mod sim;
