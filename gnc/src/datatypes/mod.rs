pub mod gnc;
pub mod sensors;
