use approx::assert_abs_diff_eq;
use nalgebra::{Vector2, Vector3};
use nav_gnc::{
    Parameters,
    ekf::{params::FusionMode, status::ControlStatus},
};
use nav_sim::sim::{Sensor, SensorSimulator};

#[test]
fn test_vision_velocity_and_airspeed_estimate_wind() {
    let mut sim = SensorSimulator::new(
        Parameters {
            fusion_mode: FusionMode::USE_EVVEL,
            ..Default::default()
        },
        0,
    );
    sim.run_seconds(2.0);

    let velocity = Vector3::new(1.5, 0.0, 0.0);
    sim.truth_mut().vel_ned = velocity;
    // 0.1 m/s true airspeed
    sim.truth_mut().wind_ne = Vector2::new(1.4, 0.0);
    sim.start(Sensor::ExtVision);
    sim.ekf_mut().set_in_air_status(true);
    sim.start(Sensor::Airspeed);

    sim.run_seconds(40.0);

    let ekf = sim.ekf();
    let status = ekf.control_status();
    assert!(status.contains(ControlStatus::WIND));
    assert!(status.contains(ControlStatus::EV_VEL));
    assert!(!status.intersects(ControlStatus::EV_POS | ControlStatus::EV_YAW));

    assert!(ekf.local_position_is_valid());
    assert!(!ekf.global_position_is_valid());

    assert_abs_diff_eq!(ekf.get_velocity(), velocity, epsilon = 0.1);
    assert_abs_diff_eq!(ekf.state().wind_vel, Vector2::new(1.4, 0.0), epsilon = 0.1);
}

#[test]
fn test_vision_position_replaces_synthetic_position() {
    let mut sim = SensorSimulator::new(
        Parameters {
            fusion_mode: FusionMode::USE_EVPOS,
            ..Default::default()
        },
        0,
    );
    sim.truth_mut().vel_ned = Vector3::new(0.5, 0.0, 0.0);
    sim.run_seconds(5.0);
    assert!(!sim.ekf().local_position_is_valid());

    sim.start(Sensor::ExtVision);
    sim.run_seconds(10.0);

    let ekf = sim.ekf();
    assert!(ekf.control_status().contains(ControlStatus::EV_POS));
    assert!(!ekf.control_status().contains(ControlStatus::GPS));
    assert!(ekf.local_position_is_valid());

    let truth = sim.truth().pos_at(sim.time_us());
    assert_abs_diff_eq!(ekf.get_position().xy(), truth.xy(), epsilon = 0.3);
    assert_abs_diff_eq!(ekf.get_velocity().x, 0.5, epsilon = 0.15);
}

#[test]
fn test_optical_flow_hover() {
    let mut sim = SensorSimulator::new(
        Parameters {
            fusion_mode: FusionMode::USE_OF,
            ..Default::default()
        },
        0,
    );
    sim.truth_mut().pos_ned = Vector3::new(0.0, 0.0, -2.0);
    sim.run_seconds(5.0);

    sim.ekf_mut().set_in_air_status(true);
    sim.start(Sensor::Range);
    sim.start(Sensor::Flow);
    sim.run_seconds(10.0);

    let ekf = sim.ekf();
    assert!(ekf.control_status().contains(ControlStatus::OPT_FLOW));
    assert!(ekf.get_terrain_valid());
    assert_abs_diff_eq!(ekf.get_hagl(), 2.0, epsilon = 0.2);
    assert_abs_diff_eq!(ekf.get_velocity().xy(), Vector2::zeros(), epsilon = 0.05);
}

#[test]
fn test_gps_loss_falls_back_to_synthetic_position() {
    let mut sim = SensorSimulator::new(Parameters::default(), 0);
    sim.run_seconds(5.0);
    sim.start(Sensor::Gps);
    sim.ekf_mut().set_min_required_gps_health_time(1_000_000);
    sim.run_seconds(8.0);
    assert!(sim.ekf().control_status().contains(ControlStatus::GPS));

    sim.stop(Sensor::Gps);
    sim.run_seconds(12.0);

    let ekf = sim.ekf();
    assert!(!ekf.control_status().contains(ControlStatus::GPS));
    assert!(!ekf.global_position_is_valid());
    assert_abs_diff_eq!(ekf.get_velocity(), Vector3::zeros(), epsilon = 0.1);
}
