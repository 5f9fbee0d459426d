use std::{env, fs, fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use nalgebra::{Vector2, Vector3};
use nav_gnc::{Parameters, ekf::params::FusionMode};
use nav_sim::{
    ekf_params::{load_parameters, save_declination},
    logging::OutputLogger,
    parameters::parse_string,
    sim::{Sensor, SensorSimulator},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Stationary on ground with IMU, baro and magnetometer
    Static,
    /// Stationary on ground, GPS aiding
    Gps,
    /// Hovering above flat ground with optical flow and a range finder
    Flow,
    /// Moving indoors with external vision position and yaw
    Vision,
    /// Fixed wing cruise with GPS and airspeed
    FixedWing,
}

#[derive(Parser, Debug)]
#[command(version, about = "Runs the navigation filter against simulated sensors", long_about = None)]
struct Args {
    #[arg(value_enum)]
    scenario: Scenario,

    #[arg(short, long, default_value_t = 30.0)]
    duration_s: f32,

    #[arg(short, long, default_value = "config/params.toml")]
    params: PathBuf,

    #[arg(short, long, default_value = "nav_output.csv")]
    output: PathBuf,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the learned magnetic declination back to the parameter file
    #[arg(long)]
    save_declination: bool,
}

fn setup(scenario: Scenario, mut params: Parameters, seed: u64) -> SensorSimulator {
    match scenario {
        Scenario::Flow => params.fusion_mode = FusionMode::USE_OF,
        Scenario::Vision => params.fusion_mode = FusionMode::USE_EVPOS | FusionMode::USE_EVYAW,
        _ => {}
    }

    let mut sim = SensorSimulator::new(params, seed);
    {
        let errors = sim.errors_mut();
        errors.accel_noise = 0.05;
        errors.gyro_noise = 1e-3;
        errors.baro_noise = 0.1;
        errors.mag_noise = 1e-3;
        errors.gps_pos_noise = 0.2;
        errors.gps_vel_noise = 0.05;
        errors.range_noise = 0.01;
    }

    match scenario {
        Scenario::Static => {}
        Scenario::Gps => sim.start(Sensor::Gps),
        Scenario::Flow => {
            sim.truth_mut().pos_ned = Vector3::new(0.0, 0.0, -2.0);
            sim.ekf_mut().set_in_air_status(true);
            sim.start(Sensor::Range);
            sim.start(Sensor::Flow);
        }
        Scenario::Vision => {
            sim.truth_mut().vel_ned = Vector3::new(0.5, 0.0, 0.0);
            sim.start(Sensor::ExtVision);
        }
        Scenario::FixedWing => {
            sim.truth_mut().pos_ned = Vector3::new(0.0, 0.0, -100.0);
            sim.truth_mut().vel_ned = Vector3::new(15.0, 0.0, 0.0);
            sim.truth_mut().wind_ne = Vector2::new(2.0, 1.0);
            sim.ekf_mut().set_in_air_status(true);
            sim.ekf_mut().set_fixed_wing(true);
            sim.start(Sensor::Gps);
            sim.start(Sensor::Airspeed);
        }
    }

    sim
}

fn main() -> Result<()> {
    // Default log level to "info"
    if env::var("RUST_LOG").is_err() {
        unsafe { env::set_var("RUST_LOG", "info") }
    }
    pretty_env_logger::init();

    let args = Args::parse();

    let params_toml =
        fs::read_to_string(&args.params).with_context(|| format!("Reading {}", args.params.display()))?;
    let mut param_tree = parse_string(&params_toml)?;
    let params = load_parameters(&param_tree)?;

    info!("Running {:?} scenario for {} s", args.scenario, args.duration_s);
    let mut sim = setup(args.scenario, params, args.seed);

    let out = File::create(&args.output).with_context(|| format!("Creating {}", args.output.display()))?;
    let mut logger = OutputLogger::new(out);
    let mut log_result = Ok(());

    sim.run_seconds_with(args.duration_s, |time_us, ekf| {
        if log_result.is_ok() {
            log_result = logger.log(time_us, ekf);
        }
    });
    log_result?;

    let rows = logger.rows();
    logger.finish()?;
    info!("Wrote {} rows to {}", rows, args.output.display());

    let ekf = sim.ekf();
    let pos = ekf.get_position();
    let vel = ekf.get_velocity();
    info!(
        "Final position [{:.3}, {:.3}, {:.3}] m, velocity [{:.3}, {:.3}, {:.3}] m/s",
        pos.x, pos.y, pos.z, vel.x, vel.y, vel.z
    );
    if !ekf.local_position_is_valid() {
        warn!("Local position is not valid at the end of the run");
    }

    if args.save_declination {
        if save_declination(&mut param_tree, ekf.mag_declination_to_save())? {
            fs::write(&args.params, toml::to_string(&param_tree.to_toml()?)?)?;
            info!("Saved magnetic declination to {}", args.params.display());
        } else {
            warn!("No declination available to save");
        }
    }

    Ok(())
}
