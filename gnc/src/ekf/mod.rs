//! Delayed fusion time horizon navigation filter.
//!
//! Sensor samples are buffered and fused at a horizon that lags the newest IMU
//! sample by the largest configured sensor delay. An output predictor carries
//! the corrected delayed state forward to the current time at the full IMU
//! rate.

pub mod params;
pub mod states;
pub mod status;

mod control;
mod covariance;
mod decision;
mod fuse;
mod fusion;
mod gps_checks;
mod imu_down_sampler;
mod init;
mod interface;
mod monitor;
mod output;
mod predict;
mod reset;
mod terrain;

use defmt_or_log::error;
use nalgebra::{Matrix3, Vector2, Vector3};
#[cfg(not(feature = "std"))]
use num_traits::Float;

use crate::{
    common::geo::MapProjection,
    datatypes::{
        gnc::StateSample,
        sensors::{
            AirspeedSample, AuxVelSample, BaroSample, DragSample, ExtVisionSample, FlowSample,
            GpsSample, ImuSample, MagSample, RangeSample,
        },
    },
};

pub use decision::{HeightSource, MagMode};
pub use fusion::{FusionError, Innovations};
pub use gps_checks::GpsDriftMetrics;
pub use params::Parameters;
use fuse::DirectObservations;
use gps_checks::GpsChecks;
use imu_down_sampler::ImuDownSampler;
use init::InitAccumulators;
use interface::{DragAccumulator, SampleAverager, SensorArrivals, SensorBuffers};
use output::OutputPredictor;
use states::Covariance;
use status::{ControlStatus, FaultStatus, InnovationFaultStatus, SensorTimeouts, StateResetStatus};
use terrain::TerrainEstimator;

/// Storage of the IMU and output observer buffers
pub(crate) const IMU_BUFFER_CAP: usize = 64;
/// Storage of each observation buffer
pub(crate) const OBS_BUFFER_CAP: usize = 32;

/// Sea level air density at 15 degC (kg/m^3)
pub const AIR_DENSITY_SEA_LEVEL_KG_M3: f32 = 1.225;

/// Settings supplied by the host at runtime rather than through [`Parameters`].
/// They survive a filter reinitialisation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HostSettings {
    min_gps_health_time_us: u64,
    flow_max_rate: f32,
    flow_min_distance: f32,
    flow_max_distance: f32,
    air_density: f32,
    /// Declination at the current location (deg), when known
    geo_declination_deg: Option<f32>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            min_gps_health_time_us: 10_000_000,
            flow_max_rate: 1.0,
            flow_min_distance: 0.0,
            flow_max_distance: 10.0,
            air_density: AIR_DENSITY_SEA_LEVEL_KG_M3,
            geo_declination_deg: None,
        }
    }
}

pub struct Ekf {
    params: Parameters,
    host: HostSettings,

    // Sample ingestion
    buffers: SensorBuffers,
    imu_buffer_length: usize,
    obs_buffer_length: usize,
    initialised: bool,
    filter_initialised: bool,
    imu_updated: bool,
    imu_down_sampler: ImuDownSampler,
    newest_high_rate_imu: ImuSample,
    imu_sample_new: ImuSample,
    imu_sample_delayed: ImuSample,
    time_last_imu: u64,
    dt_imu_avg: f32,
    dt_ekf_avg: f32,
    min_obs_interval_us: u64,
    arrivals: SensorArrivals,
    mag_averager: SampleAverager<Vector3<f32>>,
    baro_averager: SampleAverager<f32>,
    drag_accumulator: DragAccumulator,
    gps_speed_valid: bool,

    // Samples at the fusion time horizon
    gps_sample_delayed: GpsSample,
    mag_sample_delayed: MagSample,
    baro_sample_delayed: BaroSample,
    range_sample_delayed: RangeSample,
    airspeed_sample_delayed: AirspeedSample,
    flow_sample_delayed: FlowSample,
    ev_sample_delayed: ExtVisionSample,
    drag_sample_delayed: DragSample,
    aux_vel_sample_delayed: AuxVelSample,

    gps_data_ready: bool,
    mag_data_ready: bool,
    baro_data_ready: bool,
    range_data_ready: bool,
    flow_data_ready: bool,
    ev_data_ready: bool,
    tas_data_ready: bool,

    // Filter state
    state: StateSample,
    p: Covariance,
    r_to_earth: Matrix3<f32>,
    earth_rate_ned: Vector3<f32>,
    earth_rate_initialised: bool,
    accel_lpf_ne: Vector2<f32>,
    ang_rate_mag_filt: f32,
    accel_mag_filt: f32,
    accel_bias_inhibit: [bool; 3],
    time_acc_bias_check: u64,
    saved_mag_variance: [f32; 6],

    output: OutputPredictor,

    // Status reporting
    control_status: ControlStatus,
    control_status_prev: ControlStatus,
    fault_status: FaultStatus,
    innov_check_fail_status: InnovationFaultStatus,
    state_reset_status: StateResetStatus,
    sensor_timeouts: SensorTimeouts,
    innov: Innovations,

    // Direct state observation requests for this cycle
    obs: DirectObservations,
    fuse_hpos_as_odom: bool,
    hpos_pred_prev: Vector2<f32>,
    pos_meas_prev: Vector3<f32>,
    hpos_prev_available: bool,
    last_known_pos_ne: Vector2<f32>,
    using_synthetic_position: bool,

    time_last_pos_fuse: u64,
    time_last_delpos_fuse: u64,
    time_last_vel_fuse: u64,
    time_last_hgt_fuse: u64,
    time_last_of_fuse: u64,
    time_last_arsp_fuse: u64,
    time_last_beta_fuse: u64,
    time_last_fake_pos: u64,

    // Height
    primary_hgt_source: params::VdistSensor,
    hgt_sensor_offset: f32,
    baro_hgt_offset: f32,
    delta_time_baro_us: u64,
    baro_hgt_faulty: bool,
    gps_hgt_faulty: bool,
    rng_hgt_faulty: bool,
    in_range_aid_mode: bool,
    r_rng_to_earth_2_2: f32,
    sin_tilt_rng: f32,
    cos_tilt_rng: f32,
    time_last_rng_ready: u64,
    rng_check_min_val: f32,
    rng_check_max_val: f32,
    time_last_gnd_effect_on: u64,
    bad_vert_accel_detected: bool,
    time_bad_vert_accel: u64,
    time_good_vert_accel: u64,

    // GPS and global origin
    gps_checks: GpsChecks,
    pos_ref: MapProjection,
    gps_alt_ref: f32,
    ned_origin_initialised: bool,
    gps_origin_eph: f32,
    gps_origin_epv: f32,
    last_gps_origin_time_us: u64,

    // Magnetometer
    mag_declination: f32,
    mag_declination_gps: f32,
    flt_mag_align_complete: bool,
    flt_mag_align_start_time: Option<u64>,
    num_bad_flight_yaw_events: u8,
    last_on_ground_pos_d: f32,
    yaw_angle_observable: bool,
    mag_bias_observable: bool,
    time_yaw_started: u64,
    time_last_movement: u64,
    yaw_delta_ef: f32,
    yaw_rate_lpf_ef: f32,

    // Optical flow
    flow_gyro_bias: Vector3<f32>,
    imu_del_ang_of: Vector3<f32>,
    delta_time_of: f32,

    // External vision frame alignment
    ev_rot_mat: Matrix3<f32>,
    ev_rot_vec_filt: Vector3<f32>,
    ev_rot_last_time_us: u64,

    terrain: TerrainEstimator,
    init_acc: InitAccumulators,

    is_dead_reckoning: bool,
    is_wind_dead_reckoning: bool,
    time_ins_deadreckon_start: u64,
    deadreckon_time_exceeded: bool,
}

impl Ekf {
    pub fn new(params: Parameters) -> Self {
        let filter_period_s = params.filter_update_period_us as f32 * 1e-6;
        let primary_hgt_source = params.vdist_sensor_type;
        let rng_sens_pitch = params.rng_sens_pitch;
        let mag_declination = params.mag_declination_deg.to_radians();

        Self {
            imu_down_sampler: ImuDownSampler::new(filter_period_s),
            params,
            host: HostSettings::default(),

            buffers: SensorBuffers::default(),
            imu_buffer_length: 0,
            obs_buffer_length: 0,
            initialised: false,
            filter_initialised: false,
            imu_updated: false,
            newest_high_rate_imu: ImuSample::default(),
            imu_sample_new: ImuSample::default(),
            imu_sample_delayed: ImuSample::default(),
            time_last_imu: 0,
            dt_imu_avg: filter_period_s,
            dt_ekf_avg: filter_period_s,
            min_obs_interval_us: 0,
            arrivals: SensorArrivals::default(),
            mag_averager: SampleAverager::default(),
            baro_averager: SampleAverager::default(),
            drag_accumulator: DragAccumulator::default(),
            gps_speed_valid: false,

            gps_sample_delayed: GpsSample::default(),
            mag_sample_delayed: MagSample::default(),
            baro_sample_delayed: BaroSample::default(),
            range_sample_delayed: RangeSample::default(),
            airspeed_sample_delayed: AirspeedSample::default(),
            flow_sample_delayed: FlowSample::default(),
            ev_sample_delayed: ExtVisionSample::default(),
            drag_sample_delayed: DragSample::default(),
            aux_vel_sample_delayed: AuxVelSample::default(),

            gps_data_ready: false,
            mag_data_ready: false,
            baro_data_ready: false,
            range_data_ready: false,
            flow_data_ready: false,
            ev_data_ready: false,
            tas_data_ready: false,

            state: StateSample::default(),
            p: Covariance::zeros(),
            r_to_earth: Matrix3::identity(),
            earth_rate_ned: Vector3::zeros(),
            earth_rate_initialised: false,
            accel_lpf_ne: Vector2::zeros(),
            ang_rate_mag_filt: 0.0,
            accel_mag_filt: 0.0,
            accel_bias_inhibit: [false; 3],
            time_acc_bias_check: 0,
            saved_mag_variance: [0.0; 6],

            output: OutputPredictor::default(),

            control_status: ControlStatus::empty(),
            control_status_prev: ControlStatus::empty(),
            fault_status: FaultStatus::empty(),
            innov_check_fail_status: InnovationFaultStatus::empty(),
            state_reset_status: StateResetStatus::default(),
            sensor_timeouts: SensorTimeouts::empty(),
            innov: Innovations::default(),

            obs: DirectObservations::default(),
            fuse_hpos_as_odom: false,
            hpos_pred_prev: Vector2::zeros(),
            pos_meas_prev: Vector3::zeros(),
            hpos_prev_available: false,
            last_known_pos_ne: Vector2::zeros(),
            using_synthetic_position: false,

            time_last_pos_fuse: 0,
            time_last_delpos_fuse: 0,
            time_last_vel_fuse: 0,
            time_last_hgt_fuse: 0,
            time_last_of_fuse: 0,
            time_last_arsp_fuse: 0,
            time_last_beta_fuse: 0,
            time_last_fake_pos: 0,

            primary_hgt_source,
            hgt_sensor_offset: 0.0,
            baro_hgt_offset: 0.0,
            delta_time_baro_us: 0,
            baro_hgt_faulty: false,
            gps_hgt_faulty: false,
            rng_hgt_faulty: false,
            in_range_aid_mode: false,
            r_rng_to_earth_2_2: 1.0,
            sin_tilt_rng: rng_sens_pitch.sin(),
            cos_tilt_rng: rng_sens_pitch.cos(),
            time_last_rng_ready: 0,
            rng_check_min_val: 0.0,
            rng_check_max_val: 0.0,
            time_last_gnd_effect_on: 0,
            bad_vert_accel_detected: false,
            time_bad_vert_accel: 0,
            time_good_vert_accel: 0,

            gps_checks: GpsChecks::default(),
            pos_ref: MapProjection::default(),
            gps_alt_ref: 0.0,
            ned_origin_initialised: false,
            gps_origin_eph: 0.0,
            gps_origin_epv: 0.0,
            last_gps_origin_time_us: 0,

            mag_declination,
            mag_declination_gps: mag_declination,
            flt_mag_align_complete: false,
            flt_mag_align_start_time: None,
            num_bad_flight_yaw_events: 0,
            last_on_ground_pos_d: 0.0,
            yaw_angle_observable: false,
            mag_bias_observable: false,
            time_yaw_started: 0,
            time_last_movement: 0,
            yaw_delta_ef: 0.0,
            yaw_rate_lpf_ef: 0.0,

            flow_gyro_bias: Vector3::zeros(),
            imu_del_ang_of: Vector3::zeros(),
            delta_time_of: 0.0,

            ev_rot_mat: Matrix3::identity(),
            ev_rot_vec_filt: Vector3::zeros(),
            ev_rot_last_time_us: 0,

            terrain: TerrainEstimator::default(),
            init_acc: InitAccumulators::default(),

            is_dead_reckoning: false,
            is_wind_dead_reckoning: false,
            time_ins_deadreckon_start: 0,
            deadreckon_time_exceeded: true,
        }
    }

    /// Resets every state, flag, timer and buffer and sizes the buffers from
    /// the configured delays. Host settings are kept.
    pub fn init(&mut self, time_us: u64) {
        let host = self.host;
        let was_in_air = self.control_status.contains(ControlStatus::IN_AIR);
        let was_fixed_wing = self.control_status.contains(ControlStatus::FIXED_WING);

        *self = Self::new(self.params.clone());
        self.host = host;
        self.control_status.set(ControlStatus::IN_AIR, was_in_air);
        self.control_status.set(ControlStatus::FIXED_WING, was_fixed_wing);

        self.allocate_buffers();
        self.initialised = true;

        self.time_last_imu = time_us;
        self.time_last_hgt_fuse = time_us;
        self.time_last_pos_fuse = time_us;
        self.time_last_vel_fuse = time_us;
        self.time_good_vert_accel = time_us;
        self.time_ins_deadreckon_start = time_us;
    }

    /// Runs one estimator cycle. Prediction and fusion only advance when a
    /// down-sampled IMU interval completed since the last call, the output
    /// predictor runs on every IMU sample once the filter is initialised.
    ///
    /// Returns true when the delayed state advanced and the solution is finite.
    pub fn update(&mut self) -> bool {
        if !self.initialised {
            return false;
        }

        if !self.filter_initialised {
            self.filter_initialised = self.initialise_filter();

            if !self.filter_initialised {
                self.imu_updated = false;
                return false;
            }
        }

        let advanced = self.imu_updated;

        if advanced {
            self.predict_state();

            if !self.state.is_finite() {
                error!("EKF state is not finite, reinitialising");
                self.init(self.time_last_imu);
                return false;
            }

            self.predict_covariance();
            self.control_fusion_modes();
            self.run_terrain_estimator();
        }

        self.calculate_output_states();
        self.imu_updated = false;

        advanced && self.state.is_finite()
    }
}
