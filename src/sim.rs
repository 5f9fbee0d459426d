//! Synthetic sensors driving the estimator from a simple vehicle truth model.
//!
//! The vehicle is either stationary or moves at constant velocity with a
//! fixed attitude. Every sensor has its own rate and can be started or stopped
//! independently. Samples are generated in time order: all non-IMU samples due
//! at a tick are pushed before the IMU sample that advances the estimator.
//!
//! Position dependent samples observe the truth at `now - delay`, with the
//! delay taken from the estimator tuning.

use log::info;
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use nav_gnc::{
    Ekf, Parameters,
    common::{geo::MapProjection, math::GRAVITY_M_S2},
    datatypes::sensors::{ExtVisionSample, FlowMessage, GpsMessage, ImuSample},
};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256StarStar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Imu,
    Baro,
    Mag,
    Gps,
    Range,
    Flow,
    Airspeed,
    ExtVision,
}

const SENSORS: [Sensor; 8] = [
    Sensor::Imu,
    Sensor::Baro,
    Sensor::Mag,
    Sensor::Gps,
    Sensor::Range,
    Sensor::Flow,
    Sensor::Airspeed,
    Sensor::ExtVision,
];

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleTruth {
    /// Position at time zero (m, NED)
    pub pos_ned: Vector3<f32>,
    pub vel_ned: Vector3<f32>,
    /// Body to NED rotation
    pub attitude: UnitQuaternion<f32>,
    pub wind_ne: Vector2<f32>,
    /// Down coordinate of the ground below the vehicle (m)
    pub terrain_d: f32,
}

impl Default for VehicleTruth {
    fn default() -> Self {
        Self {
            pos_ned: Vector3::zeros(),
            vel_ned: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            wind_ne: Vector2::zeros(),
            terrain_d: 0.0,
        }
    }
}

impl VehicleTruth {
    pub fn pos_at(&self, time_us: u64) -> Vector3<f32> {
        self.pos_ned + self.vel_ned * (time_us as f32 * 1e-6)
    }

    fn range_at(&self, time_us: u64) -> f32 {
        let cos_tilt = self.attitude.to_rotation_matrix()[(2, 2)];
        (self.terrain_d - self.pos_at(time_us).z) / cos_tilt
    }
}

/// Sensor errors. Noise values are standard deviations of each sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorErrors {
    pub accel_bias: Vector3<f32>,
    pub gyro_bias: Vector3<f32>,
    pub accel_noise: f32,
    pub gyro_noise: f32,
    pub baro_noise: f32,
    pub mag_noise: f32,
    pub gps_pos_noise: f32,
    pub gps_vel_noise: f32,
    pub range_noise: f32,
    pub airspeed_noise: f32,
    pub ev_pos_noise: f32,
}

impl Default for SensorErrors {
    fn default() -> Self {
        Self {
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_noise: 0.0,
            gyro_noise: 0.0,
            baro_noise: 0.0,
            mag_noise: 0.0,
            gps_pos_noise: 0.0,
            gps_vel_noise: 0.0,
            range_noise: 0.0,
            airspeed_noise: 0.0,
            ev_pos_noise: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpsReceiver {
    pub origin_lat_deg: f64,
    pub origin_lon_deg: f64,
    pub origin_alt_m: f32,
    pub fix_type: u8,
    pub nsats: u8,
    pub eph: f32,
    pub epv: f32,
    pub sacc: f32,
    pub gdop: f32,
}

impl Default for GpsReceiver {
    fn default() -> Self {
        Self {
            origin_lat_deg: 47.3977,
            origin_lon_deg: 8.5456,
            origin_alt_m: 488.0,
            fix_type: 3,
            nsats: 16,
            eph: 0.5,
            epv: 0.8,
            sacc: 0.2,
            gdop: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    period_us: u64,
    next_us: u64,
    running: bool,
}

impl Schedule {
    fn new(rate_hz: f32) -> Self {
        Self {
            period_us: period_us(rate_hz),
            next_us: 0,
            running: false,
        }
    }

    fn due(&mut self, now: u64) -> bool {
        if !self.running || now < self.next_us {
            return false;
        }

        self.next_us += self.period_us;
        if self.next_us <= now {
            self.next_us = now + self.period_us;
        }
        true
    }
}

fn period_us(rate_hz: f32) -> u64 {
    (1e6 / rate_hz.max(1e-3)).round() as u64
}

#[derive(Debug, Clone, Copy)]
struct Delays {
    baro: u64,
    gps: u64,
    range: u64,
    flow: u64,
    ev: u64,
}

impl Delays {
    fn from_params(params: &Parameters) -> Self {
        let us = |ms: f32| (ms.max(0.0) * 1000.0) as u64;
        Self {
            baro: us(params.baro_delay_ms),
            gps: us(params.gps_delay_ms),
            range: us(params.range_delay_ms),
            flow: us(params.flow_delay_ms),
            ev: us(params.ev_delay_ms),
        }
    }
}

pub struct SensorSimulator {
    ekf: Ekf,
    time_us: u64,
    truth: VehicleTruth,
    errors: SensorErrors,
    gps: GpsReceiver,
    /// Earth field (Gauss, NED)
    mag_earth: Vector3<f32>,
    delays: Delays,
    schedules: [Schedule; 8],
    rng: Xoshiro256StarStar,
}

impl SensorSimulator {
    /// IMU, baro and magnetometer start running, the other sensors are
    /// started on demand.
    pub fn new(params: Parameters, seed: u64) -> Self {
        let delays = Delays::from_params(&params);
        let mut ekf = Ekf::new(params);
        ekf.init(0);

        let mut schedules = [
            Schedule::new(1000.0),
            Schedule::new(50.0),
            Schedule::new(50.0),
            Schedule::new(5.0),
            Schedule::new(30.0),
            Schedule::new(50.0),
            Schedule::new(20.0),
            Schedule::new(30.0),
        ];
        for s in schedules.iter_mut().take(3) {
            s.running = true;
        }

        Self {
            ekf,
            time_us: 0,
            truth: VehicleTruth::default(),
            errors: SensorErrors::default(),
            gps: GpsReceiver::default(),
            mag_earth: Vector3::new(0.2, 0.0, 0.4),
            delays,
            schedules,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
        }
    }

    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }

    pub fn ekf_mut(&mut self) -> &mut Ekf {
        &mut self.ekf
    }

    pub fn time_us(&self) -> u64 {
        self.time_us
    }

    pub fn truth(&self) -> &VehicleTruth {
        &self.truth
    }

    pub fn truth_mut(&mut self) -> &mut VehicleTruth {
        &mut self.truth
    }

    pub fn errors_mut(&mut self) -> &mut SensorErrors {
        &mut self.errors
    }

    pub fn gps_mut(&mut self) -> &mut GpsReceiver {
        &mut self.gps
    }

    fn schedule(&mut self, sensor: Sensor) -> &mut Schedule {
        let idx = SENSORS.iter().position(|s| *s == sensor).unwrap_or(0);
        &mut self.schedules[idx]
    }

    pub fn start(&mut self, sensor: Sensor) {
        let now = self.time_us;
        let schedule = self.schedule(sensor);
        if !schedule.running {
            schedule.running = true;
            schedule.next_us = now;
            info!("Simulated {:?} started at {:.2} s", sensor, now as f64 * 1e-6);
        }
    }

    pub fn stop(&mut self, sensor: Sensor) {
        let now = self.time_us;
        let schedule = self.schedule(sensor);
        if schedule.running {
            schedule.running = false;
            info!("Simulated {:?} stopped at {:.2} s", sensor, now as f64 * 1e-6);
        }
    }

    pub fn set_rate_hz(&mut self, sensor: Sensor, rate_hz: f32) {
        self.schedule(sensor).period_us = period_us(rate_hz);
    }

    pub fn run_seconds(&mut self, seconds: f32) {
        self.run_seconds_with(seconds, |_, _| {});
    }

    /// Runs the simulation, calling `on_update` with the current time after
    /// every estimator cycle.
    pub fn run_seconds_with(&mut self, seconds: f32, mut on_update: impl FnMut(u64, &Ekf)) {
        let end_us = self.time_us + (seconds.max(0.0) * 1e6) as u64;
        let imu_period_us = self.schedules[0].period_us;

        while self.time_us + imu_period_us <= end_us {
            self.time_us += imu_period_us;
            let now = self.time_us;

            for (idx, sensor) in SENSORS.iter().enumerate().skip(1) {
                if self.schedules[idx].due(now) {
                    self.push_sample(*sensor, now);
                }
            }

            if self.schedules[0].due(now) {
                let imu = self.imu_sample(now, imu_period_us);
                self.ekf.set_imu_data(&imu);
                if self.ekf.update() {
                    on_update(now, &self.ekf);
                }
            }
        }
    }

    fn noise(&mut self, std: f32) -> f32 {
        if std > 0.0 {
            Normal::new(0.0, std).map_or(0.0, |n| n.sample(&mut self.rng))
        } else {
            0.0
        }
    }

    fn noise3(&mut self, std: f32) -> Vector3<f32> {
        Vector3::new(self.noise(std), self.noise(std), self.noise(std))
    }

    fn imu_sample(&mut self, now: u64, period_us: u64) -> ImuSample {
        let dt = period_us as f32 * 1e-6;
        let gravity = Vector3::new(0.0, 0.0, GRAVITY_M_S2);

        let specific_force = self.truth.attitude.inverse_transform_vector(&(-gravity));
        let accel = specific_force + self.errors.accel_bias + self.noise3(self.errors.accel_noise);
        let gyro = self.errors.gyro_bias + self.noise3(self.errors.gyro_noise);

        ImuSample {
            delta_ang: gyro * dt,
            delta_vel: accel * dt,
            delta_ang_dt: dt,
            delta_vel_dt: dt,
            time_us: now,
        }
    }

    fn push_sample(&mut self, sensor: Sensor, now: u64) {
        let d = self.delays;
        match sensor {
            Sensor::Imu => {}
            Sensor::Baro => {
                let hgt = -self.truth.pos_at(now.saturating_sub(d.baro)).z + self.noise(self.errors.baro_noise);
                self.ekf.set_baro_data(now, hgt);
            }
            Sensor::Mag => {
                let mag = self.truth.attitude.inverse_transform_vector(&self.mag_earth)
                    + self.noise3(self.errors.mag_noise);
                self.ekf.set_mag_data(now, mag);
            }
            Sensor::Gps => {
                let msg = self.gps_message(now, now.saturating_sub(d.gps));
                self.ekf.set_gps_data(&msg);
            }
            Sensor::Range => {
                let rng = self.truth.range_at(now.saturating_sub(d.range)) + self.noise(self.errors.range_noise);
                self.ekf.set_range_data(now, rng);
            }
            Sensor::Flow => {
                let dt_us = self.schedule(Sensor::Flow).period_us;
                let msg = self.flow_message(now, now.saturating_sub(d.flow), dt_us);
                self.ekf.set_optical_flow_data(&msg);
            }
            Sensor::Airspeed => {
                let wind = Vector3::new(self.truth.wind_ne.x, self.truth.wind_ne.y, 0.0);
                let tas = (self.truth.vel_ned - wind).norm() + self.noise(self.errors.airspeed_noise);
                self.ekf.set_airspeed_data(now, tas, 1.0);
            }
            Sensor::ExtVision => {
                let pos = self.truth.pos_at(now.saturating_sub(d.ev)) + self.noise3(self.errors.ev_pos_noise);
                let ev = ExtVisionSample {
                    pos_ned: pos,
                    quat: self.truth.attitude,
                    pos_err: self.errors.ev_pos_noise.max(0.05),
                    ang_err: 0.05,
                    vel_ned: self.truth.vel_ned,
                    vel_err: 0.1,
                    time_us: now,
                };
                self.ekf.set_ext_vision_data(&ev);
            }
        }
    }

    fn gps_message(&mut self, now: u64, measured_us: u64) -> GpsMessage {
        let g = self.gps.clone();
        let pos = self.truth.pos_at(measured_us) + self.noise3(self.errors.gps_pos_noise);
        let vel = self.truth.vel_ned + self.noise3(self.errors.gps_vel_noise);

        let origin = MapProjection::new(g.origin_lat_deg, g.origin_lon_deg, 0);
        let (lat_deg, lon_deg) = origin.reproject(pos.x as f64, pos.y as f64);
        let alt_m = g.origin_alt_m - pos.z;

        GpsMessage {
            time_usec: now,
            lat: (lat_deg * 1e7).round() as i32,
            lon: (lon_deg * 1e7).round() as i32,
            alt: (alt_m * 1000.0).round() as i32,
            fix_type: g.fix_type,
            eph: g.eph,
            epv: g.epv,
            sacc: g.sacc,
            vel_m_s: vel.xy().norm(),
            vel_ned: vel,
            vel_ned_valid: true,
            nsats: g.nsats,
            gdop: g.gdop,
        }
    }

    fn flow_message(&mut self, now: u64, measured_us: u64, dt_us: u64) -> FlowMessage {
        let dt = dt_us as f32 * 1e-6;
        let range = self.truth.range_at(measured_us);
        let vel_body = self.truth.attitude.inverse_transform_vector(&self.truth.vel_ned);
        let body_rate = Vector2::zeros();

        let los_rate = if range > 0.0 {
            Vector2::new(vel_body.y / range, -vel_body.x / range)
        } else {
            Vector2::zeros()
        };

        FlowMessage {
            time_us: now,
            quality: 255,
            flowdata: -(los_rate + body_rate) * dt,
            gyrodata: -Vector3::new(body_rate.x, body_rate.y, 0.0) * dt,
            dt_us: dt_us as u32,
        }
    }
}
