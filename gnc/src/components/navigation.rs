use alloc::boxed::Box;
use defmt_or_log::{info, warn};

use crate::{
    Instant,
    common::Timestamped,
    component::{Component, Event},
    datatypes::{
        gnc::NavigationOutput,
        sensors::{AirspeedSample, AuxVelSample, BaroSample, ExtVisionSample, FlowMessage, GpsMessage, ImuSample, MagSample, RangeSample},
    },
    ekf::{Ekf, Parameters},
    hal::channel::{Receiver, Sender},
};

type Rx<'a, T> = Box<dyn Receiver<T> + Send + 'a>;

/// Channels feeding the estimator. Sensors the vehicle does not carry are
/// left as `None`.
pub struct NavigationHarness<'a> {
    pub rx_imu: Rx<'a, ImuSample>,
    pub rx_mag: Option<Rx<'a, MagSample>>,
    pub rx_baro: Option<Rx<'a, BaroSample>>,
    pub rx_gps: Option<Rx<'a, GpsMessage>>,
    pub rx_range: Option<Rx<'a, RangeSample>>,
    pub rx_airspeed: Option<Rx<'a, AirspeedSample>>,
    pub rx_flow: Option<Rx<'a, FlowMessage>>,
    pub rx_ext_vision: Option<Rx<'a, ExtVisionSample>>,
    pub rx_aux_vel: Option<Rx<'a, AuxVelSample>>,

    pub tx_nav_out: Box<dyn Sender<NavigationOutput> + Send + 'a>,
}

pub struct NavigationComponent<'a> {
    harness: NavigationHarness<'a>,
    ekf: Ekf,
    control_status_prev: u32,
}

fn drain<T>(rx: &mut Option<Rx<'_, T>>, mut f: impl FnMut(T)) {
    if let Some(rx) = rx {
        // Multiple or no samples may have been received this step
        while let Some(Timestamped { v, .. }) = rx.try_recv() {
            f(v);
        }
    }
}

impl<'a> NavigationComponent<'a> {
    pub fn new(harness: NavigationHarness<'a>, params: Parameters, now: Instant) -> Self {
        let mut ekf = Ekf::new(params);
        ekf.init(now.as_micros());

        Self {
            harness,
            ekf,
            control_status_prev: 0,
        }
    }

    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }

    fn ingest_observations(&mut self) {
        let ekf = &mut self.ekf;
        let h = &mut self.harness;

        drain(&mut h.rx_mag, |m| ekf.set_mag_data(m.time_us, m.mag));
        drain(&mut h.rx_baro, |b| ekf.set_baro_data(b.time_us, b.hgt));
        drain(&mut h.rx_gps, |g| ekf.set_gps_data(&g));
        drain(&mut h.rx_range, |r| ekf.set_range_data(r.time_us, r.rng));
        drain(&mut h.rx_airspeed, |a| ekf.set_airspeed_data(a.time_us, a.true_airspeed, a.eas2tas));
        drain(&mut h.rx_flow, |f| ekf.set_optical_flow_data(&f));
        drain(&mut h.rx_ext_vision, |ev| ekf.set_ext_vision_data(&ev));
        drain(&mut h.rx_aux_vel, |a| ekf.set_aux_vel_data(a.time_us, a.vel_ne, a.vel_var_ne));
    }

    fn log_status_change(&mut self) {
        let status = self.ekf.control_status().bits();
        if status != self.control_status_prev {
            info!("Navigation control status {} -> {}", self.control_status_prev, status);
            self.control_status_prev = status;
        }
    }
}

impl Component for NavigationComponent<'_> {
    fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Liftoff => self.ekf.set_in_air_status(true),
            Event::Landed => self.ekf.set_in_air_status(false),
            Event::FixedWing(fixed_wing) => self.ekf.set_fixed_wing(fixed_wing),
            Event::GroundEffect(active) => self.ekf.set_gnd_effect_flag(active),
            Event::FuseSideslip(fuse) => self.ekf.set_fuse_beta_flag(fuse),
            Event::GeoDeclination(deg) => self.ekf.set_geo_declination(deg),
            Event::Reset => {
                warn!("Navigation reset requested");
                self.ekf.init(now.as_micros());
            }
        }
    }

    fn step(&mut self, now: Instant) {
        self.ingest_observations();

        let mut advanced = false;
        while let Some(Timestamped { v: imu, .. }) = self.harness.rx_imu.try_recv() {
            self.ekf.set_imu_data(&imu);
            advanced |= self.ekf.update();
        }

        if advanced {
            self.log_status_change();

            if self.harness.tx_nav_out.try_send(now, self.ekf.navigation_output()).is_err() {
                warn!("Navigation output dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::Ts, hal::channel::spsc_channel};
    use heapless::spsc::Queue;
    use nalgebra::Vector3;

    const GRAVITY: f32 = 9.80665;

    fn imu(time_us: u64) -> ImuSample {
        ImuSample {
            delta_ang: Vector3::zeros(),
            delta_vel: Vector3::new(0.0, 0.0, -GRAVITY * 0.005),
            delta_ang_dt: 0.005,
            delta_vel_dt: 0.005,
            time_us,
        }
    }

    #[test]
    fn test_publishes_once_initialised() {
        let mut imu_q: Queue<Ts<ImuSample>, 512> = Queue::new();
        let mut mag_q: Queue<Ts<MagSample>, 64> = Queue::new();
        let mut baro_q: Queue<Ts<BaroSample>, 64> = Queue::new();
        let mut out_q: Queue<Ts<NavigationOutput>, 512> = Queue::new();

        let (mut tx_imu, rx_imu) = spsc_channel(&mut imu_q);
        let (mut tx_mag, rx_mag) = spsc_channel(&mut mag_q);
        let (mut tx_baro, rx_baro) = spsc_channel(&mut baro_q);
        let (tx_out, mut rx_out) = spsc_channel(&mut out_q);

        let harness = NavigationHarness {
            rx_imu: Box::new(rx_imu),
            rx_mag: Some(Box::new(rx_mag)),
            rx_baro: Some(Box::new(rx_baro)),
            rx_gps: None,
            rx_range: None,
            rx_airspeed: None,
            rx_flow: None,
            rx_ext_vision: None,
            rx_aux_vel: None,
            tx_nav_out: Box::new(tx_out),
        };
        let mut nav = NavigationComponent::new(harness, Parameters::default(), Instant::from_micros(0));

        let mut published = 0;
        for step in 1..=400u64 {
            let t = step * 5_000;
            let now = Instant::from_micros(t);
            tx_imu.try_send(now, imu(t)).unwrap();
            if step % 4 == 0 {
                tx_mag
                    .try_send(now, MagSample {
                        mag: Vector3::new(0.2, 0.0, 0.4),
                        time_us: t,
                    })
                    .unwrap();
                tx_baro.try_send(now, BaroSample { hgt: 10.0, time_us: t }).unwrap();
            }

            nav.step(now);
            while rx_out.try_recv().is_some() {
                published += 1;
            }
        }

        assert!(nav.ekf().filter_initialised());
        assert!(published > 0);
    }

    #[test]
    fn test_events_reach_estimator() {
        let mut imu_q: Queue<Ts<ImuSample>, 4> = Queue::new();
        let mut out_q: Queue<Ts<NavigationOutput>, 4> = Queue::new();
        let (_, rx_imu) = spsc_channel(&mut imu_q);
        let (tx_out, _) = spsc_channel(&mut out_q);

        let harness = NavigationHarness {
            rx_imu: Box::new(rx_imu),
            rx_mag: None,
            rx_baro: None,
            rx_gps: None,
            rx_range: None,
            rx_airspeed: None,
            rx_flow: None,
            rx_ext_vision: None,
            rx_aux_vel: None,
            tx_nav_out: Box::new(tx_out),
        };
        let mut nav = NavigationComponent::new(harness, Parameters::default(), Instant::from_micros(0));
        let now = Instant::from_micros(1_000);

        nav.handle_event(Event::Liftoff, now);
        nav.handle_event(Event::FixedWing(true), now);

        let status = nav.ekf().control_status();
        assert!(status.contains(crate::ekf::status::ControlStatus::IN_AIR));
        assert!(status.contains(crate::ekf::status::ControlStatus::FIXED_WING));
    }
}
