//! CSV output of the navigation solution.

use std::io::Write;

use anyhow::Result;
use log::info;
use nav_gnc::Ekf;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutputRecord {
    pub time_us: u64,
    pub q_w: f32,
    pub q_x: f32,
    pub q_y: f32,
    pub q_z: f32,
    pub pos_n: f32,
    pub pos_e: f32,
    pub pos_d: f32,
    pub vel_n: f32,
    pub vel_e: f32,
    pub vel_d: f32,
    pub control_status: u32,
    pub solution_status: u16,
}

impl OutputRecord {
    pub fn from_ekf(time_us: u64, ekf: &Ekf) -> Self {
        let out = ekf.navigation_output();
        let q = out.quat_nb.quaternion();

        Self {
            time_us,
            q_w: q.w,
            q_x: q.i,
            q_y: q.j,
            q_z: q.k,
            pos_n: out.pos_n_m.x,
            pos_e: out.pos_n_m.y,
            pos_d: out.pos_n_m.z,
            vel_n: out.vel_n_m_s.x,
            vel_e: out.vel_n_m_s.y,
            vel_d: out.vel_n_m_s.z,
            control_status: out.control_status,
            solution_status: out.solution_status,
        }
    }
}

/// Writes one row per estimator cycle and reports control status changes.
pub struct OutputLogger<W: Write> {
    writer: csv::Writer<W>,
    last_status: Option<u32>,
    rows: usize,
}

impl<W: Write> OutputLogger<W> {
    pub fn new(out: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(out),
            last_status: None,
            rows: 0,
        }
    }

    pub fn log(&mut self, time_us: u64, ekf: &Ekf) -> Result<()> {
        let record = OutputRecord::from_ekf(time_us, ekf);

        if self.last_status != Some(record.control_status) {
            info!(
                "{:.2} s: control status {:?}",
                time_us as f64 * 1e-6,
                ekf.control_status()
            );
            self.last_status = Some(record.control_status);
        }

        self.writer.serialize(record)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer.into_inner().map_err(|e| e.into_error())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nav_gnc::Parameters;

    #[test]
    fn test_writes_header_and_rows() {
        let mut ekf = Ekf::new(Parameters::default());
        ekf.init(0);

        let mut logger = OutputLogger::new(Vec::new());
        logger.log(10_000, &ekf).unwrap();
        logger.log(20_000, &ekf).unwrap();
        assert_eq!(logger.rows(), 2);

        let out = String::from_utf8(logger.finish().unwrap()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("time_us,q_w,q_x"));
        assert!(lines[2].starts_with("20000,"));
    }
}
