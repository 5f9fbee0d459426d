//! Azimuthal equidistant projection between geodetic coordinates and a local
//! North/East plane.

use nalgebra::Vector3;
#[cfg(not(feature = "std"))]
use num_traits::Float;

pub const RADIUS_OF_EARTH_M: f64 = 6_371_000.0;
pub const EARTH_RATE_RAD_S: f32 = 7.2921e-5;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MapProjection {
    lat_deg: f64,
    lon_deg: f64,
    lat_rad: f64,
    lon_rad: f64,
    sin_lat: f64,
    cos_lat: f64,
    timestamp_us: u64,
    initialized: bool,
}

impl MapProjection {
    pub fn new(lat_deg: f64, lon_deg: f64, timestamp_us: u64) -> Self {
        let lat_rad = lat_deg.to_radians();
        let lon_rad = lon_deg.to_radians();

        Self {
            lat_deg,
            lon_deg,
            lat_rad,
            lon_rad,
            sin_lat: lat_rad.sin(),
            cos_lat: lat_rad.cos(),
            timestamp_us,
            initialized: true,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat_deg
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon_deg
    }

    pub fn lat_rad(&self) -> f64 {
        self.lat_rad
    }

    /// Local North/East coordinates in meters of the given point.
    pub fn project(&self, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        let lat_rad = lat_deg.to_radians();
        let lon_rad = lon_deg.to_radians();

        let sin_lat = lat_rad.sin();
        let cos_lat = lat_rad.cos();
        let cos_d_lon = (lon_rad - self.lon_rad).cos();

        let arg = (self.sin_lat * sin_lat + self.cos_lat * cos_lat * cos_d_lon).clamp(-1.0, 1.0);
        let c = arg.acos();

        let k = if c.abs() > 0.0 { c / c.sin() } else { 1.0 };

        let x = k * (self.cos_lat * sin_lat - self.sin_lat * cos_lat * cos_d_lon) * RADIUS_OF_EARTH_M;
        let y = k * cos_lat * (lon_rad - self.lon_rad).sin() * RADIUS_OF_EARTH_M;

        (x, y)
    }

    /// Inverse of [`MapProjection::project`], returns latitude and longitude in degrees.
    pub fn reproject(&self, x: f64, y: f64) -> (f64, f64) {
        let x_rad = x / RADIUS_OF_EARTH_M;
        let y_rad = y / RADIUS_OF_EARTH_M;
        let c = (x_rad * x_rad + y_rad * y_rad).sqrt();

        if c.abs() > 0.0 {
            let sin_c = c.sin();
            let cos_c = c.cos();

            let lat_rad = (cos_c * self.sin_lat + (x_rad * sin_c * self.cos_lat) / c).asin();
            let lon_rad = self.lon_rad
                + (y_rad * sin_c).atan2(c * self.cos_lat * cos_c - x_rad * self.sin_lat * sin_c);

            (lat_rad.to_degrees(), lon_rad.to_degrees())
        } else {
            (self.lat_deg(), self.lon_deg())
        }
    }
}

/// Earth rotation rate expressed in the local NED frame.
pub fn earth_rate_ned(lat_rad: f64) -> Vector3<f32> {
    let lat = lat_rad as f32;
    Vector3::new(
        EARTH_RATE_RAD_S * lat.cos(),
        0.0,
        -EARTH_RATE_RAD_S * lat.sin(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_origin_projects_to_zero() {
        let proj = MapProjection::new(47.3977, 8.5456, 0);
        let (x, y) = proj.project(47.3977, 8.5456);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_origin_keeps_degrees() {
        let proj = MapProjection::new(-15.0000005, -115.0000005, 0);
        assert_eq!(proj.lat_deg(), -15.0000005);
        assert_eq!(proj.lon_deg(), -115.0000005);
    }

    #[test]
    fn test_project_reproject() {
        let proj = MapProjection::new(-33.86, 151.2, 0);
        let (x, y) = proj.project(-33.859, 151.2013);

        // One thousandth of a degree of latitude is about 111 m
        assert_abs_diff_eq!(x, 111.19, epsilon = 0.1);
        assert!(y > 0.0);

        let (lat, lon) = proj.reproject(x, y);
        assert_abs_diff_eq!(lat, -33.859, epsilon = 1e-9);
        assert_abs_diff_eq!(lon, 151.2013, epsilon = 1e-9);
    }

    #[test]
    fn test_earth_rate() {
        let rate = earth_rate_ned(0.0);
        assert_abs_diff_eq!(rate.x, EARTH_RATE_RAD_S);
        assert_abs_diff_eq!(rate.z, 0.0);
    }
}
