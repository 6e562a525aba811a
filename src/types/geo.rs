//! Geographic points and great-circle distance.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

const LAT_KEYS: &[&str] = &["lat", "latitude"];
const LON_KEYS: &[&str] = &["lon", "lng", "longitude"];

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and within [-90, 90] × [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in kilometres (haversine formula).
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }

    /// Unit-sphere Cartesian coordinates.
    pub(crate) fn to_cartesian(self) -> [f64; 3] {
        let (lat, lon) = (self.lat.to_radians(), self.lon.to_radians());
        [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
    }

    /// Inverse of [`to_cartesian`](Self::to_cartesian). The vector need not be normalised.
    pub(crate) fn from_cartesian([x, y, z]: [f64; 3]) -> Option<Self> {
        let hyp = (x * x + y * y).sqrt();
        if hyp == 0.0 && z == 0.0 {
            return None;
        }
        Some(Self {
            lat: z.atan2(hyp).to_degrees(),
            lon: y.atan2(x).to_degrees(),
        })
    }

    /// Read a coordinate out of request params.
    ///
    /// Accepts `lat`/`latitude` and `lon`/`lng`/`longitude`, as numbers or
    /// numeric strings. Returns `None` if either is missing or invalid.
    pub fn from_params(params: &Value) -> Option<Self> {
        let lat = find_number(params, LAT_KEYS)?;
        let lon = find_number(params, LON_KEYS)?;
        let point = Self::new(lat, lon);
        point.is_valid().then_some(point)
    }

    /// Copy of `params` with its coordinate fields replaced by this point.
    ///
    /// Keeps whichever key spelling the params already use.
    pub fn write_into(&self, params: &Value) -> Value {
        let mut out = params.clone();
        if let Value::Object(map) = &mut out {
            let lat_key = LAT_KEYS
                .iter()
                .find(|k| map.contains_key(**k))
                .copied()
                .unwrap_or("lat");
            let lon_key = LON_KEYS
                .iter()
                .find(|k| map.contains_key(**k))
                .copied()
                .unwrap_or("lon");
            map.insert(lat_key.to_owned(), Value::from(self.lat));
            map.insert(lon_key.to_owned(), Value::from(self.lon));
        }
        out
    }
}

fn find_number(params: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match params.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn haversine_known_distance() {
        // Paris to London is roughly 344 km.
        let paris = GeoPoint::new(48.8566, 2.3522);
        let london = GeoPoint::new(51.5074, -0.1278);
        let d = paris.haversine_km(&london);
        assert!((d - 344.0).abs() < 2.0, "got {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        let p = GeoPoint::new(59.91, 10.75);
        assert!(p.haversine_km(&p) < 1e-9);
    }

    #[test]
    fn cartesian_roundtrip_near_dateline() {
        let p = GeoPoint::new(-16.5, 179.9);
        let back = GeoPoint::from_cartesian(p.to_cartesian()).unwrap();
        assert!(p.haversine_km(&back) < 1e-6);
    }

    #[test]
    fn reads_coordinates_from_params() {
        let p = GeoPoint::from_params(&json!({"latitude": "47.5", "lng": 8.2})).unwrap();
        assert_eq!(p, GeoPoint::new(47.5, 8.2));
        assert!(GeoPoint::from_params(&json!({"lat": 91.0, "lon": 0.0})).is_none());
        assert!(GeoPoint::from_params(&json!({"city": "Bern"})).is_none());
    }

    #[test]
    fn write_into_keeps_key_spelling() {
        let params = json!({"latitude": 1.0, "longitude": 2.0, "units": "metric"});
        let out = GeoPoint::new(3.0, 4.0).write_into(&params);
        assert_eq!(out, json!({"latitude": 3.0, "longitude": 4.0, "units": "metric"}));
    }
}
