//! Great-circle distance between fixes.

use fieldsync_common::GeoPosition;

/// Mean Earth radius in km.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in km, rounded to two decimals.
pub fn calculate_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    round2(EARTH_RADIUS_KM * c)
}

/// Distance between two recorded fixes; 0 when either is the unavailable placeholder.
pub fn distance_between(start: &GeoPosition, end: &GeoPosition) -> f64 {
    if !start.is_available() || !end.is_available() {
        return 0.0;
    }
    calculate_distance(start.latitude, start.longitude, end.latitude, end.longitude)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
