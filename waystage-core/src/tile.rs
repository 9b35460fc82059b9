//! Web-Mercator tile numbers at zoom 31, used to bucket node locations.

use std::f64::consts::PI;

/// Latitude limit of the Web-Mercator projection.
const MAX_LATITUDE: f64 = 85.051_128_8;

/// Number of tiles along one axis at zoom 31.
const TILES_31: f64 = 2_147_483_648.0;

/// Wrap a longitude into `[-180, 180)`.
fn normalise_longitude(lon: f64) -> f64 {
    if (-180.0..180.0).contains(&lon) {
        return lon;
    }
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Clamp a latitude into the projectable range.
fn clamp_latitude(lat: f64) -> f64 {
    lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
}

/// Zoom-31 tile column for a longitude.
pub fn tile31_x(lon: f64) -> i64 {
    let lon = normalise_longitude(lon);
    let tile = (lon + 180.0) / 360.0 * TILES_31;
    // Bounded by TILES_31, so the conversion is lossless.
    tile.floor().clamp(0.0, TILES_31 - 1.0) as i64
}

/// Zoom-31 tile row for a latitude.
pub fn tile31_y(lat: f64) -> i64 {
    let rad = clamp_latitude(lat).to_radians();
    let eval = (rad.tan() + 1.0 / rad.cos()).ln().min(PI);
    let tile = (1.0 - eval / PI) / 2.0 * TILES_31;
    tile.floor().clamp(0.0, TILES_31 - 1.0) as i64
}
