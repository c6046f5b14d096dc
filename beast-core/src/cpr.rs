//! Compact Position Reporting.
//!
//! A position message carries 17-bit latitude and longitude fractions within
//! a zone. An even frame uses 60 latitude zones, an odd frame 59, so a
//! recent even/odd pair pins down the zone index and yields an unambiguous
//! position (global decode). Surface messages use quarter-size zones and are
//! ambiguous by 90 degrees, so they also need a nearby reference position.
//!
//! Everything here is pure. Pair ageing and buffering live with the aircraft
//! state.

use crate::types::Parity;

/// Bits per CPR coordinate.
const NB: u32 = 17;

/// 2^17.
const CPR_MAX: f64 = (1u32 << NB) as f64;

/// Even/odd fragments further apart than this are not paired (seconds).
pub const MAX_PAIR_AGE: f64 = 10.0;

/// Raw CPR coordinates from one position message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CprFrame {
    pub lat: u32,
    pub lon: u32,
}

// ---------------------------------------------------------------------------
// NL table
// ---------------------------------------------------------------------------

/// Latitude transitions for the number of longitude zones. Entry `i` is the
/// upper bound (exclusive) of the band with NL = 59 - i.
const NL_TRANSITIONS: [f64; 58] = [
    10.47047130, 14.82817437, 18.18626357, 21.02939493, 23.54504487, 25.82924707,
    27.93898710, 29.91135686, 31.77209708, 33.53993436, 35.22899598, 36.85025108,
    38.41241892, 39.92256684, 41.38651832, 42.80914012, 44.19454951, 45.54626723,
    46.86733252, 48.16039128, 49.42776439, 50.67150166, 51.89342469, 53.09516153,
    54.27817472, 55.44378444, 56.59318756, 57.72747354, 58.84763776, 59.95459277,
    61.04917774, 62.13216659, 63.20427479, 64.26616523, 65.31845310, 66.36171008,
    67.39646774, 68.42322022, 69.44242631, 70.45451075, 71.45986473, 72.45884545,
    73.45177442, 74.43893416, 75.42056257, 76.39684391, 77.36789461, 78.33374083,
    79.29428225, 80.24923213, 81.19801349, 82.13956981, 83.07199445, 83.99173563,
    84.89166191, 85.75541621, 86.53536998, 87.00000000,
];

/// Number of longitude zones at a latitude: 59 at the equator down to 1 at
/// the poles.
pub fn nl(lat: f64) -> u32 {
    let lat = lat.abs();
    let band = NL_TRANSITIONS.partition_point(|&bound| bound <= lat);
    59 - band as u32
}

fn parity_index(parity: Parity) -> u32 {
    match parity {
        Parity::Even => 0,
        Parity::Odd => 1,
    }
}

/// Longitude zone count for a frame of this parity, never below 1.
pub fn n(lat: f64, parity: Parity) -> u32 {
    nl(lat).saturating_sub(parity_index(parity)).max(1)
}

/// Longitude zone size in degrees.
pub fn dlon(lat: f64, parity: Parity, surface: bool) -> f64 {
    let span = if surface { 90.0 } else { 360.0 };
    span / n(lat, parity) as f64
}

/// Latitude zone size in degrees.
pub fn dlat(parity: Parity, surface: bool) -> f64 {
    let span = if surface { 90.0 } else { 360.0 };
    span / (60 - parity_index(parity)) as f64
}

/// Modulo that always returns a non-negative result.
fn modulo(x: f64, y: f64) -> f64 {
    x - y * (x / y).floor()
}

/// Wrap longitude into [-180, 180).
fn normalize_lon(lon: f64) -> f64 {
    lon - ((lon + 180.0) / 360.0).floor() * 360.0
}

// ---------------------------------------------------------------------------
// Global decode
// ---------------------------------------------------------------------------

/// Zone latitudes for both frames, before any hemisphere fixup.
fn zone_latitudes(even: CprFrame, odd: CprFrame, surface: bool) -> (f64, f64) {
    let lat_e = even.lat as f64 / CPR_MAX;
    let lat_o = odd.lat as f64 / CPR_MAX;
    let j = (59.0 * lat_e - 60.0 * lat_o + 0.5).floor();
    (
        dlat(Parity::Even, surface) * (modulo(j, 60.0) + lat_e),
        dlat(Parity::Odd, surface) * (modulo(j, 59.0) + lat_o),
    )
}

/// Longitude within the latest frame's zone set, before wrapping.
fn zone_longitude(even: CprFrame, odd: CprFrame, latest: Parity, lat: f64, surface: bool) -> f64 {
    let lon_e = even.lon as f64 / CPR_MAX;
    let lon_o = odd.lon as f64 / CPR_MAX;
    let nl_val = nl(lat) as f64;
    let ni = n(lat, latest) as f64;
    let m = (lon_e * (nl_val - 1.0) - lon_o * nl_val + 0.5).floor();
    let lon_i = match latest {
        Parity::Even => lon_e,
        Parity::Odd => lon_o,
    };
    dlon(lat, latest, surface) * (modulo(m, ni) + lon_i)
}

/// Airborne global decode of an even/odd pair.
///
/// `latest` is the parity of the more recent frame; its latitude is the one
/// reported. Returns `None` when the two frames straddle an NL boundary or
/// resolve to a latitude beyond the poles.
pub fn global_decode(even: CprFrame, odd: CprFrame, latest: Parity) -> Option<(f64, f64)> {
    let (mut lat_e, mut lat_o) = zone_latitudes(even, odd, false);
    if lat_e >= 270.0 {
        lat_e -= 360.0;
    }
    if lat_o >= 270.0 {
        lat_o -= 360.0;
    }

    // Zone index from an inconsistent pair can land past the poles.
    if !(-90.0..=90.0).contains(&lat_e) || !(-90.0..=90.0).contains(&lat_o) {
        return None;
    }
    if nl(lat_e) != nl(lat_o) {
        return None;
    }

    let lat = match latest {
        Parity::Even => lat_e,
        Parity::Odd => lat_o,
    };
    let lon = zone_longitude(even, odd, latest, lat, false);
    Some((lat, normalize_lon(lon)))
}

/// Surface global decode of an even/odd pair.
///
/// The result is only defined modulo 90 degrees, so the candidate nearest to
/// the reference position wins.
pub fn surface_decode(
    even: CprFrame,
    odd: CprFrame,
    latest: Parity,
    ref_lat: f64,
    ref_lon: f64,
) -> Option<(f64, f64)> {
    let (lat_e, lat_o) = zone_latitudes(even, odd, true);
    let lat_e = nearest_lat(lat_e, ref_lat);
    let lat_o = nearest_lat(lat_o, ref_lat);

    if nl(lat_e) != nl(lat_o) {
        return None;
    }

    let lat = match latest {
        Parity::Even => lat_e,
        Parity::Odd => lat_o,
    };
    let base = zone_longitude(even, odd, latest, lat, true);
    let lon = (0..4)
        .map(|k| normalize_lon(base + 90.0 * k as f64))
        .min_by(|a, b| lon_distance(*a, ref_lon).total_cmp(&lon_distance(*b, ref_lon)))?;
    Some((lat, lon))
}

fn nearest_lat(lat: f64, ref_lat: f64) -> f64 {
    let south = lat - 90.0;
    if (south - ref_lat).abs() < (lat - ref_lat).abs() {
        south
    } else {
        lat
    }
}

fn lon_distance(a: f64, b: f64) -> f64 {
    normalize_lon(a - b).abs()
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encode a position into the CPR fraction of one frame.
pub fn encode(lat: f64, lon: f64, parity: Parity, surface: bool) -> CprFrame {
    let dlat_i = dlat(parity, surface);
    let yz = (CPR_MAX * modulo(lat, dlat_i) / dlat_i + 0.5).floor();
    let rlat = dlat_i * (yz / CPR_MAX + (lat / dlat_i).floor());

    let dlon_i = dlon(rlat, parity, surface);
    let xz = (CPR_MAX * modulo(lon, dlon_i) / dlon_i + 0.5).floor();

    let mask = (1u32 << NB) - 1;
    CprFrame {
        lat: (yz as u32) & mask,
        lon: (xz as u32) & mask,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
