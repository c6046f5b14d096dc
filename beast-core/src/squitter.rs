//! Decode the 56-bit ME field of an extended squitter (DF17/18).
//!
//! Byte offsets below index the full 14-byte message: byte 4 holds the type
//! code, bytes 4-10 are the ME field.
//!
//! | Type code | Payload |
//! |-----------|---------|
//! | 1-4       | Identification (callsign) |
//! | 5-8       | Surface position |
//! | 9-18      | Airborne position, barometric altitude |
//! | 19        | Airborne velocity |
//! | 20-22     | Airborne position, GNSS height (height not decoded) |

use crate::types::*;

/// ES messages are always 112 bits.
pub const ES_LEN: usize = 14;

/// Type code: top 5 bits of byte 4.
pub fn type_code(msg: &[u8]) -> u8 {
    msg[4] >> 3
}

/// Subtype: 3 bits, or 2 bits for type 29.
pub fn subtype(msg: &[u8]) -> u8 {
    if type_code(msg) == 29 {
        (msg[4] & 0x06) >> 1
    } else {
        msg[4] & 0x07
    }
}

/// Decode an extended squitter. `None` for short input and for type codes
/// that carry nothing the aircraft state tracks.
pub fn decode_squitter(msg: &[u8]) -> Option<SquitterMsg> {
    if msg.len() != ES_LEN {
        return None;
    }
    match type_code(msg) {
        1..=4 => Some(SquitterMsg::Identification(decode_identification(msg))),
        5..=8 | 9..=18 | 20..=22 => Some(SquitterMsg::Position(decode_position(msg))),
        19 => decode_velocity(msg).map(SquitterMsg::Velocity),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

/// Eight 6-bit characters from bytes 5-10, trailing spaces trimmed.
pub fn decode_callsign(msg: &[u8]) -> String {
    let bits = msg[5..11]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);

    let raw: String = (0..8)
        .map(|i| {
            let idx = ((bits >> (42 - i * 6)) & 0x3F) as usize;
            CALLSIGN_CHARSET[idx] as char
        })
        .collect();
    raw.trim_end().to_string()
}

fn decode_identification(msg: &[u8]) -> IdentificationMsg {
    IdentificationMsg {
        callsign: decode_callsign(msg),
        category: msg[4] & 0x07,
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// 12-bit altitude from an airborne position message.
///
/// Only the 25 ft encoding (Q bit set) is decoded; Gillham-coded altitudes
/// and code 0 are reported as unknown.
pub fn decode_ac12(ac12: u16) -> Option<i32> {
    if ac12 == 0 || ac12 & 0x10 == 0 {
        return None;
    }
    let n = ((ac12 & 0x0FE0) >> 1) | (ac12 & 0x000F);
    Some(n as i32 * 25 - 1000)
}

fn decode_position(msg: &[u8]) -> PositionMsg {
    let tc = type_code(msg);
    let is_surface = (5..=8).contains(&tc);

    let altitude_ft = if (9..=18).contains(&tc) {
        decode_ac12(((msg[5] as u16) << 4) | (msg[6] as u16 >> 4))
    } else {
        None
    };

    let cpr_lat = ((msg[6] as u32 & 0x03) << 15) | ((msg[7] as u32) << 7) | (msg[8] as u32 >> 1);
    let cpr_lon = ((msg[8] as u32 & 0x01) << 16) | ((msg[9] as u32) << 8) | msg[10] as u32;

    PositionMsg {
        altitude_ft,
        cpr_lat,
        cpr_lon,
        parity: if msg[6] & 0x04 != 0 {
            Parity::Odd
        } else {
            Parity::Even
        },
        time_synced: msg[6] & 0x08 != 0,
        is_surface,
    }
}

// ---------------------------------------------------------------------------
// Velocity
// ---------------------------------------------------------------------------

fn decode_velocity(msg: &[u8]) -> Option<VelocityMsg> {
    let sub = subtype(msg);
    let (vertical_rate_fpm, vertical_rate_source) = decode_vertical_rate(msg);

    match sub {
        1 | 2 => {
            let scale = if sub == 2 { 4 } else { 1 };
            let ew_raw = ((msg[5] as i32 & 0x03) << 8) | msg[6] as i32;
            let ns_raw = ((msg[7] as i32 & 0x7F) << 3) | ((msg[8] as i32 & 0xE0) >> 5);

            let (speed_kts, heading_deg) = if ew_raw > 0 && ns_raw > 0 {
                let mut ew = ((ew_raw - 1) * scale) as f64;
                let mut ns = ((ns_raw - 1) * scale) as f64;
                if msg[5] & 0x04 != 0 {
                    ew = -ew;
                }
                if msg[7] & 0x80 != 0 {
                    ns = -ns;
                }
                let speed = ew.hypot(ns);
                let heading = if speed > 0.0 {
                    Some(ew.atan2(ns).to_degrees().rem_euclid(360.0))
                } else {
                    None
                };
                (Some(speed), heading)
            } else {
                (None, None)
            };

            Some(VelocityMsg {
                speed_kts,
                heading_valid: heading_deg.is_some(),
                heading_deg,
                vertical_rate_fpm,
                vertical_rate_source,
                speed_type: SpeedType::Ground,
            })
        }
        3 | 4 => {
            let heading_valid = msg[5] & 0x04 != 0;
            let heading_raw = ((msg[5] as u32 & 0x03) << 8) | msg[6] as u32;
            let heading_deg = heading_valid.then(|| heading_raw as f64 * 360.0 / 1024.0);

            let scale = if sub == 4 { 4 } else { 1 };
            let as_raw = ((msg[7] as i32 & 0x7F) << 3) | ((msg[8] as i32 & 0xE0) >> 5);
            let speed_kts = (as_raw > 0).then(|| ((as_raw - 1) * scale) as f64);

            Some(VelocityMsg {
                speed_kts,
                heading_deg,
                heading_valid,
                vertical_rate_fpm,
                vertical_rate_source,
                speed_type: SpeedType::Airspeed,
            })
        }
        _ => None,
    }
}

/// Vertical rate in ft/min on a 25 ft/min grid, plus its source.
fn decode_vertical_rate(msg: &[u8]) -> (Option<i32>, Option<VerticalRateSource>) {
    let raw = ((msg[8] as i32 & 0x07) << 6) | ((msg[9] as i32 & 0xFC) >> 2);
    if raw == 0 {
        return (None, None);
    }
    let source = if msg[8] & 0x10 != 0 {
        VerticalRateSource::Barometric
    } else {
        VerticalRateSource::Gnss
    };
    // Integer division: 64 ft/min steps snap down to the 25 ft/min grid.
    let magnitude = (raw - 1) * 64 / 25 * 25;
    let rate = if msg[8] & 0x08 != 0 {
        -magnitude
    } else {
        magnitude
    };
    (Some(rate), Some(source))
}

// ---------------------------------------------------------------------------
// Test frame builders
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
