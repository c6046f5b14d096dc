//! Shared types, error enum, and decoded message types for beast-core.

use serde::Serialize;
use thiserror::Error;

/// All errors produced by beast-core.
///
/// Decode outcomes are not errors: see `FrameError` and `decode::Invalid`.
#[derive(Debug, Error)]
pub enum BeastError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BeastError>;

// ---------------------------------------------------------------------------
// Downlink Format metadata
// ---------------------------------------------------------------------------

/// Metadata for a Downlink Format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfInfo {
    pub name: &'static str,
    pub bits: usize,
}

/// Known Downlink Format table.
pub const DF_TABLE: &[(u8, DfInfo)] = &[
    (
        0,
        DfInfo {
            name: "Short air-air surveillance (TCAS)",
            bits: 56,
        },
    ),
    (
        4,
        DfInfo {
            name: "Surveillance altitude reply",
            bits: 56,
        },
    ),
    (
        5,
        DfInfo {
            name: "Surveillance identity reply",
            bits: 56,
        },
    ),
    (
        11,
        DfInfo {
            name: "All-call reply",
            bits: 56,
        },
    ),
    (
        16,
        DfInfo {
            name: "Long air-air surveillance (TCAS)",
            bits: 112,
        },
    ),
    (
        17,
        DfInfo {
            name: "ADS-B extended squitter",
            bits: 112,
        },
    ),
    (
        18,
        DfInfo {
            name: "TIS-B / ADS-R",
            bits: 112,
        },
    ),
    (
        19,
        DfInfo {
            name: "Military extended squitter",
            bits: 112,
        },
    ),
    (
        20,
        DfInfo {
            name: "Comm-B altitude reply",
            bits: 112,
        },
    ),
    (
        21,
        DfInfo {
            name: "Comm-B identity reply",
            bits: 112,
        },
    ),
];

/// Look up DF metadata. Returns `None` for unrecognized DFs.
pub fn df_info(df: u8) -> Option<&'static DfInfo> {
    DF_TABLE
        .iter()
        .find(|(d, _)| *d == df)
        .map(|(_, info)| info)
}

/// Human-readable DF name, "unknown" when not in the table.
pub fn df_name(df: u8) -> &'static str {
    df_info(df).map(|info| info.name).unwrap_or("unknown")
}

// ---------------------------------------------------------------------------
// ICAO address helpers
// ---------------------------------------------------------------------------

/// 3-byte ICAO address. Stored as raw bytes to avoid per-frame String allocation.
pub type Icao = [u8; 3];

/// Format ICAO address as 6-char uppercase hex string.
pub fn icao_to_string(icao: &Icao) -> String {
    format!("{:02X}{:02X}{:02X}", icao[0], icao[1], icao[2])
}

/// Parse a 6-char hex string into an ICAO address.
pub fn icao_from_hex(hex: &str) -> Option<Icao> {
    if hex.len() != 6 {
        return None;
    }
    let val = u32::from_str_radix(hex, 16).ok()?;
    Some(icao_from_u32(val))
}

/// Convert ICAO bytes to u32 for numeric comparisons.
pub fn icao_to_u32(icao: &Icao) -> u32 {
    ((icao[0] as u32) << 16) | ((icao[1] as u32) << 8) | (icao[2] as u32)
}

/// Build ICAO from a 24-bit integer.
pub fn icao_from_u32(val: u32) -> Icao {
    [
        ((val >> 16) & 0xFF) as u8,
        ((val >> 8) & 0xFF) as u8,
        (val & 0xFF) as u8,
    ]
}

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Decode a hex string into bytes. Case-insensitive, must be even length.
pub fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let high = hex_digit(chunk[0])?;
        let low = hex_digit(chunk[1])?;
        bytes.push((high << 4) | low);
    }
    Some(bytes)
}

/// Encode bytes as uppercase hex string.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ADS-B callsign character set
// ---------------------------------------------------------------------------

/// ADS-B character set for callsign encoding (6 bits per character).
pub const CALLSIGN_CHARSET: &[u8; 64] =
    b"@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_ !\"#$%&'()*+,-./0123456789:;<=>?";

// ---------------------------------------------------------------------------
// Wall clock
// ---------------------------------------------------------------------------

/// Current wall-clock time as Unix seconds.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Decoded extended squitter messages
// ---------------------------------------------------------------------------

/// CPR frame parity. The F bit of a position message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Parity {
    Even,
    Odd,
}

/// TC 1-4: Aircraft identification (callsign).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentificationMsg {
    pub callsign: String,
    pub category: u8,
}

/// TC 5-8 (surface) or TC 9-18/20-22 (airborne): CPR-encoded position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionMsg {
    pub altitude_ft: Option<i32>,
    pub cpr_lat: u32,
    pub cpr_lon: u32,
    pub parity: Parity,
    /// T flag: the position is synchronised to UTC time.
    pub time_synced: bool,
    pub is_surface: bool,
}

/// Vertical rate source bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerticalRateSource {
    Gnss,
    Barometric,
}

/// TC 19: Airborne velocity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VelocityMsg {
    pub speed_kts: Option<f64>,
    pub heading_deg: Option<f64>,
    pub heading_valid: bool,
    pub vertical_rate_fpm: Option<i32>,
    pub vertical_rate_source: Option<VerticalRateSource>,
    pub speed_type: SpeedType,
}

/// Speed type for velocity messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpeedType {
    Ground,
    Airspeed,
}

impl std::fmt::Display for SpeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeedType::Ground => write!(f, "ground"),
            SpeedType::Airspeed => write!(f, "airspeed"),
        }
    }
}

/// Union type for the extended squitter payloads the decoder understands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SquitterMsg {
    Identification(IdentificationMsg),
    Position(PositionMsg),
    Velocity(VelocityMsg),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icao_roundtrip() {
        let icao = icao_from_hex("4840D6").unwrap();
        assert_eq!(icao, [0x48, 0x40, 0xD6]);
        assert_eq!(icao_to_string(&icao), "4840D6");
    }

    #[test]
    fn test_icao_to_u32() {
        let icao = [0xA0, 0x00, 0x01];
        assert_eq!(icao_to_u32(&icao), 0xA00001);
    }

    #[test]
    fn test_icao_from_u32() {
        assert_eq!(icao_from_u32(0x4840D6), [0x48, 0x40, 0xD6]);
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("4840d6"), Some(vec![0x48u8, 0x40, 0xD6]));
        assert_eq!(hex_decode("odd"), None);
        assert_eq!(hex_decode("ZZZZ"), None);
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x48, 0x40, 0xD6]), "4840D6");
    }

    #[test]
    fn test_df_info() {
        assert_eq!(df_info(17).unwrap().name, "ADS-B extended squitter");
        assert_eq!(df_info(17).unwrap().bits, 112);
        assert_eq!(df_info(5).unwrap().bits, 56);
        assert!(df_info(3).is_none());
        assert_eq!(df_name(3), "unknown");
    }

    #[test]
    fn test_callsign_charset_layout() {
        assert_eq!(CALLSIGN_CHARSET[0], b'@');
        assert_eq!(CALLSIGN_CHARSET[1], b'A');
        assert_eq!(CALLSIGN_CHARSET[32], b' ');
        assert_eq!(CALLSIGN_CHARSET[48], b'0');
        assert_eq!(CALLSIGN_CHARSET[63], b'?');
    }
}
