//! Mode S decoder: downlink format, address recovery, identity and altitude
//! replies, hand-off of extended squitters.
//!
//! Address sources by DF:
//! - DF11/17/18: plaintext in bytes 1-3.
//! - DF5/21: CRC residual. Creates the aircraft on first sight.
//! - DF0/4/16/20: CRC residual, accepted only for aircraft already in the
//!   store. Noise on these formats would otherwise materialize phantoms.
//!
//! Everything else has no usable address and decodes to `Invalid`.

use tracing::debug;

use crate::aircraft::AircraftState;
use crate::crc;
use crate::metrics::MetricsSink;
use crate::squitter;
use crate::store::AircraftStore;
use crate::types::*;

/// Decoder switches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    /// Reject DF17/18 frames whose parity does not check.
    pub verify_crc: bool,
    /// Try 1-2 bit syndrome repair before rejecting.
    pub fix_errors: bool,
    /// Receiver position, used to resolve surface positions.
    pub receiver: Option<(f64, f64)>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            verify_crc: true,
            fix_errors: true,
            receiver: None,
        }
    }
}

/// Per-frame context from the Beast header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub mlat: bool,
    pub signal: u8,
    /// Wall-clock receive time, Unix seconds.
    pub received_at: f64,
}

/// Why a payload produced no aircraft update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalid {
    /// Not 7 or 14 bytes, or length disagrees with the DF.
    BadLength(usize),
    /// DF with no address the decoder can recover.
    NoAddress(u8),
    /// Residual address of a surveillance reply not seen before.
    UnknownAddress,
    /// Extended squitter parity failed and could not be repaired.
    CrcFailed,
    /// Mode A/C replies carry no address.
    ModeAc,
}

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Copy of the aircraft record after the merge.
    Aircraft(Box<AircraftState>),
    Invalid(Invalid),
}

impl Decoded {
    pub fn is_valid(&self) -> bool {
        matches!(self, Decoded::Aircraft(_))
    }

    pub fn aircraft(&self) -> Option<&AircraftState> {
        match self {
            Decoded::Aircraft(ac) => Some(ac),
            Decoded::Invalid(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Field decoders
// ---------------------------------------------------------------------------

/// Downlink format from the first 5 bits.
pub fn downlink_format(payload: &[u8]) -> Option<u8> {
    payload.first().map(|b| b >> 3)
}

/// 13-bit field shared by identity and altitude replies (bytes 2-3).
fn field13(payload: &[u8]) -> u16 {
    ((payload[2] as u16 & 0x1F) << 8) | payload[3] as u16
}

/// Remap the 13-bit identity field to a squawk, one octal digit per nibble.
///
/// Field bits 12..0 are C1 A1 C2 A2 C4 A4 X B1 D1 B2 D2 B4 D4.
pub fn decode_id13(id13: u16) -> u16 {
    const MAP: [(u16, u16); 12] = [
        (0x1000, 0x0010), // C1
        (0x0800, 0x1000), // A1
        (0x0400, 0x0020), // C2
        (0x0200, 0x2000), // A2
        (0x0100, 0x0040), // C4
        (0x0080, 0x4000), // A4
        (0x0020, 0x0100), // B1
        (0x0010, 0x0001), // D1
        (0x0008, 0x0200), // B2
        (0x0004, 0x0002), // D2
        (0x0002, 0x0400), // B4
        (0x0001, 0x0004), // D4
    ];
    MAP.iter()
        .filter(|(bit, _)| id13 & bit != 0)
        .fold(0, |acc, (_, out)| acc | out)
}

/// 13-bit altitude field of DF0/4/16/20.
///
/// Only the 25 ft encoding (M clear, Q set) is decoded. Metric and
/// Gillham-coded altitudes come back as unknown.
pub fn decode_ac13(ac13: u16) -> Option<i32> {
    let m_bit = ac13 & 0x40 != 0;
    let q_bit = ac13 & 0x10 != 0;
    if ac13 == 0 || m_bit || !q_bit {
        return None;
    }
    let n = ((ac13 & 0x1F80) >> 2) | ((ac13 & 0x0020) >> 1) | (ac13 & 0x000F);
    Some(n as i32 * 25 - 1000)
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decode a Mode S payload (header already stripped) and merge it into the
/// store.
pub fn decode_mode_s(
    payload: &[u8],
    meta: &FrameMeta,
    store: &AircraftStore,
    metrics: &dyn MetricsSink,
    options: &DecodeOptions,
) -> Decoded {
    let Some(df) = downlink_format(payload) else {
        return Decoded::Invalid(Invalid::BadLength(0));
    };
    metrics.downlink_format(df);

    if payload.len() != 7 && payload.len() != 14 {
        debug!(df, len = payload.len(), "payload length mismatch");
        return Decoded::Invalid(Invalid::BadLength(payload.len()));
    }
    // Residual addresses are only meaningful over the DF's own width.
    let width_ok = df_info(df).map_or(true, |info| info.bits / 8 == payload.len());

    let now = meta.received_at;
    let result = match df {
        11 => {
            let icao = [payload[1], payload[2], payload[3]];
            Some(store.upsert(icao, now, |ac| {
                ac.touch(meta.signal, meta.mlat, now);
                ac.clone()
            }))
        }
        17 | 18 if payload.len() != squitter::ES_LEN => {
            // Plaintext address still refreshes the record; nothing to decode.
            let icao = [payload[1], payload[2], payload[3]];
            debug!(icao = %icao_to_string(&icao), df, "short extended squitter");
            Some(store.upsert(icao, now, |ac| {
                ac.touch(meta.signal, meta.mlat, now);
                ac.clone()
            }))
        }
        17 | 18 => return decode_extended(payload, df, meta, store, metrics, options),
        _ if !width_ok => {
            debug!(df, len = payload.len(), "payload width does not match DF");
            return Decoded::Invalid(Invalid::BadLength(payload.len()));
        }
        5 | 21 => {
            let icao = crc::address_from_residual(payload);
            let squawk = decode_id13(field13(payload));
            Some(store.upsert(icao, now, |ac| {
                ac.touch(meta.signal, meta.mlat, now);
                ac.set_squawk(squawk);
                ac.clone()
            }))
        }
        0 | 4 | 16 | 20 => {
            let icao = crc::address_from_residual(payload);
            let altitude = decode_ac13(field13(payload));
            let updated = store.update_existing(&icao, |ac| {
                ac.touch(meta.signal, meta.mlat, now);
                ac.set_altitude(altitude);
                ac.clone()
            });
            if updated.is_none() {
                return Decoded::Invalid(Invalid::UnknownAddress);
            }
            updated
        }
        _ => None,
    };

    match result {
        Some(ac) => {
            debug!(icao = %icao_to_string(&ac.icao), df, kind = df_name(df), "decoded");
            Decoded::Aircraft(Box::new(ac))
        }
        None => Decoded::Invalid(Invalid::NoAddress(df)),
    }
}

fn decode_extended(
    payload: &[u8],
    df: u8,
    meta: &FrameMeta,
    store: &AircraftStore,
    metrics: &dyn MetricsSink,
    options: &DecodeOptions,
) -> Decoded {
    if payload.len() != squitter::ES_LEN {
        return Decoded::Invalid(Invalid::BadLength(payload.len()));
    }

    let repaired;
    let msg = if options.verify_crc && !crc::is_valid(payload) {
        match options.fix_errors.then(|| crc::try_fix(payload)).flatten() {
            Some(fixed) => {
                metrics.crc_repaired();
                repaired = fixed;
                &repaired[..]
            }
            None => {
                metrics.crc_failed();
                debug!(df, "extended squitter failed CRC");
                return Decoded::Invalid(Invalid::CrcFailed);
            }
        }
    } else {
        payload
    };

    let icao = [msg[1], msg[2], msg[3]];
    let es = squitter::decode_squitter(msg);
    let now = meta.received_at;

    let ac = store.upsert(icao, now, |ac| {
        ac.touch(meta.signal, meta.mlat, now);
        if let Some(sq) = &es {
            if let Some((lat, lon)) = ac.apply_squitter(sq, now, options.receiver) {
                debug!(icao = %icao_to_string(&icao), lat, lon, "position resolved");
            }
        }
        ac.clone()
    });

    debug!(
        icao = %icao_to_string(&icao),
        df,
        tc = squitter::type_code(msg),
        "decoded extended squitter"
    );
    Decoded::Aircraft(Box::new(ac))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpr;
    use crate::metrics::Counters;
    use crate::squitter::build;
    use proptest::prelude::*;

    fn meta(t: f64) -> FrameMeta {
        FrameMeta {
            mlat: false,
            signal: 0,
            received_at: t,
        }
    }

    fn run(hex: &str, store: &AircraftStore) -> Decoded {
        let payload = hex_decode(hex).unwrap();
        decode_mode_s(&payload, &meta(1.0), store, &Counters::new(), &DecodeOptions::default())
    }

    // -- Field decoders --

    #[test]
    fn test_decode_id13() {
        assert_eq!(decode_id13(0x116D), 0x0356);
        assert_eq!(decode_id13(0), 0);
        // A4 A2 A1 = 7, all others 0
        assert_eq!(decode_id13(0x0A80), 0x7000);
    }

    #[test]
    fn test_decode_ac13() {
        assert_eq!(decode_ac13(0x1838), Some(38000));
        assert_eq!(decode_ac13(0), None);
        // M bit set: metric
        assert_eq!(decode_ac13(0x1878), None);
        // Q bit clear: Gillham
        assert_eq!(decode_ac13(0x1828), None);
    }

    #[test]
    fn test_downlink_format() {
        assert_eq!(downlink_format(&[0x8D]), Some(17));
        assert_eq!(downlink_format(&[0x2A]), Some(5));
        assert_eq!(downlink_format(&[]), None);
    }

    // -- Decoder --

    #[test]
    fn test_callsign_example() {
        let store = AircraftStore::new();
        let d = run("8dabeb31204d7074db782012f83a", &store);
        let ac = d.aircraft().unwrap();
        assert_eq!(ac.icao, [0xAB, 0xEB, 0x31]);
        assert_eq!(ac.callsign.as_deref(), Some("SWA467"));
    }

    #[test]
    fn test_full_decode_example() {
        let store = AircraftStore::new();
        let icao = [0xAD, 0x73, 0xA9];
        let id = build::identification(icao, "AAL2748");
        let sink = Counters::new();
        let opts = DecodeOptions::default();
        assert!(decode_mode_s(&id, &meta(1.0), &store, &sink, &opts).is_valid());

        let d = run("8dad73a999117b9b8004285d1c83", &store);
        assert!(d.is_valid());
        let ac = d.aircraft().unwrap();
        assert_eq!(ac.callsign.as_deref(), Some("AAL2748"));
        assert!(ac.speed_kts.is_some());
        assert_eq!(ac.vertical_rate_fpm, Some(0));
        assert!(!ac.mlat);
    }

    #[test]
    fn test_short_payload_is_invalid() {
        let store = AircraftStore::new();
        let d = run("8DABEB31204D", &store);
        assert_eq!(d, Decoded::Invalid(Invalid::BadLength(6)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_short_extended_squitter_refreshes_address() {
        let store = AircraftStore::new();
        // DF17 header on a 7-byte payload
        let d = run("8DABEB31204D70", &store);
        let ac = d.aircraft().unwrap();
        assert_eq!(ac.icao, [0xAB, 0xEB, 0x31]);
        assert_eq!(ac.last_ping, 1.0);
        assert_eq!(ac.message_count, 1);
        assert_eq!(ac.callsign, None);
        assert!(store.contains(&[0xAB, 0xEB, 0x31]));
    }

    #[test]
    fn test_residual_df_width_must_match() {
        let store = AircraftStore::new();
        // DF5 header on a 14-byte payload
        let d = run("2A00516D492B80000000000000FF", &store);
        assert_eq!(d, Decoded::Invalid(Invalid::BadLength(14)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_df5_squawk_and_address() {
        let store = AircraftStore::new();
        let ac = run("2A00516D492B80", &store).aircraft().cloned().unwrap();
        assert_eq!(ac.icao, [0x51, 0x0A, 0xF9]);
        assert_eq!(ac.squawk_string().as_deref(), Some("0356"));
        assert!(store.contains(&[0x51, 0x0A, 0xF9]));
    }

    #[test]
    fn test_df21_creates_aircraft() {
        let store = AircraftStore::new();
        let d = run("A800161110010080E6000081F2D2", &store);
        assert_eq!(d.aircraft().unwrap().icao, [0x83, 0x9B, 0xD3]);
    }

    #[test]
    fn test_df20_altitude_requires_known_address() {
        let store = AircraftStore::new();
        let hex = "A0001838CA3E51F0A8000047A36A";
        assert_eq!(run(hex, &store), Decoded::Invalid(Invalid::UnknownAddress));
        assert!(store.is_empty());

        let icao = [0xEF, 0x61, 0x4D];
        store.store(icao, AircraftState::new(icao, 0.0));
        let ac = run(hex, &store).aircraft().cloned().unwrap();
        assert_eq!(ac.altitude_ft, Some(38000));
        assert_eq!(ac.last_ping, 1.0);
    }

    #[test]
    fn test_unsupported_df_is_invalid() {
        let store = AircraftStore::new();
        // DF24 (Comm-D) long frame
        let d = run("C0000000000000000000000000FF", &store);
        assert_eq!(d, Decoded::Invalid(Invalid::NoAddress(24)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_crc_failure_and_repair() {
        let store = AircraftStore::new();
        let sink = Counters::new();
        let mut payload = hex_decode("8D40621D58C382D690C8AC2863A7").unwrap();
        payload[7] ^= 0x20;

        let strict = DecodeOptions {
            fix_errors: false,
            ..DecodeOptions::default()
        };
        let d = decode_mode_s(&payload, &meta(1.0), &store, &sink, &strict);
        assert_eq!(d, Decoded::Invalid(Invalid::CrcFailed));
        assert!(store.is_empty());

        let d = decode_mode_s(&payload, &meta(1.0), &store, &sink, &DecodeOptions::default());
        assert!(d.is_valid());
        let snap = sink.snapshot();
        assert_eq!(snap.get(crate::metrics::CRC_FAILED), 1);
        assert_eq!(snap.get(crate::metrics::CRC_REPAIRED), 1);
        assert_eq!(sink.df_count(17), 2);
    }

    #[test]
    fn test_crc_unchecked_when_disabled() {
        let store = AircraftStore::new();
        let mut payload = hex_decode("8D40621D58C382D690C8AC2863A7").unwrap();
        payload[13] ^= 0xFF;
        let lax = DecodeOptions {
            verify_crc: false,
            ..DecodeOptions::default()
        };
        let d = decode_mode_s(&payload, &meta(1.0), &store, &Counters::new(), &lax);
        assert!(d.is_valid());
    }

    #[test]
    fn test_position_pair_through_decoder() {
        let store = AircraftStore::new();
        let sink = Counters::new();
        let opts = DecodeOptions::default();
        let even = hex_decode("8D40621D58C382D690C8AC2863A7").unwrap();
        let odd = hex_decode("8D40621D58C386435CC412692AD6").unwrap();

        decode_mode_s(&odd, &meta(1.0), &store, &sink, &opts);
        let d = decode_mode_s(&even, &meta(2.0), &store, &sink, &opts);
        let ac = d.aircraft().unwrap();
        assert!((ac.lat.unwrap() - 52.2572).abs() < 1e-3);
        assert!((ac.lon.unwrap() - 3.9194).abs() < 1e-3);
        assert_eq!(ac.altitude_ft, Some(38000));
        assert_eq!(ac.last_pos, Some(2.0));
    }

    #[test]
    fn test_synthetic_position_pair() {
        let store = AircraftStore::new();
        let sink = Counters::new();
        let opts = DecodeOptions::default();
        let icao = [0x3C, 0x65, 0x86];
        let (lat, lon) = (48.3538, 11.7861);
        let e = build::airborne_position(icao, 12000, cpr::encode(lat, lon, Parity::Even, false), Parity::Even);
        let o = build::airborne_position(icao, 12025, cpr::encode(lat, lon, Parity::Odd, false), Parity::Odd);

        decode_mode_s(&e, &meta(1.0), &store, &sink, &opts);
        let d = decode_mode_s(&o, &meta(1.5), &store, &sink, &opts);
        let ac = d.aircraft().unwrap();
        assert!((ac.lat.unwrap() - lat).abs() < 1e-4);
        assert!((ac.lon.unwrap() - lon).abs() < 1e-4);
        assert_eq!(ac.altitude_ft, Some(12025));
    }

    #[test]
    fn test_mlat_flag_never_unset() {
        let store = AircraftStore::new();
        let sink = Counters::new();
        let opts = DecodeOptions::default();
        let payload = hex_decode("8dabeb31204d7074db782012f83a").unwrap();
        let mlat = FrameMeta {
            mlat: true,
            signal: 99,
            received_at: 1.0,
        };
        decode_mode_s(&payload, &mlat, &store, &sink, &opts);
        let d = decode_mode_s(&payload, &meta(2.0), &store, &sink, &opts);
        let ac = d.aircraft().unwrap();
        assert!(ac.mlat);
        assert_eq!(ac.signal, 0);
        assert_eq!(ac.message_count, 2);
    }

    proptest! {
        #[test]
        fn test_decoder_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..20)) {
            let store = AircraftStore::new();
            let _ = decode_mode_s(&payload, &meta(0.0), &store, &Counters::new(), &DecodeOptions::default());
        }

        #[test]
        fn test_crc_deterministic(payload in proptest::collection::vec(any::<u8>(), 4..15)) {
            prop_assert_eq!(crc::crc24(&payload), crc::crc24(&payload));
        }
    }
}
