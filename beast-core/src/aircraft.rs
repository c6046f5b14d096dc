//! Per-aircraft state and merge rules.
//!
//! One `AircraftState` per ICAO address. Every field that can be unknown is
//! an `Option`, so "not yet measured" never collides with a measured zero.
//! Decoded messages only overwrite fields they actually carry; the ping
//! timestamp is refreshed on every message.

use serde::ser::{Serialize, Serializer};

use crate::cpr::{self, CprFrame, MAX_PAIR_AGE};
use crate::frame::rssi_dbfs;
use crate::types::*;

/// Buffered half of a CPR pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CprFragment {
    pub frame: CprFrame,
    pub received_at: f64,
    pub surface: bool,
}

/// Mutable state for a single tracked aircraft.
#[derive(Debug, Clone, PartialEq)]
pub struct AircraftState {
    pub icao: Icao,
    pub callsign: Option<String>,
    /// Identity code, one octal digit per nibble (0x7700 prints as "7700").
    pub squawk: Option<u16>,

    // Position
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub altitude_ft: Option<i32>,

    // Velocity
    pub speed_kts: Option<f64>,
    pub speed_type: Option<SpeedType>,
    pub heading_deg: Option<f64>,
    pub heading_valid: bool,
    pub vertical_rate_fpm: Option<i32>,
    pub vertical_rate_source: Option<VerticalRateSource>,

    // CPR buffers for global decode
    pub even_cpr: Option<CprFragment>,
    pub odd_cpr: Option<CprFragment>,

    // Metadata
    pub mlat: bool,
    /// Raw signal level of the latest message.
    pub signal: u8,
    pub first_seen: f64,
    pub last_ping: f64,
    pub last_pos: Option<f64>,
    pub message_count: u64,
}

impl AircraftState {
    pub fn new(icao: Icao, timestamp: f64) -> Self {
        AircraftState {
            icao,
            callsign: None,
            squawk: None,
            lat: None,
            lon: None,
            altitude_ft: None,
            speed_kts: None,
            speed_type: None,
            heading_deg: None,
            heading_valid: false,
            vertical_rate_fpm: None,
            vertical_rate_source: None,
            even_cpr: None,
            odd_cpr: None,
            mlat: false,
            signal: 0,
            first_seen: timestamp,
            last_ping: timestamp,
            last_pos: None,
            message_count: 0,
        }
    }

    pub fn has_position(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }

    pub fn age(&self, now: f64) -> f64 {
        now - self.last_ping
    }

    pub fn is_stale(&self, now: f64, max_age: f64) -> bool {
        self.age(now) > max_age
    }

    pub fn rssi_dbfs(&self) -> Option<f64> {
        rssi_dbfs(self.signal)
    }

    /// Squawk as four octal digits.
    pub fn squawk_string(&self) -> Option<String> {
        self.squawk.map(|s| format!("{s:04x}"))
    }

    // -- Merge rules --

    /// Bookkeeping for any message from this address.
    pub fn touch(&mut self, signal: u8, mlat: bool, now: f64) {
        self.signal = signal;
        self.last_ping = now;
        self.message_count += 1;
        if mlat {
            self.mlat = true;
        }
    }

    /// Zero means "no identity" and never replaces a known squawk.
    pub fn set_squawk(&mut self, squawk: u16) {
        if squawk != 0 {
            self.squawk = Some(squawk);
        }
    }

    pub fn set_altitude(&mut self, altitude_ft: Option<i32>) {
        if let Some(alt) = altitude_ft {
            self.altitude_ft = Some(alt);
        }
    }

    /// Merge a decoded extended squitter. Returns the position if this
    /// message completed a CPR pair.
    ///
    /// `reference` is the receiver position, needed for surface messages.
    pub fn apply_squitter(
        &mut self,
        msg: &SquitterMsg,
        now: f64,
        reference: Option<(f64, f64)>,
    ) -> Option<(f64, f64)> {
        match msg {
            SquitterMsg::Identification(m) => {
                if !m.callsign.is_empty() {
                    self.callsign = Some(m.callsign.clone());
                }
                None
            }
            SquitterMsg::Velocity(m) => {
                if let Some(spd) = m.speed_kts {
                    self.speed_kts = Some(spd);
                    self.speed_type = Some(m.speed_type);
                }
                if let Some(hdg) = m.heading_deg {
                    self.heading_deg = Some(hdg);
                }
                self.heading_valid = m.heading_valid;
                if let Some(vr) = m.vertical_rate_fpm {
                    self.vertical_rate_fpm = Some(vr);
                    self.vertical_rate_source = m.vertical_rate_source;
                }
                None
            }
            SquitterMsg::Position(m) => {
                self.set_altitude(m.altitude_ft);
                self.record_position(m, now, reference)
            }
        }
    }

    /// Buffer a CPR fragment, resolving it against the opposite parity when
    /// one is available.
    ///
    /// Both buffers clear only after a successful decode. A pair that fails
    /// to resolve keeps the partner and stores the new fragment in its own
    /// slot, replacing any older fragment of that parity.
    fn record_position(
        &mut self,
        m: &PositionMsg,
        now: f64,
        reference: Option<(f64, f64)>,
    ) -> Option<(f64, f64)> {
        let fragment = CprFragment {
            frame: CprFrame {
                lat: m.cpr_lat,
                lon: m.cpr_lon,
            },
            received_at: now,
            surface: m.is_surface,
        };

        let partner_slot = match m.parity {
            Parity::Even => &mut self.odd_cpr,
            Parity::Odd => &mut self.even_cpr,
        };
        if partner_slot.is_some_and(|p| now - p.received_at > MAX_PAIR_AGE) {
            *partner_slot = None;
        }
        let partner = partner_slot.filter(|p| p.surface == fragment.surface);

        let resolved = partner.and_then(|p| {
            let (even, odd) = match m.parity {
                Parity::Even => (fragment.frame, p.frame),
                Parity::Odd => (p.frame, fragment.frame),
            };
            if fragment.surface {
                let (ref_lat, ref_lon) = reference?;
                cpr::surface_decode(even, odd, m.parity, ref_lat, ref_lon)
            } else {
                cpr::global_decode(even, odd, m.parity)
            }
        });

        match resolved {
            Some((lat, lon)) => {
                self.lat = Some(lat);
                self.lon = Some(lon);
                self.last_pos = Some(now);
                self.even_cpr = None;
                self.odd_cpr = None;
            }
            None => match m.parity {
                Parity::Even => self.even_cpr = Some(fragment),
                Parity::Odd => self.odd_cpr = Some(fragment),
            },
        }
        resolved
    }
}

// ---------------------------------------------------------------------------
// JSON view
// ---------------------------------------------------------------------------

#[derive(serde::Serialize)]
struct AircraftView<'a> {
    icao: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    callsign: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    squawk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude_ft: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed_kts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed_type: Option<SpeedType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    heading_deg: Option<f64>,
    heading_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    vertical_rate_fpm: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vertical_rate_source: Option<VerticalRateSource>,
    mlat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<f64>,
    last_ping: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pos: Option<f64>,
    messages: u64,
}

impl Serialize for AircraftState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        AircraftView {
            icao: icao_to_string(&self.icao),
            callsign: self.callsign.as_deref(),
            squawk: self.squawk_string(),
            lat: self.lat,
            lon: self.lon,
            altitude_ft: self.altitude_ft,
            speed_kts: self.speed_kts,
            speed_type: self.speed_type,
            heading_deg: self.heading_deg,
            heading_valid: self.heading_valid,
            vertical_rate_fpm: self.vertical_rate_fpm,
            vertical_rate_source: self.vertical_rate_source,
            mlat: self.mlat,
            rssi: self.rssi_dbfs(),
            last_ping: self.last_ping,
            last_pos: self.last_pos,
            messages: self.message_count,
        }
        .serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squitter::decode_squitter;

    const ICAO: Icao = [0x40, 0x62, 0x1D];
    const EVEN: &str = "8D40621D58C382D690C8AC2863A7";
    const ODD: &str = "8D40621D58C386435CC412692AD6";

    fn squitter(hex: &str) -> SquitterMsg {
        decode_squitter(&hex_decode(hex).unwrap()).unwrap()
    }

    fn position(lat: u32, lon: u32, parity: Parity) -> SquitterMsg {
        SquitterMsg::Position(PositionMsg {
            altitude_ft: None,
            cpr_lat: lat,
            cpr_lon: lon,
            parity,
            time_synced: false,
            is_surface: false,
        })
    }

    #[test]
    fn test_new_state_is_unknown() {
        let ac = AircraftState::new(ICAO, 100.0);
        assert!(!ac.has_position());
        assert_eq!(ac.altitude_ft, None);
        assert_eq!(ac.squawk, None);
        assert_eq!(ac.last_ping, 100.0);
        assert_eq!(ac.rssi_dbfs(), None);
    }

    #[test]
    fn test_cpr_pair_resolves_and_clears() {
        let mut ac = AircraftState::new(ICAO, 0.0);
        assert_eq!(ac.apply_squitter(&squitter(ODD), 1.0, None), None);
        assert!(ac.odd_cpr.is_some());

        let (lat, lon) = ac.apply_squitter(&squitter(EVEN), 2.0, None).unwrap();
        assert!((lat - 52.2572).abs() < 1e-3);
        assert!((lon - 3.9194).abs() < 1e-3);
        assert_eq!(ac.lat, Some(lat));
        assert_eq!(ac.last_pos, Some(2.0));
        assert_eq!(ac.altitude_ft, Some(38000));
        assert!(ac.even_cpr.is_none());
        assert!(ac.odd_cpr.is_none());
    }

    #[test]
    fn test_same_parity_overwrites() {
        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.apply_squitter(&position(1, 1, Parity::Even), 1.0, None);
        ac.apply_squitter(&position(2, 2, Parity::Even), 2.0, None);
        assert_eq!(ac.even_cpr.unwrap().frame, CprFrame { lat: 2, lon: 2 });
        assert!(ac.odd_cpr.is_none());
        assert!(!ac.has_position());
    }

    #[test]
    fn test_inconsistent_pair_keeps_partner() {
        let even = cpr::encode(10.46, 20.0, Parity::Even, false);
        let odd = cpr::encode(10.48, 20.0, Parity::Odd, false);
        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.apply_squitter(&position(even.lat, even.lon, Parity::Even), 1.0, None);
        assert_eq!(
            ac.apply_squitter(&position(odd.lat, odd.lon, Parity::Odd), 2.0, None),
            None
        );
        assert!(!ac.has_position());
        assert_eq!(ac.even_cpr.unwrap().frame, even);
        assert_eq!(ac.odd_cpr.unwrap().frame, odd);
    }

    #[test]
    fn test_stale_partner_not_paired() {
        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.apply_squitter(&squitter(ODD), 1.0, None);
        assert_eq!(ac.apply_squitter(&squitter(EVEN), 20.0, None), None);
        assert!(ac.odd_cpr.is_none());
        assert!(ac.even_cpr.is_some());
    }

    #[test]
    fn test_surface_needs_reference() {
        let (lat, lon) = (51.47, -0.4543);
        let even = cpr::encode(lat, lon, Parity::Even, true);
        let odd = cpr::encode(lat, lon, Parity::Odd, true);
        let surf = |f: CprFrame, parity| {
            SquitterMsg::Position(PositionMsg {
                altitude_ft: None,
                cpr_lat: f.lat,
                cpr_lon: f.lon,
                parity,
                time_synced: false,
                is_surface: true,
            })
        };

        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.apply_squitter(&surf(even, Parity::Even), 1.0, None);
        assert_eq!(ac.apply_squitter(&surf(odd, Parity::Odd), 2.0, None), None);

        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.apply_squitter(&surf(even, Parity::Even), 1.0, Some((51.5, -0.1)));
        let (dlat, dlon) = ac
            .apply_squitter(&surf(odd, Parity::Odd), 2.0, Some((51.5, -0.1)))
            .unwrap();
        assert!((dlat - lat).abs() < 1e-4);
        assert!((dlon - lon).abs() < 1e-4);
    }

    #[test]
    fn test_surface_and_airborne_do_not_pair() {
        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.apply_squitter(&squitter(EVEN), 1.0, None);
        let odd_surface = SquitterMsg::Position(PositionMsg {
            altitude_ft: None,
            cpr_lat: 74158,
            cpr_lon: 50194,
            parity: Parity::Odd,
            time_synced: false,
            is_surface: true,
        });
        assert_eq!(ac.apply_squitter(&odd_surface, 2.0, Some((52.0, 4.0))), None);
        assert!(!ac.has_position());
    }

    #[test]
    fn test_merge_keeps_known_fields() {
        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.set_squawk(0x7700);
        ac.set_squawk(0);
        assert_eq!(ac.squawk_string().as_deref(), Some("7700"));

        ac.set_altitude(Some(1000));
        ac.set_altitude(None);
        assert_eq!(ac.altitude_ft, Some(1000));

        ac.apply_squitter(
            &SquitterMsg::Identification(IdentificationMsg {
                callsign: "KLM1023".into(),
                category: 0,
            }),
            1.0,
            None,
        );
        ac.apply_squitter(
            &SquitterMsg::Identification(IdentificationMsg {
                callsign: String::new(),
                category: 0,
            }),
            2.0,
            None,
        );
        assert_eq!(ac.callsign.as_deref(), Some("KLM1023"));
    }

    #[test]
    fn test_touch_sets_mlat_sticky() {
        let mut ac = AircraftState::new(ICAO, 0.0);
        ac.touch(200, true, 5.0);
        ac.touch(100, false, 6.0);
        assert!(ac.mlat);
        assert_eq!(ac.signal, 100);
        assert_eq!(ac.last_ping, 6.0);
        assert_eq!(ac.message_count, 2);
    }

    #[test]
    fn test_is_stale() {
        let ac = AircraftState::new(ICAO, 100.0);
        assert!(!ac.is_stale(159.0, 59.0));
        assert!(ac.is_stale(159.5, 59.0));
    }

    #[test]
    fn test_serialize_json() {
        let mut ac = AircraftState::new(ICAO, 10.0);
        ac.set_squawk(0x0356);
        ac.callsign = Some("SWA467".into());
        let json = serde_json::to_value(&ac).unwrap();
        assert_eq!(json["icao"], "40621D");
        assert_eq!(json["squawk"], "0356");
        assert_eq!(json["callsign"], "SWA467");
        assert!(json.get("lat").is_none());
        assert!(json.get("altitude_ft").is_none());
        assert_eq!(json["mlat"], false);
    }
}
