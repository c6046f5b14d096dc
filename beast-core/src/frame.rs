//! Classify Beast frames.
//!
//! Layout after the splitter has removed the delimiter:
//!
//! ```text
//! [type:1][timestamp:6][signal:1][payload:N]
//! ```
//!
//! - 0x31: Mode A/C, N = 2, 10 bytes total
//! - 0x32: Mode S short, N = 7, 15 bytes total
//! - 0x33: Mode S long, N = 14, 22 bytes total
//! - 0x34: status/other, never accepted
//!
//! Malformed frames are routine line noise. They are counted and dropped,
//! never surfaced as hard errors.

use std::fmt;

use crate::metrics::MetricsSink;

/// Timestamp value a multilateration server stamps on its synthetic frames.
pub const MLAT_MAGIC: [u8; 6] = [0xFF, 0x00, 0x4D, 0x4C, 0x41, 0x54];

const HEADER_LEN: usize = 8;

/// Message family selected by the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ModeAc,
    ModeSShort,
    ModeSLong,
}

impl MessageKind {
    /// Map a type byte to its family. 0x34 and anything else are `None`.
    pub fn from_type_byte(b: u8) -> Option<Self> {
        match b {
            0x31 => Some(MessageKind::ModeAc),
            0x32 => Some(MessageKind::ModeSShort),
            0x33 => Some(MessageKind::ModeSLong),
            _ => None,
        }
    }

    /// Total frame length including the header.
    pub fn expected_len(self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    pub fn payload_len(self) -> usize {
        match self {
            MessageKind::ModeAc => 2,
            MessageKind::ModeSShort => 7,
            MessageKind::ModeSLong => 14,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::ModeAc => write!(f, "Mode A/C"),
            MessageKind::ModeSShort => write!(f, "Mode S short"),
            MessageKind::ModeSLong => write!(f, "Mode S long"),
        }
    }
}

/// Expected total length for a type byte, `None` when the type is rejected.
pub fn expected_length(type_byte: u8) -> Option<usize> {
    MessageKind::from_type_byte(type_byte).map(MessageKind::expected_len)
}

// ---------------------------------------------------------------------------
// Header fields
// ---------------------------------------------------------------------------

/// The 6-byte receiver timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeastTimestamp {
    /// Frame synthesized by a multilateration network.
    Mlat,
    /// GPS-disciplined receiver clock.
    Gps { seconds_of_day: u32, nanos: u32 },
}

impl BeastTimestamp {
    pub fn parse(raw: &[u8; 6]) -> Self {
        if *raw == MLAT_MAGIC {
            return BeastTimestamp::Mlat;
        }
        let value = raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
        BeastTimestamp::Gps {
            seconds_of_day: (value >> 30) as u32,
            nanos: (value & 0x3FFF_FFFF) as u32,
        }
    }

    pub fn is_mlat(&self) -> bool {
        matches!(self, BeastTimestamp::Mlat)
    }
}

/// One accepted Beast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeastFrame {
    pub kind: MessageKind,
    pub timestamp: BeastTimestamp,
    /// Raw signal level byte (0-255).
    pub signal: u8,
    pub payload: Vec<u8>,
}

impl BeastFrame {
    pub fn is_mlat(&self) -> bool {
        self.timestamp.is_mlat()
    }
}

/// Signal level in dBFS, `None` for a zero level.
pub fn rssi_dbfs(signal: u8) -> Option<f64> {
    if signal == 0 {
        return None;
    }
    let ratio = signal as f64 / 255.0;
    Some(10.0 * (ratio * ratio).log10())
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Why a frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Nothing between two delimiters.
    Empty,
    /// First byte is not 0x31-0x34.
    UnknownType(u8),
    /// Type 0x34.
    Unsupported,
    /// Length does not match the type byte.
    BadLength { expected: usize, actual: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty => write!(f, "empty frame"),
            FrameError::UnknownType(t) => write!(f, "unknown message type {t:#04x}"),
            FrameError::Unsupported => write!(f, "unsupported message type 0x34"),
            FrameError::BadLength { expected, actual } => {
                write!(f, "length {actual}, expected {expected}")
            }
        }
    }
}

/// Check type and length and split out the header fields.
pub fn classify(frame: &[u8]) -> Result<BeastFrame, FrameError> {
    let &type_byte = frame.first().ok_or(FrameError::Empty)?;
    let kind = match MessageKind::from_type_byte(type_byte) {
        Some(kind) => kind,
        None if type_byte == 0x34 => return Err(FrameError::Unsupported),
        None => return Err(FrameError::UnknownType(type_byte)),
    };

    let expected = kind.expected_len();
    if frame.len() != expected {
        return Err(FrameError::BadLength {
            expected,
            actual: frame.len(),
        });
    }

    let mut ts = [0u8; 6];
    ts.copy_from_slice(&frame[1..7]);

    Ok(BeastFrame {
        kind,
        timestamp: BeastTimestamp::parse(&ts),
        signal: frame[7],
        payload: frame[HEADER_LEN..].to_vec(),
    })
}

/// [`classify`] plus accounting: accepted frames bump their type counter and
/// the good rate, everything except empty frames bumps the bad rate.
pub fn classify_counted(frame: &[u8], sink: &dyn MetricsSink) -> Result<BeastFrame, FrameError> {
    let result = classify(frame);
    match &result {
        Ok(f) => sink.frame_accepted(f.kind),
        Err(FrameError::Empty) => {}
        Err(_) => sink.frame_rejected(),
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
