//! Mode S CRC-24 parity.
//!
//! Generator polynomial 0xFFF409. The last 24 bits of every Mode S reply are
//! the parity field. Extended squitters (DF17/18) and all-call replies (DF11)
//! carry plain parity, so a clean frame leaves a residual of 0. Surveillance
//! and Comm-B replies (DF0/4/5/16/20/21) overlay the parity with the
//! transponder address, so the residual *is* the address.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::types::{icao_from_u32, Icao};

const GENERATOR: u32 = 0xFFF409;

// ---------------------------------------------------------------------------
// CRC lookup table (compile-time)
// ---------------------------------------------------------------------------

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x800000 != 0 {
                crc = (crc << 1) ^ GENERATOR;
            } else {
                crc <<= 1;
            }
            crc &= 0xFFFFFF;
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_crc_table();

// ---------------------------------------------------------------------------
// Residual computation
// ---------------------------------------------------------------------------

/// Parity residual of a complete Mode S reply.
///
/// Divides everything but the trailing 3 bytes, then XORs with the parity
/// field. Zero for an intact DF11/17/18 frame, the transponder address for
/// address/parity replies.
pub fn crc24(data: &[u8]) -> u32 {
    if data.len() <= 3 {
        return data.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32) & 0xFFFFFF;
    }

    let split = data.len() - 3;
    let crc = divide(&data[..split]);
    crc ^ ((data[split] as u32) << 16 | (data[split + 1] as u32) << 8 | data[split + 2] as u32)
}

fn divide(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &byte| {
        ((crc << 8) ^ CRC_TABLE[((crc >> 16) ^ byte as u32) as usize & 0xFF]) & 0xFFFFFF
    })
}

/// Parity bytes a sender would append to `body` so that the frame checks clean.
pub fn parity(body: &[u8]) -> [u8; 3] {
    let crc = divide(body);
    [(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]
}

/// True when a plain-parity frame has a zero residual.
pub fn is_valid(data: &[u8]) -> bool {
    crc24(data) == 0
}

/// Recover the transponder address overlaid on the parity field.
pub fn address_from_residual(data: &[u8]) -> Icao {
    icao_from_u32(crc24(data))
}

// ---------------------------------------------------------------------------
// Syndrome tables for error correction
// ---------------------------------------------------------------------------

fn build_syndrome_table(n_bits: usize) -> HashMap<u32, Vec<usize>> {
    let n_bytes = n_bits / 8;
    let mut table = HashMap::new();

    for bit in 0..n_bits {
        let mut msg = vec![0u8; n_bytes];
        msg[bit / 8] |= 1 << (7 - (bit % 8));
        table.entry(crc24(&msg)).or_insert_with(|| vec![bit]);
    }

    for bit1 in 0..n_bits {
        for bit2 in (bit1 + 1)..n_bits {
            let mut msg = vec![0u8; n_bytes];
            msg[bit1 / 8] |= 1 << (7 - (bit1 % 8));
            msg[bit2 / 8] |= 1 << (7 - (bit2 % 8));
            table.entry(crc24(&msg)).or_insert_with(|| vec![bit1, bit2]);
        }
    }

    table
}

static SYNDROME_TABLE_112: LazyLock<HashMap<u32, Vec<usize>>> =
    LazyLock::new(|| build_syndrome_table(112));
static SYNDROME_TABLE_56: LazyLock<HashMap<u32, Vec<usize>>> =
    LazyLock::new(|| build_syndrome_table(56));

/// Attempt to repair 1-2 bit errors in a plain-parity frame.
///
/// Never flips bits 0-4 (the DF field), so a repair cannot turn one message
/// type into another. Returns the repaired bytes, or `None` when the syndrome
/// is unknown or the repair does not check clean.
pub fn try_fix(data: &[u8]) -> Option<Vec<u8>> {
    let syndrome = crc24(data);
    if syndrome == 0 {
        return Some(data.to_vec());
    }

    let table = match data.len() * 8 {
        112 => &*SYNDROME_TABLE_112,
        56 => &*SYNDROME_TABLE_56,
        _ => return None,
    };

    let bit_positions = table.get(&syndrome)?;
    if bit_positions.iter().any(|&b| b < 5) {
        return None;
    }

    let mut fixed = data.to_vec();
    for &bit in bit_positions {
        fixed[bit / 8] ^= 1 << (7 - (bit % 8));
    }

    if crc24(&fixed) != 0 {
        return None;
    }
    Some(fixed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
