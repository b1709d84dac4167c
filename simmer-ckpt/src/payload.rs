use simmer_base::{err, Result};

use crate::timers::{Timers, TIMER_COUNT};

// Checkpoint payload layout, little-endian throughout:
//
//   1 byte   trailer flag (0 = none, 1 = ten diagnostic doubles follow)
//   8 * len  tile state
//   8 * 10   diagnostic timers, iff the flag says so
//
// The flag byte exists so a reader configured for debug timings can
// tell whether the writer actually produced them, instead of reading
// ten doubles of whatever happens to follow the tile.

const TRAILER_NONE: u8 = 0;
const TRAILER_TIMERS: u8 = 1;

pub fn encode_payload(tile: &[f64], timers: Option<&Timers>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 * (tile.len() + TIMER_COUNT));
    out.push(if timers.is_some() {
        TRAILER_TIMERS
    } else {
        TRAILER_NONE
    });
    for v in tile {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(t) = timers {
        for v in t.as_array() {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// Decode a payload into `tile`, returning the diagnostic trailer when
/// the writer produced one. A payload written without the trailer
/// yields `None` no matter what the reader hoped for.
pub fn decode_payload(bytes: &[u8], tile: &mut [f64]) -> Result<Option<Timers>> {
    let (flag, rest) = bytes
        .split_first()
        .ok_or_else(|| err("checkpoint payload empty"))?;
    let want = 8 * tile.len()
        + match *flag {
            TRAILER_NONE => 0,
            TRAILER_TIMERS => 8 * TIMER_COUNT,
            _ => return Err(err("checkpoint payload has unknown trailer flag")),
        };
    if rest.len() != want {
        return Err(err(format!(
            "checkpoint payload is {} bytes, expected {}",
            rest.len(),
            want
        )));
    }
    for (i, v) in tile.iter_mut().enumerate() {
        let mut b = [0u8; 8];
        b.copy_from_slice(&rest[8 * i..8 * i + 8]);
        *v = f64::from_le_bytes(b);
    }
    if *flag == TRAILER_NONE {
        return Ok(None);
    }
    let mut a = [0.0; TIMER_COUNT];
    let base = 8 * tile.len();
    for (i, v) in a.iter_mut().enumerate() {
        let mut b = [0u8; 8];
        b.copy_from_slice(&rest[base + 8 * i..base + 8 * i + 8]);
        *v = f64::from_le_bytes(b);
    }
    Ok(Some(Timers::from_array(a)))
}

/// Content checksum recorded in the dataset manifest and re-checked on
/// restore.
pub fn payload_checksum(bytes: &[u8]) -> u64 {
    rapidhash::rapidhash(bytes)
}
