//! Position syntax and the position -> score mapping.
//!
//! Three disjoint namespaces share one global order:
//! * Postgres LSN `H/L` (hex halves of a 64-bit WAL offset),
//! * MySQL binlog `<file>.<filenum>:<offset>`,
//! * synthetic bootstrap `0/BOOTSTRAP<seq>` with a fixed-width sequence.
//!
//! The score function is the only place that inspects position strings;
//! every other component treats them as opaque.

use crate::err::{KResult, KashoError};

/// Prefix of synthetic positions assigned to dump-derived changes.
pub const BOOTSTRAP_PREFIX: &str = "0/BOOTSTRAP";

/// Width of the bootstrap sequence component.
pub const BOOTSTRAP_SEQ_WIDTH: usize = 16;

/// Bootstrap scores are shifted down by this much so a full dump sorts
/// strictly below any live position even when primary LSNs start near zero.
pub const BOOTSTRAP_SCORE_OFFSET: i64 = 1_000_000;

/// Map a position string onto the single global order.
///
/// * bootstrap -> `seq - 1_000_000` (negative band)
/// * Postgres LSN -> the 64-bit WAL offset
/// * MySQL binlog -> `filenum * 2^32 + offset`
pub fn score(position: &str) -> KResult<f64> {
    if let Some(seq) = position.strip_prefix(BOOTSTRAP_PREFIX) {
        if seq.len() < BOOTSTRAP_SEQ_WIDTH || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KashoError::InvalidPosition(position.to_string()));
        }
        let seq: i64 = seq
            .parse()
            .map_err(|_| KashoError::InvalidPosition(position.to_string()))?;
        return Ok((seq - BOOTSTRAP_SCORE_OFFSET) as f64);
    }
    if let Some(lsn) = parse_lsn(position) {
        return Ok(lsn as f64);
    }
    if let Some((filenum, offset)) = parse_binlog(position) {
        return Ok((filenum as f64) * ((1u64 << 32) as f64) + offset as f64);
    }
    Err(KashoError::InvalidPosition(position.to_string()))
}

/// `H/L` with hex halves, e.g. `0/16A3210`.
pub fn parse_lsn(position: &str) -> Option<u64> {
    let (high, low) = position.split_once('/')?;
    if high.is_empty() || low.is_empty() {
        return None;
    }
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    if high > u32::MAX as u64 || low > u32::MAX as u64 {
        return None;
    }
    Some((high << 32) | low)
}

/// `<file>.<filenum>:<offset>`, e.g. `mysql-bin.000001:4`.
pub fn parse_binlog(position: &str) -> Option<(u32, u32)> {
    let (file, offset) = position.rsplit_once(':')?;
    let (_, filenum) = file.rsplit_once('.')?;
    if filenum.is_empty() || !filenum.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let filenum: u32 = filenum.parse().ok()?;
    let offset: u32 = offset.parse().ok()?;
    Some((filenum, offset))
}

pub fn is_bootstrap(position: &str) -> bool {
    position.starts_with(BOOTSTRAP_PREFIX)
}

/// Render a 64-bit WAL offset back to `H/L` form.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Render the n-th synthetic bootstrap position (1-based).
pub fn bootstrap_position(seq: u64) -> String {
    format!("{}{:0width$}", BOOTSTRAP_PREFIX, seq, width = BOOTSTRAP_SEQ_WIDTH)
}
