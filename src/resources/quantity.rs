//! Storage quantity parsing
//!
//! PVC sizes are Kubernetes quantities ("10Gi", "500M", "1.5Ti"). The resize
//! coordinator compares them as byte counts.

use crate::controller::error::{Error, Result};

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

pub const GI: u64 = 1 << 30;
pub const MI: u64 = 1 << 20;

/// Parse a quantity into bytes, rounding fractional bytes up
pub fn parse_quantity(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let multiplier = if suffix.is_empty() {
        1
    } else {
        BINARY_SUFFIXES
            .iter()
            .chain(DECIMAL_SUFFIXES.iter())
            .find(|(s, _)| *s == suffix)
            .map(|(_, m)| *m)
            .ok_or_else(|| invalid(value))?
    };

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid(value));
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid(value))?
    };
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(|| invalid(value))?;

    if !fraction.is_empty() {
        let digits = u32::try_from(fraction.len()).map_err(|_| invalid(value))?;
        let scale = 10u128.checked_pow(digits).ok_or_else(|| invalid(value))?;
        let fraction: u128 = fraction.parse().map_err(|_| invalid(value))?;
        let extra = (fraction * u128::from(multiplier)).div_ceil(scale);
        let extra = u64::try_from(extra).map_err(|_| invalid(value))?;
        bytes = bytes.checked_add(extra).ok_or_else(|| invalid(value))?;
    }

    Ok(bytes)
}

fn invalid(value: &str) -> Error {
    Error::InvalidConfig(format!("invalid quantity '{}'", value))
}

/// Format bytes with the largest binary suffix that divides them exactly
pub fn format_quantity(bytes: u64) -> String {
    BINARY_SUFFIXES
        .iter()
        .rev()
        .find(|(_, m)| bytes >= *m && bytes % m == 0)
        .map(|(s, m)| format!("{}{}", bytes / m, s))
        .unwrap_or_else(|| bytes.to_string())
}

/// Round up to a whole number of mebibytes
pub fn round_up_to_mi(bytes: u64) -> u64 {
    bytes.div_ceil(MI).saturating_mul(MI)
}
