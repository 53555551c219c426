//! PostgreSQL log sequence numbers

use std::fmt;
use std::str::FromStr;

use crate::controller::error::Error;

/// A WAL position, printed by PostgreSQL as `XXXXXXXX/YYYYYYYY`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::ValidationError(format!("invalid LSN '{}'", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| Error::ValidationError(format!("invalid LSN '{}'", s)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| Error::ValidationError(format!("invalid LSN '{}'", s)))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}
