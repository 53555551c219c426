//! WAL segment naming
//!
//! A segment file is named by 24 hex digits: timeline, log and segment, 8
//! digits each. With 16 MiB segments there are 256 segments per log.

use std::fmt;
use std::str::FromStr;

use super::lsn::Lsn;
use crate::controller::error::Error;

pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const SEGMENTS_PER_LOG: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
    pub timeline: u32,
    pub log: u32,
    pub segment: u32,
}

impl WalSegment {
    /// Segment holding `lsn` on `timeline`
    pub fn from_lsn(timeline: u32, lsn: Lsn) -> Self {
        let seg_no = lsn.0 / WAL_SEGMENT_SIZE;
        Self {
            timeline,
            log: u32::try_from(seg_no / SEGMENTS_PER_LOG).unwrap_or(u32::MAX),
            segment: u32::try_from(seg_no % SEGMENTS_PER_LOG).unwrap_or(0),
        }
    }

    fn seg_no(&self) -> u64 {
        u64::from(self.log) * SEGMENTS_PER_LOG + u64::from(self.segment)
    }

    /// Following segment on the same timeline
    pub fn next(&self) -> Self {
        let n = self.seg_no() + 1;
        Self {
            timeline: self.timeline,
            log: u32::try_from(n / SEGMENTS_PER_LOG).unwrap_or(u32::MAX),
            segment: u32::try_from(n % SEGMENTS_PER_LOG).unwrap_or(0),
        }
    }

    /// Inclusive range of segments from `self` to `end`
    pub fn range_to(&self, end: &WalSegment) -> Vec<WalSegment> {
        let mut out = Vec::new();
        if end.timeline != self.timeline || end < self {
            return out;
        }
        let mut current = *self;
        while current <= *end {
            out.push(current);
            current = current.next();
        }
        out
    }

    /// Archive folder used by barman-cloud: timeline and log part of the name
    pub fn archive_dir(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.log)
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.log, self.segment)
    }
}

impl FromStr for WalSegment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::ValidationError(format!("invalid WAL segment name '{}'", s));
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let part = |range: std::ops::Range<usize>| {
            s.get(range)
                .and_then(|p| u32::from_str_radix(p, 16).ok())
                .ok_or_else(invalid)
        };
        Ok(Self {
            timeline: part(0..8)?,
            log: part(8..16)?,
            segment: part(16..24)?,
        })
    }
}

/// Name of a timeline history file, e.g. `00000002.history`
pub fn history_file_name(timeline: u32) -> String {
    format!("{:08X}.history", timeline)
}

/// Parse the timeline out of a history file name
pub fn parse_history_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".history")?;
    if stem.len() != 8 {
        return None;
    }
    u32::from_str_radix(stem, 16).ok()
}
