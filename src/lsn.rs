//! WAL positions
//!
//! An [`Lsn`] identifies a byte position in the server's write-ahead log.
//! On the wire it is a big-endian u64; in SQL-level commands and results
//! (`IDENTIFY_SYSTEM`, `START_REPLICATION`) it travels as text in the form
//! `upper_hex/lower_hex`, e.g. `16/B374D848`.

use crate::errors::ReplicationError;
use std::fmt;
use std::str::FromStr;

/// A position in the write-ahead log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid/zero position; `START_REPLICATION` at this position
    /// resumes from the slot's confirmed location.
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Lsn {
    fn from(raw: u64) -> Self {
        Lsn(raw)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (upper, lower) = s
            .split_once('/')
            .ok_or_else(|| ReplicationError::protocol(format!("malformed LSN '{s}'")))?;
        let upper = u32::from_str_radix(upper, 16)
            .map_err(|_| ReplicationError::protocol(format!("malformed LSN '{s}'")))?;
        let lower = u32::from_str_radix(lower, 16)
            .map_err(|_| ReplicationError::protocol(format!("malformed LSN '{s}'")))?;
        Ok(Lsn(((upper as u64) << 32) | lower as u64))
    }
}
