//! WAL positions.
//!
//! An [`Lsn`] is the 64-bit byte position in the write-ahead log. PostgreSQL
//! prints it as two hex halves separated by a slash (`16/B374D848`), and that
//! is the form used in replication commands such as `START_REPLICATION`.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(pub String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN: {}", self.0)
    }
}
impl std::error::Error for ParseLsnError {}

/// Log sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// `InvalidXLogRecPtr`. As a start position it means "wherever the slot
    /// last confirmed".
    pub const ZERO: Lsn = Lsn(0);

    pub fn parse(s: &str) -> Result<Lsn, ParseLsnError> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| ParseLsnError(s.into()))?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(ParseLsnError(s.into()));
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.into()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }

    pub fn to_pg_string(self) -> String {
        format!("{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pg_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Lsn;

    #[test]
    fn lsn_parse_roundtrip() {
        let s = "16/B374D848";
        let l = Lsn::parse(s).unwrap();
        assert_eq!(l.to_pg_string(), s);
        assert_eq!(l.0, 0x16_B374_D848);
    }

    #[test]
    fn lsn_parse_rejects_garbage() {
        assert!(Lsn::parse("").is_err());
        assert!(Lsn::parse("16").is_err());
        assert!(Lsn::parse("/1").is_err());
        assert!(Lsn::parse("G/1").is_err());
        assert!(Lsn::parse("123456789/0").is_err());
    }

    #[test]
    fn lsn_extremes_format() {
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
        assert_eq!(Lsn(u64::MAX).to_string(), "FFFFFFFF/FFFFFFFF");
        assert_eq!("FFFFFFFF/FFFFFFFF".parse::<Lsn>().unwrap(), Lsn(u64::MAX));
    }

    #[test]
    fn lsn_orders_by_position() {
        assert!(Lsn::parse("1/0").unwrap() > Lsn::parse("0/FFFFFFFF").unwrap());
        assert_eq!(Lsn(5).max(Lsn(3)), Lsn(5));
    }
}
