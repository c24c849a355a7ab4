//! SQL Server log sequence numbers

use crate::common::{fixed_width, LogPosition, Result};
use std::fmt;

/// LSN (Log Sequence Number) for SQL Server
///
/// SQL Server uses 10-byte binary LSNs consisting of:
/// - VLF sequence number (4 bytes)
/// - Log block offset (4 bytes)
/// - Slot number (2 bytes)
///
/// `bytes == None` is the null LSN returned by the CDC functions when no
/// position exists (e.g. `fn_cdc_get_min_lsn` for an unknown capture
/// instance). It sorts before every real LSN and is the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn {
    bytes: Option<[u8; 10]>,
}

impl Lsn {
    pub const NULL: Lsn = Lsn { bytes: None };

    pub fn new(bytes: [u8; 10]) -> Self {
        Self { bytes: Some(bytes) }
    }

    pub fn from_parts(vlf: u32, offset: u32, slot: u16) -> Self {
        let mut bytes = [0u8; 10];
        bytes[..4].copy_from_slice(&vlf.to_be_bytes());
        bytes[4..8].copy_from_slice(&offset.to_be_bytes());
        bytes[8..].copy_from_slice(&slot.to_be_bytes());
        Self::new(bytes)
    }

    pub fn bytes(&self) -> Option<&[u8; 10]> {
        self.bytes.as_ref()
    }
}

impl LogPosition for Lsn {
    /// `__$seqval`, itself an LSN
    type Sequence = Lsn;

    const WIDTH: usize = 10;
    const BACKEND: &'static str = "sqlserver";

    fn null() -> Self {
        Self::NULL
    }

    fn is_null(&self) -> bool {
        self.bytes.is_none()
    }

    fn from_bytes(bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            None => Ok(Self::NULL),
            Some(b) => Ok(Self::new(fixed_width::<10>(Self::BACKEND, b)?)),
        }
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.bytes.map(|b| b.to_vec())
    }

    fn encode_sequence(sequence: &Lsn) -> String {
        sequence.to_hex()
    }

    fn decode_sequence(text: &str) -> Result<Lsn> {
        Lsn::from_hex(text)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(b) = &self.bytes else {
            return write!(f, "NULL");
        };
        // SQL Server style: VLF:Offset:Slot
        let vlf = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let offset = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
        let slot = u16::from_be_bytes([b[8], b[9]]);
        write!(f, "{:08X}:{:08X}:{:04X}", vlf, offset, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_hex() {
        let hex = "00000001000000010001";
        let lsn = Lsn::from_hex(hex).unwrap();
        assert_eq!(lsn.to_hex(), hex);
        assert_eq!(lsn, Lsn::from_parts(1, 1, 1));

        assert!(Lsn::from_hex("0001").is_err());
        assert!(Lsn::from_hex("zz000001000000010001").is_err());
        assert_eq!(Lsn::from_hex("NULL").unwrap(), Lsn::NULL);
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn::from_parts(1, 0xFFFF_FFFF, 0xFFFF);
        let b = Lsn::from_parts(2, 0, 0);
        assert!(a < b);
        // unsigned: 0x80 > 0x7F
        assert!(Lsn::from_parts(0x7F00_0000, 0, 0) < Lsn::from_parts(0x8000_0000, 0, 0));
        assert!(Lsn::NULL < Lsn::from_parts(0, 0, 0));
    }

    #[test]
    fn test_lsn_default_is_null() {
        assert_eq!(Lsn::default(), Lsn::NULL);
        assert!(Lsn::default().is_null());
    }

    #[test]
    fn test_lsn_bytes_round_trip() {
        let lsn = Lsn::from_parts(0x24, 0x1F0, 0x3);
        let bytes = lsn.to_bytes();
        assert_eq!(Lsn::from_bytes(bytes.as_deref()).unwrap(), lsn);
        assert_eq!(Lsn::from_bytes(None).unwrap(), Lsn::NULL);
        assert!(Lsn::NULL.to_bytes().is_none());
        assert!(Lsn::from_bytes(Some(&[0u8; 8])).is_err());
    }

    #[test]
    fn test_lsn_display() {
        let lsn = Lsn::from_parts(0x24, 0x1F0, 0x3);
        assert_eq!(lsn.to_string(), "00000024:000001F0:0003");
        assert_eq!(Lsn::NULL.to_string(), "NULL");
    }

    #[test]
    fn test_in_range_closed() {
        let lo = Lsn::from_parts(1, 0, 0);
        let hi = Lsn::from_parts(3, 0, 0);
        assert!(lo.in_range(&lo, &hi));
        assert!(hi.in_range(&lo, &hi));
        assert!(Lsn::from_parts(2, 0, 0).in_range(&lo, &hi));
        assert!(!Lsn::from_parts(4, 0, 0).in_range(&lo, &hi));
        assert!(lo.in_range(&lo, &lo));
    }
}
