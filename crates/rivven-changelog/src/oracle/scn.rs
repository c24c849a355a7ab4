//! Oracle system change numbers

use crate::common::{fixed_width, CdcError, LogPosition, Result};
use std::fmt;

/// SCN (System Change Number) for Oracle
///
/// Stored as 8 bytes big-endian, so byte order and numeric order agree.
/// `value == None` is the null SCN; it sorts before every real SCN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scn {
    value: Option<u64>,
}

impl Scn {
    pub const NULL: Scn = Scn { value: None };

    pub fn new(value: u64) -> Self {
        Self { value: Some(value) }
    }

    pub fn value(&self) -> Option<u64> {
        self.value
    }

    /// The SCN immediately after this one
    pub fn next(&self) -> Result<Scn> {
        let value = self
            .value
            .ok_or_else(|| CdcError::invalid_position("Cannot increment the NULL SCN"))?;
        value
            .checked_add(1)
            .map(Scn::new)
            .ok_or_else(|| CdcError::invalid_position(format!("SCN {} overflows", value)))
    }
}

impl LogPosition for Scn {
    /// Redo record order within one SCN
    type Sequence = u64;

    const WIDTH: usize = 8;
    const BACKEND: &'static str = "oracle";

    fn null() -> Self {
        Self::NULL
    }

    fn is_null(&self) -> bool {
        self.value.is_none()
    }

    fn from_bytes(bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            None => Ok(Self::NULL),
            Some(b) => Ok(Self::new(u64::from_be_bytes(fixed_width::<8>(
                Self::BACKEND,
                b,
            )?))),
        }
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.value.map(|v| v.to_be_bytes().to_vec())
    }

    fn encode_sequence(sequence: &u64) -> String {
        sequence.to_string()
    }

    fn decode_sequence(text: &str) -> Result<u64> {
        text.parse()
            .map_err(|_| CdcError::invalid_position(format!("Invalid redo sequence '{}'", text)))
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "NULL"),
        }
    }
}
